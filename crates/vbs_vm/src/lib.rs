//! Bytecode compiler and stack machine for VBScript programs.
//!
//! Source is parsed by `vbs_parser`, lowered to a [`Function`] by [`compile`]
//! and executed by a [`Vm`] that defers variables, library functions and
//! objects to a [`Host`].

use std::sync::Arc;

mod bytecode;
mod cache;
mod compiler;
mod config;
mod error;
mod host;
mod value;
mod vm;

pub use bytecode::{disassemble, Bytecode, Constant, Function, OpCode};
pub use cache::{BytecodeCache, CACHE_VERSION};
pub use compiler::{compile, Compiler};
pub use config::{CacheConfig, CompileOptions, VmConfig};
pub use error::{CompileError, Error, VmError};
pub use host::{DefaultHost, Host, HostObject};
pub use value::{Value, VbArray};
pub use vm::Vm;

/// Compiles `source` through the process-wide [`BytecodeCache`].
pub fn compile_cached(source: &str, options: &CompileOptions) -> Result<Arc<Function>, Error> {
    BytecodeCache::global().get_or_compile(source, options, |source| {
        let program = vbs_parser::parse_program(source)?;
        Ok(compile(&program)?)
    })
}

/// Parses, compiles and runs `source` against `host` with default limits.
pub fn run_source(source: &str, host: &mut dyn Host) -> Result<Value, Error> {
    let function = compile_cached(source, &CompileOptions::default())?;
    Ok(Vm::new(host).run(&function)?)
}
