use std::fmt::Write as _;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use vbs_syntax::{ClassDecl, CompareMode, Stmt};

use crate::value::Value;

/// One byte per opcode. Multi-byte operands are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Constant,
    Empty,
    Null,
    Nothing,
    Missing,
    True,
    False,
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
    Neg,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
    Not,
    And,
    Or,
    Xor,
    Eqv,
    Imp,
    GetGlobal,
    SetGlobal,
    GetLocal,
    SetLocal,
    IncLocal,
    IncGlobal,
    Pop,
    Dup,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    CallMethod,
    Return,
    ReturnValue,
    New,
    GetMember,
    SetMember,
    SetIndexed,
    ReDim,
    Erase,
    ForCheck,
    ForStep,
    IterNew,
    IterNext,
    ExecAst,
}

const ALL_OPCODES: [OpCode; 55] = [
    OpCode::Constant,
    OpCode::Empty,
    OpCode::Null,
    OpCode::Nothing,
    OpCode::Missing,
    OpCode::True,
    OpCode::False,
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Div,
    OpCode::IntDiv,
    OpCode::Mod,
    OpCode::Pow,
    OpCode::Neg,
    OpCode::Concat,
    OpCode::Eq,
    OpCode::Ne,
    OpCode::Lt,
    OpCode::Le,
    OpCode::Gt,
    OpCode::Ge,
    OpCode::Is,
    OpCode::Not,
    OpCode::And,
    OpCode::Or,
    OpCode::Xor,
    OpCode::Eqv,
    OpCode::Imp,
    OpCode::GetGlobal,
    OpCode::SetGlobal,
    OpCode::GetLocal,
    OpCode::SetLocal,
    OpCode::IncLocal,
    OpCode::IncGlobal,
    OpCode::Pop,
    OpCode::Dup,
    OpCode::Jump,
    OpCode::JumpIfFalse,
    OpCode::Loop,
    OpCode::Call,
    OpCode::CallMethod,
    OpCode::Return,
    OpCode::ReturnValue,
    OpCode::New,
    OpCode::GetMember,
    OpCode::SetMember,
    OpCode::SetIndexed,
    OpCode::ReDim,
    OpCode::Erase,
    OpCode::ForCheck,
    OpCode::ForStep,
    OpCode::IterNew,
    OpCode::IterNext,
    OpCode::ExecAst,
];

/// `ReDim` flag: keep the elements that still fit.
pub const REDIM_PRESERVE: u8 = 0b01;
/// `ReDim` flag: the array comes from `Dim a(n)` and cannot be resized.
pub const REDIM_FIXED: u8 = 0b10;

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        ALL_OPCODES
            .get(byte as usize)
            .copied()
            .filter(|op| *op as u8 == byte)
    }

    /// Byte widths of the operands that follow the opcode.
    pub fn operand_widths(self) -> &'static [usize] {
        match self {
            OpCode::Constant
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::IncGlobal
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::Loop
            | OpCode::New
            | OpCode::GetMember
            | OpCode::SetMember
            | OpCode::ForCheck
            | OpCode::IterNext
            | OpCode::ExecAst => &[2],
            OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::IncLocal
            | OpCode::Call
            | OpCode::SetIndexed => &[1],
            OpCode::CallMethod => &[2, 1],
            OpCode::ReDim => &[1, 1],
            _ => &[],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Constant => "CONSTANT",
            OpCode::Empty => "EMPTY",
            OpCode::Null => "NULL",
            OpCode::Nothing => "NOTHING",
            OpCode::Missing => "MISSING",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::IntDiv => "INT_DIV",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Neg => "NEG",
            OpCode::Concat => "CONCAT",
            OpCode::Eq => "EQ",
            OpCode::Ne => "NE",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Gt => "GT",
            OpCode::Ge => "GE",
            OpCode::Is => "IS",
            OpCode::Not => "NOT",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Xor => "XOR",
            OpCode::Eqv => "EQV",
            OpCode::Imp => "IMP",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::IncLocal => "INC_LOCAL",
            OpCode::IncGlobal => "INC_GLOBAL",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::Loop => "LOOP",
            OpCode::Call => "CALL",
            OpCode::CallMethod => "CALL_METHOD",
            OpCode::Return => "RETURN",
            OpCode::ReturnValue => "RETURN_VALUE",
            OpCode::New => "NEW",
            OpCode::GetMember => "GET_MEMBER",
            OpCode::SetMember => "SET_MEMBER",
            OpCode::SetIndexed => "SET_INDEXED",
            OpCode::ReDim => "REDIM",
            OpCode::Erase => "ERASE",
            OpCode::ForCheck => "FOR_CHECK",
            OpCode::ForStep => "FOR_STEP",
            OpCode::IterNew => "ITER_NEW",
            OpCode::IterNext => "ITER_NEXT",
            OpCode::ExecAst => "EXEC_AST",
        }
    }
}

/// Entries of the constant pool. Unlike [`Value`] these are immutable,
/// thread-safe and serializable, so compiled programs can be shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Float(f64),
    String(Arc<str>),
    Date(NaiveDateTime),
    Function(Arc<Function>),
    /// Call target the compiler could not resolve; looked up through the host.
    Builtin(Arc<str>),
    Class(Arc<ClassDecl>),
    /// Statement handed to the host by `ExecAst`.
    Ast(Arc<Stmt>),
}

impl Constant {
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Int(value) => Value::Int(*value),
            Constant::Float(value) => Value::Float(*value),
            Constant::String(value) => Value::String(Arc::clone(value)),
            Constant::Date(value) => Value::Date(*value),
            Constant::Function(function) => Value::Function(Arc::clone(function)),
            Constant::Builtin(name) => Value::Builtin(Arc::clone(name)),
            Constant::Class(class) => Value::Class(Arc::clone(class)),
            // Only read by `ExecAst`.
            Constant::Ast(_) => Value::Empty,
        }
    }

    fn describe(&self) -> String {
        match self {
            Constant::Int(value) => value.to_string(),
            Constant::Float(value) => format!("{value:?}"),
            Constant::String(value) => format!("{value:?}"),
            Constant::Date(value) => format!("#{value}#"),
            Constant::Function(function) => format!("<function {}>", function.name),
            Constant::Builtin(name) => format!("<builtin {name}>"),
            Constant::Class(class) => format!("<class {}>", class.name.name),
            Constant::Ast(stmt) => format!("<{}>", stmt.kind_name()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bytecode {
    pub instructions: Vec<u8>,
    /// Program-wide pool. Empty for nested functions, which read the pool of
    /// the program they were compiled with.
    pub constants: Vec<Constant>,
    /// Lowercase names of the global slots. Empty for nested functions.
    pub global_names: Vec<String>,
    pub compare_mode: CompareMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub bytecode: Bytecode,
    pub parameter_count: usize,
    /// Parameters included.
    pub local_count: usize,
}

impl Function {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Renders an instruction listing of `program` followed by every function in
/// its constant pool.
pub fn disassemble(program: &Function) -> String {
    let mut out = String::new();
    let pool = &program.bytecode;
    render(&mut out, program, pool);
    for constant in &pool.constants {
        if let Constant::Function(function) = constant {
            out.push('\n');
            render(&mut out, function, pool);
        }
    }
    out
}

fn render(out: &mut String, function: &Function, pool: &Bytecode) {
    let _ = writeln!(
        out,
        "== {} (params {}, locals {}) ==",
        function.name, function.parameter_count, function.local_count
    );
    let code = &function.bytecode.instructions;
    let mut offset = 0;
    while offset < code.len() {
        let byte = code[offset];
        let Some(op) = OpCode::from_byte(byte) else {
            let _ = writeln!(out, "{offset:04} <unknown {byte:#04x}>");
            offset += 1;
            continue;
        };
        let mut operands = Vec::new();
        let mut cursor = offset + 1;
        for width in op.operand_widths() {
            let Some(bytes) = code.get(cursor..cursor + width) else {
                let _ = writeln!(out, "{offset:04} {} <truncated>", op.name());
                return;
            };
            let value = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
            operands.push(value);
            cursor += width;
        }
        let _ = write!(out, "{offset:04} {}", op.name());
        for operand in &operands {
            let _ = write!(out, " {operand}");
        }
        match (op, operands.first()) {
            (
                OpCode::Constant
                | OpCode::New
                | OpCode::GetMember
                | OpCode::SetMember
                | OpCode::CallMethod
                | OpCode::ExecAst,
                Some(index),
            ) => {
                if let Some(constant) = pool.constants.get(*index) {
                    let _ = write!(out, " ({})", constant.describe());
                }
            }
            (OpCode::GetGlobal | OpCode::SetGlobal | OpCode::IncGlobal, Some(index)) => {
                if let Some(name) = pool.global_names.get(*index) {
                    let _ = write!(out, " ({name})");
                }
            }
            (OpCode::Jump | OpCode::JumpIfFalse | OpCode::ForCheck | OpCode::IterNext, Some(jump)) => {
                let _ = write!(out, " -> {:04}", cursor + jump);
            }
            (OpCode::Loop, Some(jump)) => {
                let _ = write!(out, " -> {:04}", cursor.saturating_sub(*jump));
            }
            _ => {}
        }
        out.push('\n');
        offset = cursor;
    }
}

#[cfg(test)]
mod tests {
    use super::{disassemble, Bytecode, Constant, Function, OpCode};
    use std::sync::Arc;

    #[test]
    fn opcodes_round_trip_through_bytes() {
        for byte in 0..=u8::MAX {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(OpCode::from_byte(OpCode::ExecAst as u8), Some(OpCode::ExecAst));
        assert_eq!(OpCode::from_byte(0xFF), None);
    }

    #[test]
    fn function_serializes_with_bincode() {
        let function = Function {
            name: "main".to_string(),
            bytecode: Bytecode {
                instructions: vec![OpCode::Constant as u8, 0, 0, OpCode::Return as u8],
                constants: vec![Constant::String(Arc::from("hi"))],
                global_names: vec!["x".to_string()],
                ..Bytecode::default()
            },
            parameter_count: 0,
            local_count: 0,
        };
        let bytes = function.to_bytes().expect("serialize");
        let decoded = Function::from_bytes(&bytes).expect("deserialize");
        assert_eq!(decoded, function);
    }

    #[test]
    fn disassembly_decodes_operands() {
        let function = Function {
            name: "main".to_string(),
            bytecode: Bytecode {
                instructions: vec![
                    OpCode::Constant as u8,
                    0,
                    0,
                    OpCode::SetGlobal as u8,
                    0,
                    0,
                    OpCode::Jump as u8,
                    0,
                    1,
                    OpCode::Pop as u8,
                    OpCode::Return as u8,
                ],
                constants: vec![Constant::Int(10)],
                global_names: vec!["x".to_string()],
                ..Bytecode::default()
            },
            parameter_count: 0,
            local_count: 0,
        };
        let listing = disassemble(&function);
        assert!(listing.contains("0000 CONSTANT 0 (10)"));
        assert!(listing.contains("0003 SET_GLOBAL 0 (x)"));
        assert!(listing.contains("0006 JUMP 1 -> 0010"));
        assert!(listing.contains("0010 RETURN"));
    }
}
