use thiserror::Error;
use vbs_parser::ParseError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unsupported construct: {kind}")]
    Unsupported { kind: &'static str },
    #[error("too many constants (limit {limit})")]
    TooManyConstants { limit: usize },
    #[error("too many global names (limit {limit})")]
    TooManyGlobals { limit: usize },
    #[error("too many local variables in '{function}' (limit {limit})")]
    TooManyLocals { function: String, limit: usize },
    #[error("too many arguments in one call ({count})")]
    TooManyArguments { count: usize },
    #[error("jump of {distance} bytes does not fit in 16 bits")]
    JumpTooFar { distance: usize },
    #[error("invalid 'Exit {kind}' statement")]
    InvalidExit { kind: &'static str },
}

impl CompileError {
    pub(crate) fn unsupported(kind: &'static str) -> Self {
        CompileError::Unsupported { kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("overflow")]
    Overflow,
    #[error("out of stack space")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("out of stack space: more than {limit} nested calls")]
    FrameOverflow { limit: usize },
    #[error("wrong number of arguments calling '{name}': expected {expected}, got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("object required: '{0}'")]
    ObjectRequired(String),
    #[error("object doesn't support this property or method: '{0}'")]
    MemberNotFound(String),
    #[error("subscript out of range")]
    SubscriptOutOfRange,
    #[error("this array is fixed or temporarily locked")]
    ArrayLocked,
    #[error("value of type {0} is not callable")]
    NotCallable(&'static str),
    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("truncated instruction at offset {offset}")]
    Truncated { offset: usize },
    #[error("invalid constant index {0}")]
    InvalidConstant(usize),
    #[error("invalid global slot {0}")]
    InvalidGlobal(usize),
    #[error("invalid local slot {0}")]
    InvalidLocal(usize),
    #[error("no program loaded")]
    NoProgram,
    #[error("{0}")]
    Host(String),
}

impl VmError {
    /// Error raised by a [`Host`](crate::Host) or host object implementation.
    pub fn host(message: impl Into<String>) -> Self {
        VmError::Host(message.into())
    }

    pub(crate) fn type_mismatch(message: impl Into<String>) -> Self {
        VmError::TypeMismatch(message.into())
    }
}

/// Failure of any stage of the source-to-result pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] VmError),
}
