use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, trace};
use vbs_syntax::CompareMode;

use crate::bytecode::{Constant, Function, OpCode, REDIM_FIXED, REDIM_PRESERVE};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::host::{Host, HostObject};
use crate::value::{self, LogicOp, Value, VbArray};

/// One active procedure invocation.
struct Frame {
    function: Arc<Function>,
    ip: usize,
    /// Stack index of the first argument; the callee value sits just below.
    base: usize,
    /// Object whose members shadow globals, as inside a class method.
    context: Option<Rc<dyn HostObject>>,
}

/// Stack machine executing compiled [`Function`]s against a [`Host`].
///
/// One VM runs one script at a time on one thread. Bytecode is shared through
/// `Arc` and never mutated, so many VMs can run the same program.
pub struct Vm<'h> {
    host: &'h mut dyn Host,
    config: VmConfig,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    global_slots: Vec<Value>,
    /// Root program; its constant pool and global names serve every frame.
    program: Option<Arc<Function>>,
}

impl<'h> Vm<'h> {
    pub fn new(host: &'h mut dyn Host) -> Self {
        Self {
            host,
            config: VmConfig::default(),
            stack: Vec::new(),
            frames: Vec::new(),
            global_slots: Vec::new(),
            program: None,
        }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config.clamped();
        self
    }

    /// Runs a program from a clean state and returns its result.
    pub fn run(&mut self, program: &Arc<Function>) -> Result<Value, VmError> {
        self.stack.clear();
        self.frames.clear();
        self.global_slots = vec![Value::Empty; program.bytecode.global_names.len()];
        self.program = Some(Arc::clone(program));
        self.push(Value::Function(Arc::clone(program)))?;
        self.push_frame(Arc::clone(program), 0, None)?;
        self.execute(0)
    }

    /// Calls `function` on top of the current state, optionally with a context
    /// object that receives unqualified member access.
    pub fn invoke(
        &mut self,
        function: &Arc<Function>,
        args: Vec<Value>,
        context: Option<Rc<dyn HostObject>>,
    ) -> Result<Value, VmError> {
        if self.program.is_none() {
            self.global_slots = vec![Value::Empty; function.bytecode.global_names.len()];
            self.program = Some(Arc::clone(function));
        }
        let depth = self.frames.len();
        let argc = args.len();
        self.push(Value::Function(Arc::clone(function)))?;
        for arg in args {
            self.push(arg)?;
        }
        self.push_frame(Arc::clone(function), argc, context)?;
        self.execute(depth)
    }

    /// Reads a global slot after (or between) runs.
    pub fn global(&self, name: &str) -> Option<Value> {
        let program = self.program.as_ref()?;
        let index = global_index(program, &name.to_ascii_lowercase())?;
        self.global_slots.get(index).cloned()
    }

    // ----- stack -----

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= self.config.stack_size {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn pop_many(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        let at = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or(VmError::StackUnderflow)?;
        Ok(self.stack.split_off(at))
    }

    fn peek(&self, depth: usize) -> Result<&Value, VmError> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|index| self.stack.get(index))
            .ok_or(VmError::StackUnderflow)
    }

    // ----- frames -----

    fn frame(&self) -> Result<&Frame, VmError> {
        self.frames.last().ok_or(VmError::NoProgram)
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, VmError> {
        self.frames.last_mut().ok_or(VmError::NoProgram)
    }

    /// Enters `function`, whose arguments are the top `argc` stack values.
    fn push_frame(
        &mut self,
        function: Arc<Function>,
        argc: usize,
        context: Option<Rc<dyn HostObject>>,
    ) -> Result<(), VmError> {
        if argc != function.parameter_count {
            return Err(VmError::ArityMismatch {
                name: function.name.clone(),
                expected: function.parameter_count,
                got: argc,
            });
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(VmError::FrameOverflow {
                limit: self.config.max_frames,
            });
        }
        let base = self
            .stack
            .len()
            .checked_sub(argc)
            .ok_or(VmError::StackUnderflow)?;
        for _ in function.parameter_count..function.local_count {
            self.push(Value::Empty)?;
        }
        trace!(
            function = %function.name,
            arity = argc,
            depth = self.frames.len() + 1,
            "push frame"
        );
        self.frames.push(Frame {
            function,
            ip: 0,
            base,
            context,
        });
        Ok(())
    }

    /// Leaves the current frame. Returns the result once the frame that
    /// started this `execute` call is gone; otherwise pushes it for the caller.
    fn pop_frame(&mut self, result: Value, stop_depth: usize) -> Result<Option<Value>, VmError> {
        let frame = self.frames.pop().ok_or(VmError::StackUnderflow)?;
        trace!(
            function = %frame.function.name,
            depth = self.frames.len(),
            "pop frame"
        );
        self.stack.truncate(frame.base.saturating_sub(1));
        if self.frames.len() <= stop_depth {
            return Ok(Some(result));
        }
        self.push(result)?;
        Ok(None)
    }

    fn read_u8(&mut self) -> Result<u8, VmError> {
        let frame = self.frame_mut()?;
        let byte = frame
            .function
            .bytecode
            .instructions
            .get(frame.ip)
            .copied()
            .ok_or(VmError::Truncated { offset: frame.ip })?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, VmError> {
        let high = self.read_u8()?;
        let low = self.read_u8()?;
        Ok(u16::from_be_bytes([high, low]))
    }

    fn jump_forward(&mut self, offset: u16) -> Result<(), VmError> {
        let frame = self.frame_mut()?;
        frame.ip += offset as usize;
        Ok(())
    }

    fn context(&self) -> Option<Rc<dyn HostObject>> {
        self.frames.last().and_then(|frame| frame.context.clone())
    }

    // ----- execution -----

    fn execute(&mut self, stop_depth: usize) -> Result<Value, VmError> {
        let program = self.program.clone().ok_or(VmError::NoProgram)?;
        let mode = program.bytecode.compare_mode;
        loop {
            let (byte, offset) = {
                let frame = self.frame_mut()?;
                let offset = frame.ip;
                match frame.function.bytecode.instructions.get(offset) {
                    Some(byte) => {
                        frame.ip += 1;
                        (*byte, offset)
                    }
                    // Running off the end is an implicit return.
                    None => (OpCode::Return as u8, offset),
                }
            };
            let op = OpCode::from_byte(byte).ok_or(VmError::UnknownOpcode {
                opcode: byte,
                offset,
            })?;
            match op {
                OpCode::Constant => {
                    let index = self.read_u16()? as usize;
                    let constant = program
                        .bytecode
                        .constants
                        .get(index)
                        .ok_or(VmError::InvalidConstant(index))?;
                    self.push(constant.to_value())?;
                }
                OpCode::Empty => self.push(Value::Empty)?,
                OpCode::Null => self.push(Value::Null)?,
                OpCode::Nothing => self.push(Value::Nothing)?,
                OpCode::Missing => self.push(Value::Missing)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Add => self.binary(value::add)?,
                OpCode::Sub => self.binary(value::sub)?,
                OpCode::Mul => self.binary(value::mul)?,
                OpCode::Div => self.binary(value::div)?,
                OpCode::IntDiv => self.binary(value::int_div)?,
                OpCode::Mod => self.binary(value::modulo)?,
                OpCode::Pow => self.binary(value::pow)?,
                OpCode::Concat => self.binary(value::concat)?,
                OpCode::Neg => {
                    let operand = self.pop()?;
                    self.push(value::neg(&operand)?)?;
                }
                OpCode::Not => {
                    let operand = self.pop()?;
                    self.push(value::not(&operand)?)?;
                }
                OpCode::Eq => self.comparison(mode, |order| order == Ordering::Equal)?,
                OpCode::Ne => self.comparison(mode, |order| order != Ordering::Equal)?,
                OpCode::Lt => self.comparison(mode, |order| order == Ordering::Less)?,
                OpCode::Le => self.comparison(mode, |order| order != Ordering::Greater)?,
                OpCode::Gt => self.comparison(mode, |order| order == Ordering::Greater)?,
                OpCode::Ge => self.comparison(mode, |order| order != Ordering::Less)?,
                OpCode::Is => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    self.push(Value::Bool(value::same_object(&left, &right)?))?;
                }
                OpCode::And => self.logical(LogicOp::And)?,
                OpCode::Or => self.logical(LogicOp::Or)?,
                OpCode::Xor => self.logical(LogicOp::Xor)?,
                OpCode::Eqv => self.logical(LogicOp::Eqv)?,
                OpCode::Imp => self.logical(LogicOp::Imp)?,
                OpCode::GetGlobal => {
                    let index = self.read_u16()? as usize;
                    let value = self.get_global(&program, index)?;
                    self.push(value)?;
                }
                OpCode::SetGlobal => {
                    let index = self.read_u16()? as usize;
                    let value = owned(self.pop()?);
                    self.set_global(&program, index, value)?;
                }
                OpCode::IncGlobal => {
                    let index = self.read_u16()? as usize;
                    let current = self.get_global(&program, index)?;
                    let next = value::add(&current, &Value::Int(1))?;
                    self.set_global(&program, index, next)?;
                }
                OpCode::GetLocal => {
                    let slot = self.local_index()?;
                    let value = self.stack.get(slot).cloned().ok_or(VmError::InvalidLocal(slot))?;
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.local_index()?;
                    let value = owned(self.pop()?);
                    let target = self.stack.get_mut(slot).ok_or(VmError::InvalidLocal(slot))?;
                    *target = value;
                }
                OpCode::IncLocal => {
                    let slot = self.local_index()?;
                    let target = self.stack.get_mut(slot).ok_or(VmError::InvalidLocal(slot))?;
                    *target = value::add(target, &Value::Int(1))?;
                }
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Dup => {
                    let top = self.peek(0)?.clone();
                    self.push(top)?;
                }
                OpCode::Jump => {
                    let jump = self.read_u16()?;
                    self.jump_forward(jump)?;
                }
                OpCode::JumpIfFalse => {
                    let jump = self.read_u16()?;
                    if !self.pop()?.truthy()? {
                        self.jump_forward(jump)?;
                    }
                }
                OpCode::Loop => {
                    let jump = self.read_u16()? as usize;
                    let frame = self.frame_mut()?;
                    frame.ip = frame
                        .ip
                        .checked_sub(jump)
                        .ok_or(VmError::Truncated { offset })?;
                }
                OpCode::Call => {
                    let argc = self.read_u8()? as usize;
                    self.call(&program, argc)?;
                }
                OpCode::CallMethod => {
                    let name = self.read_u16()? as usize;
                    let argc = self.read_u8()? as usize;
                    let name = constant_name(&program, name)?;
                    let args = self.pop_many(argc)?;
                    let object = self.pop()?;
                    let result = match object {
                        Value::Object(object) => object.call_method(name, args)?,
                        _ => return Err(VmError::ObjectRequired(name.to_string())),
                    };
                    self.push(result)?;
                }
                OpCode::Return => {
                    if let Some(result) = self.pop_frame(Value::Empty, stop_depth)? {
                        return Ok(result);
                    }
                }
                OpCode::ReturnValue => {
                    let result = self.pop()?;
                    if let Some(result) = self.pop_frame(result, stop_depth)? {
                        return Ok(result);
                    }
                }
                OpCode::New => {
                    let name = self.read_u16()? as usize;
                    let name = constant_name(&program, name)?;
                    let object = self.host.create_object(name)?;
                    self.push(object)?;
                }
                OpCode::GetMember => {
                    let name = self.read_u16()? as usize;
                    let name = constant_name(&program, name)?;
                    let object = self.pop()?;
                    let value = match object {
                        Value::Object(object) => match object.get_property(name) {
                            Some(value) => value,
                            None => object.call_method(name, Vec::new())?,
                        },
                        _ => return Err(VmError::ObjectRequired(name.to_string())),
                    };
                    self.push(value)?;
                }
                OpCode::SetMember => {
                    let name = self.read_u16()? as usize;
                    let name = constant_name(&program, name)?;
                    let value = owned(self.pop()?);
                    match self.pop()? {
                        Value::Object(object) => {
                            if !object.set_property(name, value) {
                                return Err(VmError::MemberNotFound(name.to_string()));
                            }
                        }
                        _ => return Err(VmError::ObjectRequired(name.to_string())),
                    }
                }
                OpCode::SetIndexed => {
                    let count = self.read_u8()? as usize;
                    let value = owned(self.pop()?);
                    let indices = self.pop_many(count)?;
                    match self.pop()? {
                        Value::Array(array) => array.borrow_mut().set(&indices, value)?,
                        other => self.host.set_indexed(other, indices, value)?,
                    }
                }
                OpCode::ReDim => {
                    let dimensions = self.read_u8()? as usize;
                    let flags = self.read_u8()?;
                    let bounds = self
                        .pop_many(dimensions)?
                        .iter()
                        .map(|bound| {
                            bound
                                .to_i64()?
                                .ok_or_else(|| VmError::type_mismatch("Null array bound"))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let target = self.pop()?;
                    let fixed = flags & REDIM_FIXED != 0;
                    let array = match target {
                        Value::Array(array) if !fixed => {
                            array
                                .borrow_mut()
                                .redim(&bounds, flags & REDIM_PRESERVE != 0)?;
                            Value::Array(array)
                        }
                        _ => Value::Array(Rc::new(RefCell::new(VbArray::new(&bounds, fixed)?))),
                    };
                    self.push(array)?;
                }
                OpCode::Erase => {
                    let target = self.pop()?;
                    match &target {
                        Value::Array(array) => array.borrow_mut().erase(),
                        other => return Err(VmError::type_mismatch(other.type_name())),
                    }
                    self.push(target)?;
                }
                OpCode::ForCheck => {
                    let jump = self.read_u16()?;
                    let counter = self.pop()?;
                    let step = self.peek(0)?;
                    let limit = self.peek(1)?;
                    let descending = value::compare(step, &Value::Int(0), CompareMode::Binary)?
                        == Some(Ordering::Less);
                    let order = value::compare(&counter, limit, CompareMode::Binary)?
                        .ok_or_else(|| VmError::type_mismatch("Null loop bound"))?;
                    let finished = if descending {
                        order == Ordering::Less
                    } else {
                        order == Ordering::Greater
                    };
                    if finished {
                        self.jump_forward(jump)?;
                    }
                }
                OpCode::ForStep => {
                    let counter = self.pop()?;
                    let next = value::add(&counter, self.peek(0)?)?;
                    self.push(next)?;
                }
                OpCode::IterNew => {
                    let collection = self.pop()?;
                    let items = match &collection {
                        Value::Array(array) => array.borrow().values().to_vec(),
                        Value::Object(object) => object
                            .enumerate()
                            .ok_or_else(|| VmError::type_mismatch("object is not a collection"))?,
                        other => return Err(VmError::type_mismatch(other.type_name())),
                    };
                    self.push(Value::array(items))?;
                    self.push(Value::Int(0))?;
                }
                OpCode::IterNext => {
                    let jump = self.read_u16()?;
                    let position = match self.peek(0)? {
                        Value::Int(position) => *position,
                        other => return Err(VmError::type_mismatch(other.type_name())),
                    };
                    let item = match self.peek(1)? {
                        Value::Array(items) => usize::try_from(position)
                            .ok()
                            .and_then(|position| items.borrow().values().get(position).cloned()),
                        other => return Err(VmError::type_mismatch(other.type_name())),
                    };
                    match item {
                        Some(item) => {
                            let top = self.stack.len() - 1;
                            self.stack[top] = Value::Int(position + 1);
                            self.push(item)?;
                        }
                        None => self.jump_forward(jump)?,
                    }
                }
                OpCode::ExecAst => {
                    let index = self.read_u16()? as usize;
                    match program.bytecode.constants.get(index) {
                        Some(Constant::Ast(statement)) => {
                            self.host.execute_ast(statement)?;
                        }
                        _ => return Err(VmError::InvalidConstant(index)),
                    }
                }
            }
        }
    }

    fn binary(
        &mut self,
        operation: fn(&Value, &Value) -> Result<Value, VmError>,
    ) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        self.push(operation(&left, &right)?)
    }

    fn logical(&mut self, op: LogicOp) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        self.push(value::logical(op, &left, &right)?)
    }

    fn comparison(
        &mut self,
        mode: CompareMode,
        test: fn(Ordering) -> bool,
    ) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = match value::compare(&left, &right, mode)? {
            Some(order) => Value::Bool(test(order)),
            None => Value::Null,
        };
        self.push(result)
    }

    fn local_index(&mut self) -> Result<usize, VmError> {
        let slot = self.read_u8()? as usize;
        Ok(self.frame()?.base + slot)
    }

    fn get_global(&mut self, program: &Function, index: usize) -> Result<Value, VmError> {
        let name = program
            .bytecode
            .global_names
            .get(index)
            .ok_or(VmError::InvalidGlobal(index))?;
        if let Some(context) = self.context() {
            if name == "me" {
                return Ok(Value::Object(context));
            }
            if let Some(value) = context.get_property(name) {
                return Ok(value);
            }
        }
        if let Some(value) = self.host.get_variable(name) {
            return Ok(value);
        }
        self.global_slots
            .get(index)
            .cloned()
            .ok_or(VmError::InvalidGlobal(index))
    }

    fn set_global(&mut self, program: &Function, index: usize, value: Value) -> Result<(), VmError> {
        let name = program
            .bytecode
            .global_names
            .get(index)
            .ok_or(VmError::InvalidGlobal(index))?;
        if let Some(context) = self.context() {
            if context.set_property(name, value.clone()) {
                return Ok(());
            }
        }
        self.host.set_variable(name, value.clone());
        let slot = self
            .global_slots
            .get_mut(index)
            .ok_or(VmError::InvalidGlobal(index))?;
        *slot = value;
        Ok(())
    }

    /// Dispatches `Call argc` on the callee sitting below the arguments.
    fn call(&mut self, program: &Function, argc: usize) -> Result<(), VmError> {
        let callee_at = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or(VmError::StackUnderflow)?;
        let callee = self.stack[callee_at].clone();
        match callee {
            Value::Function(function) => {
                // Arguments are passed by value.
                for arg in &mut self.stack[callee_at + 1..] {
                    if let Value::Array(_) = arg {
                        *arg = arg.copied();
                    }
                }
                self.push_frame(function, argc, None)
            }
            Value::Builtin(name) => {
                let args = self.pop_many(argc)?;
                self.pop()?;
                match self.host.call_function(&name, args.clone()) {
                    Ok(result) => self.push(result),
                    Err(error) => self.call_fallback(program, &name, args, error),
                }
            }
            Value::Array(array) => {
                let indices = self.pop_many(argc)?;
                self.pop()?;
                let item = array.borrow().get(&indices)?;
                self.push(item)
            }
            Value::Object(object) => {
                let args = self.pop_many(argc)?;
                self.pop()?;
                self.push(object.call_method("", args)?)
            }
            other if argc == 0 => {
                self.pop()?;
                self.push(other)
            }
            other => Err(VmError::NotCallable(other.type_name())),
        }
    }

    /// The host declined `name`; retry against whatever the script bound to
    /// that name since the call site was compiled.
    fn call_fallback(
        &mut self,
        program: &Function,
        name: &str,
        args: Vec<Value>,
        error: VmError,
    ) -> Result<(), VmError> {
        let bound = global_index(program, name).and_then(|index| self.global_slots.get(index));
        match bound.cloned() {
            Some(Value::Function(function)) => {
                debug!(function = name, "host declined call, using user procedure");
                let argc = args.len();
                self.push(Value::Function(Arc::clone(&function)))?;
                for arg in args {
                    self.push(arg.copied())?;
                }
                self.push_frame(function, argc, None)
            }
            Some(Value::Object(object)) => {
                debug!(function = name, "host declined call, using default member");
                self.push(object.call_method("", args)?)
            }
            Some(Value::Array(array)) => {
                let item = array.borrow().get(&args)?;
                self.push(item)
            }
            _ => Err(error),
        }
    }
}

/// Arrays get value semantics on store unless nothing else holds them.
fn owned(value: Value) -> Value {
    match &value {
        Value::Array(array) if Rc::strong_count(array) > 1 => value.copied(),
        _ => value,
    }
}

fn global_index(program: &Function, name: &str) -> Option<usize> {
    program
        .bytecode
        .global_names
        .iter()
        .position(|candidate| candidate == name)
}

fn constant_name(program: &Function, index: usize) -> Result<&str, VmError> {
    match program.bytecode.constants.get(index) {
        Some(Constant::String(name)) => Ok(name),
        _ => Err(VmError::InvalidConstant(index)),
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::sync::Arc;

    use vbs_parser::parse_program;

    use super::Vm;
    use crate::bytecode::{Bytecode, Function, OpCode};
    use crate::compiler::compile;
    use crate::config::VmConfig;
    use crate::error::VmError;
    use crate::host::testing::{RecordingHost, TestObject};
    use crate::host::{DefaultHost, Host, HostObject};
    use crate::value::Value;

    fn program(source: &str) -> Arc<Function> {
        let program = parse_program(source).expect("parse");
        Arc::new(compile(&program).expect("compile"))
    }

    fn run_on(host: &mut dyn Host, source: &str, names: &[&str]) -> Result<Vec<Value>, VmError> {
        let program = program(source);
        let mut vm = Vm::new(host);
        vm.run(&program)?;
        Ok(names
            .iter()
            .map(|name| vm.global(name).unwrap_or_default())
            .collect())
    }

    fn globals(source: &str, names: &[&str]) -> Vec<Value> {
        run_on(&mut DefaultHost, source, names).expect("run")
    }

    fn global(source: &str, name: &str) -> Value {
        globals(source, &[name]).remove(0)
    }

    fn run_error(source: &str) -> VmError {
        run_on(&mut DefaultHost, source, &[]).expect_err("run should fail")
    }

    fn widget() -> Value {
        Value::object(TestObject::with(&[("name", Value::Empty)]))
    }

    #[test]
    fn declared_global_receives_integer() {
        assert_eq!(global("Dim x\nx = 10", "x"), Value::Int(10));
    }

    #[test]
    fn for_loop_accumulates() {
        assert_eq!(
            global("x = 0\nFor i = 1 To 3\nx = x + i\nNext", "x"),
            Value::Int(6)
        );
        assert_eq!(
            global("For i = 10 To 1 Step -3\ns = s & i & \",\"\nNext", "s"),
            Value::string("10,7,4,1,")
        );
        assert_eq!(
            globals("For i = 5 To 1\nn = n + 1\nNext", &["n", "i"]),
            vec![Value::Empty, Value::Int(5)]
        );
    }

    #[test]
    fn select_case_matches_ranges_and_comparisons() {
        let source = "Select Case 5\nCase 1 To 10\nx = 1\nCase Else\nx = 2\nEnd Select";
        assert_eq!(global(source, "x"), Value::Int(1));
        let source = "Select Case 50\nCase 1 To 10\nx = 1\nCase Else\nx = 2\nEnd Select";
        assert_eq!(global(source, "x"), Value::Int(2));
        let source = "v = \"b\"\nSelect Case v\nCase \"a\", \"b\"\nx = 1\nCase \"c\"\nx = 2\nEnd Select";
        assert_eq!(global(source, "x"), Value::Int(1));
        let source = "Select Case 7\nCase Is < 3\nx = 1\nCase Is >= 5\nx = 2\nEnd Select";
        assert_eq!(global(source, "x"), Value::Int(2));
        let source = "Select Case 0\nCase 1\nx = 1\nEnd Select\ny = 3";
        assert_eq!(globals(source, &["x", "y"]), vec![Value::Empty, Value::Int(3)]);
    }

    #[test]
    fn function_returns_through_its_name() {
        let source = "Function Inc(n)\nInc = n + 1\nEnd Function\ny = Inc(5)";
        assert_eq!(global(source, "y"), Value::Int(6));

        let program = program("Function Inc(n)\nInc = n + 1\nEnd Function");
        let mut host = DefaultHost;
        let mut vm = Vm::new(&mut host);
        vm.run(&program).expect("run");
        let Some(Value::Function(inc)) = vm.global("Inc") else {
            panic!("Inc should be bound");
        };
        assert_eq!(vm.invoke(&inc, vec![Value::Int(5)], None), Ok(Value::Int(6)));
    }

    #[test]
    fn recursion_and_forward_references() {
        let source = "x = Fact(5)\nFunction Fact(n)\nIf n <= 1 Then\nFact = 1\nElse\nFact = n * Fact(n - 1)\nEnd If\nEnd Function";
        assert_eq!(global(source, "x"), Value::Int(120));
    }

    #[test]
    fn zero_argument_function_recurses_through_call_syntax() {
        let source = "n = 3\nFunction Down()\nIf n > 0 Then\nn = n - 1\nDown = Down() + 1\nElse\nDown = 0\nEnd If\nEnd Function\nr = Down()";
        assert_eq!(globals(source, &["r", "n"]), vec![Value::Int(3), Value::Int(0)]);
    }

    #[test]
    fn runs_are_independent() {
        let program = program("x = 1 : x = x + 1");
        for _ in 0..2 {
            let mut host = DefaultHost;
            let mut vm = Vm::new(&mut host);
            vm.run(&program).expect("run");
            assert_eq!(vm.global("x"), Some(Value::Int(2)));
        }
        let mut host = DefaultHost;
        let mut vm = Vm::new(&mut host);
        vm.run(&program).expect("first run");
        vm.run(&program).expect("second run");
        assert_eq!(vm.global("x"), Some(Value::Int(2)));
    }

    #[test]
    fn missing_arguments_reach_the_host() {
        let mut host = RecordingHost::default().with_function("foo", |_| Ok(Value::Empty));
        run_on(&mut host, "Foo 1, , 3", &[]).expect("run");
        assert_eq!(
            host.calls,
            vec![(
                "foo".to_string(),
                vec![Value::Int(1), Value::Missing, Value::Int(3)]
            )]
        );
    }

    #[test]
    fn host_functions_and_variables() {
        let mut host = RecordingHost::default()
            .with_function("len", |args| match args {
                [Value::String(text)] => Ok(Value::Int(text.len() as i64)),
                _ => Err(VmError::host("len takes one string")),
            })
            .with_variable("requestid", Value::Int(9));
        let values = run_on(&mut host, "n = Len(\"abcd\")\nr = RequestId", &["n", "r"])
            .expect("run");
        assert_eq!(values, vec![Value::Int(4), Value::Int(9)]);
        assert!(host
            .writes
            .contains(&("n".to_string(), Value::Int(4))));
    }

    #[test]
    fn unknown_builtin_propagates_host_error() {
        assert!(matches!(
            run_error("x = NoSuchThing(1)"),
            VmError::Host(message) if message.contains("nosuchthing")
        ));
    }

    #[test]
    fn declined_builtin_falls_back_to_bound_object() {
        let source = "Function Run()\nRun = Widget(7)\nEnd Function\nSet widget = CreateWidget()\nx = Run()";
        let mut host = RecordingHost::default().with_function("createwidget", |_| Ok(widget()));
        let values = run_on(&mut host, source, &["x"]).expect("run");
        assert_eq!(values, vec![Value::Int(7)]);
        assert_eq!(host.calls[1].0, "widget");
    }

    #[test]
    fn inline_if_calls_host_object_method() {
        let response = Rc::new(TestObject::default());
        let mut host =
            RecordingHost::default().with_variable("response", Value::Object(response.clone()));
        run_on(&mut host, "If 1 = 1 Then Response.Write 1", &[]).expect("run");
        assert_eq!(
            response.calls.borrow().as_slice(),
            &[("write".to_string(), vec![Value::Int(1)])]
        );
    }

    #[test]
    fn context_object_shadows_globals() {
        let program = program("Sub Bump\ncount = count + 1\nother = 5\nEnd Sub\nFunction Self()\nSet Self = Me\nEnd Function");
        let object = Rc::new(TestObject::with(&[("count", Value::Int(1))]));
        let context: Rc<dyn HostObject> = object.clone();
        let mut host = DefaultHost;
        let mut vm = Vm::new(&mut host);
        vm.run(&program).expect("run");
        let Some(Value::Function(bump)) = vm.global("bump") else {
            panic!("bump should be bound");
        };
        vm.invoke(&bump, Vec::new(), Some(context.clone()))
            .expect("invoke");
        assert_eq!(object.get_property("count"), Some(Value::Int(2)));
        assert_eq!(vm.global("other"), Some(Value::Int(5)));

        let Some(Value::Function(this)) = vm.global("self") else {
            panic!("self should be bound");
        };
        let me = vm.invoke(&this, Vec::new(), Some(context.clone())).expect("invoke");
        assert_eq!(me, Value::Object(context));
    }

    #[test]
    fn arrays_have_value_semantics() {
        let source = "Dim a(2)\na(0) = 5\na(2) = a(0) * 2\nb = a\nb(0) = 1\nn = a(0)\nm = a(2)";
        assert_eq!(
            globals(source, &["n", "m"]),
            vec![Value::Int(5), Value::Int(10)]
        );
        let source = "Sub Clobber(arr)\narr(0) = 99\nEnd Sub\nDim a(1)\na(0) = 1\nClobber a\nn = a(0)";
        assert_eq!(global(source, "n"), Value::Int(1));
    }

    #[test]
    fn redim_and_erase() {
        let source = "ReDim a(1)\na(1) = 3\nReDim Preserve a(3)\nx = a(1)\nReDim a(2)\ny = a(1)";
        assert_eq!(globals(source, &["x", "y"]), vec![Value::Int(3), Value::Empty]);
        let source = "Dim m(1, 2)\nm(1, 2) = \"corner\"\nx = m(1, 2)";
        assert_eq!(global(source, "x"), Value::string("corner"));
        assert_eq!(run_error("Dim a(2)\nReDim a(5)"), VmError::ArrayLocked);
        assert_eq!(run_error("Dim a(2)\nx = a(3)"), VmError::SubscriptOutOfRange);
        let source = "Dim a(1)\na(0) = 4\nErase a\nx = a(0)";
        assert_eq!(global(source, "x"), Value::Empty);
        assert_eq!(
            run_error("ReDim a(1)\nErase a\nx = a(0)"),
            VmError::SubscriptOutOfRange
        );
    }

    #[test]
    fn dim_arrays_are_fixed_and_redim_arrays_are_dynamic() {
        let program = program("Dim fixed(2)\nReDim grown(1, 4)");
        let mut host = DefaultHost;
        let mut vm = Vm::new(&mut host);
        vm.run(&program).expect("run");
        let Some(Value::Array(fixed)) = vm.global("fixed") else {
            panic!("fixed should be an array");
        };
        let Some(Value::Array(grown)) = vm.global("grown") else {
            panic!("grown should be an array");
        };
        assert!(fixed.borrow().is_fixed());
        assert!(!grown.borrow().is_fixed());
        assert_eq!(grown.borrow().dims(), &[2, 5]);
    }

    #[test]
    fn host_functions_see_array_bounds() {
        let mut host = RecordingHost::default().with_function("ubound", |args| {
            let (array, dimension) = match args {
                [Value::Array(array)] => (array, 1),
                [Value::Array(array), Value::Int(dimension)] => (array, *dimension),
                _ => return Err(VmError::type_mismatch("UBound")),
            };
            usize::try_from(dimension - 1)
                .ok()
                .and_then(|dimension| array.borrow().upper_bound(dimension))
                .map(Value::Int)
                .ok_or(VmError::SubscriptOutOfRange)
        });
        let source = "ReDim a(3, 7)\nx = UBound(a)\ny = UBound(a, 2)\nReDim Preserve a(3, 9)\nz = UBound(a, 2)";
        let values = run_on(&mut host, source, &["x", "y", "z"]).expect("run");
        assert_eq!(values, vec![Value::Int(3), Value::Int(7), Value::Int(9)]);
        assert_eq!(
            run_on(&mut host, "Dim a(1)\nx = UBound(a, 2)", &[]),
            Err(VmError::SubscriptOutOfRange)
        );
    }

    #[test]
    fn redim_inside_procedure_creates_a_local() {
        let source = "Function Build()\nReDim items(2)\nitems(1) = 7\nBuild = items(1)\nEnd Function\nx = Build()";
        assert_eq!(globals(source, &["x", "items"]), vec![Value::Int(7), Value::Empty]);
    }

    #[test]
    fn for_each_over_arrays_and_objects() {
        let source = "Dim a(2)\na(0) = 1 : a(1) = 2 : a(2) = 3\nFor Each v In a\ns = s + v\nNext";
        assert_eq!(global(source, "s"), Value::Int(6));

        let bag = || {
            Value::object(TestObject::with(&[
                ("a", Value::string("x")),
                ("b", Value::string("y")),
            ]))
        };
        let mut host = RecordingHost::default().with_variable("bag", bag());
        let values =
            run_on(&mut host, "For Each item In bag\nout = out & item\nNext", &["out"]).expect("run");
        assert_eq!(values, vec![Value::string("xy")]);
        assert!(matches!(run_error("For Each v In 5\nNext"), VmError::TypeMismatch(_)));
    }

    #[test]
    fn do_and_while_loops() {
        assert_eq!(global("Do While i < 5\ni = i + 1\nLoop", "i"), Value::Int(5));
        assert_eq!(global("Do Until i = 4\ni = i + 1\nLoop", "i"), Value::Int(4));
        assert_eq!(global("Do\ni = i + 1\nLoop While i < 3", "i"), Value::Int(3));
        assert_eq!(global("Do\ni = i + 1\nLoop Until i >= 7", "i"), Value::Int(7));
        assert_eq!(global("While i < 9\ni = i + 2\nWend", "i"), Value::Int(10));
        assert_eq!(
            global("Do\ni = i + 1\nIf i = 4 Then Exit Do\nLoop", "i"),
            Value::Int(4)
        );
    }

    #[test]
    fn exit_statements_unwind_loops() {
        let source = "For i = 1 To 10\nFor j = 1 To 10\nIf j = 2 Then Exit For\nn = n + 1\nNext\nIf i = 3 Then Exit For\nNext";
        assert_eq!(globals(source, &["n", "i"]), vec![Value::Int(3), Value::Int(3)]);
        let source = "Do\nFor k = 1 To 5\nIf k = 3 Then Exit Do\nNext\nLoop\ny = k";
        assert_eq!(global(source, "y"), Value::Int(3));
        let source = "Function Find()\nFor i = 1 To 10\nIf i = 4 Then\nFind = i\nExit Function\nEnd If\nNext\nFind = -1\nEnd Function\nx = Find()";
        assert_eq!(global(source, "x"), Value::Int(4));
    }

    #[test]
    fn with_block_and_members() {
        let mut host = RecordingHost::default().with_function("createwidget", |_| Ok(widget()));
        let source = "Set o = CreateWidget()\nWith o\n.Name = \"gear\"\ny = .Name\nt = .Sum(1, 2, 3)\nEnd With\nz = o.name";
        let values = run_on(&mut host, source, &["y", "t", "z"]).expect("run");
        assert_eq!(
            values,
            vec![Value::string("gear"), Value::Int(6), Value::string("gear")]
        );
    }

    #[test]
    fn member_errors() {
        let mut host = RecordingHost::default().with_function("createwidget", |_| Ok(widget()));
        assert_eq!(
            run_on(&mut host, "Set o = CreateWidget()\no.Missing = 1", &[]),
            Err(VmError::MemberNotFound("missing".to_string()))
        );
        assert_eq!(
            run_error("x = 5\ny = x.Name"),
            VmError::ObjectRequired("name".to_string())
        );
    }

    #[test]
    fn new_and_indexed_assignment_go_through_the_host() {
        let mut host = RecordingHost::default().with_object("Widget", widget);
        let source = "Set w = New Widget\nw(\"key\") = 1\nw.Name = \"set\"";
        run_on(&mut host, source, &[]).expect("run");
        assert_eq!(host.created, vec!["widget".to_string()]);
        assert_eq!(
            host.indexed,
            vec![(vec![Value::string("key")], Value::Int(1))]
        );
    }

    #[test]
    fn on_error_is_delegated() {
        let mut host = RecordingHost::default();
        run_on(&mut host, "On Error Resume Next\nOn Error GoTo 0", &[]).expect("run");
        assert_eq!(host.statements, vec!["OnErrorStatement", "OnErrorStatement"]);
    }

    #[test]
    fn runtime_faults() {
        assert_eq!(run_error("x = 1 / 0"), VmError::DivisionByZero);
        assert_eq!(run_error("x = 5 Mod 0"), VmError::DivisionByZero);
        assert_eq!(
            run_error("Sub S(a)\nEnd Sub\nS 1, 2"),
            VmError::ArityMismatch {
                name: "S".to_string(),
                expected: 1,
                got: 2
            }
        );
        assert!(matches!(run_error("x = \"abc\" * 2"), VmError::TypeMismatch(_)));
        assert_eq!(run_error("x = 5\ny = x(1)"), VmError::NotCallable("Long"));
    }

    #[test]
    fn deep_recursion_overflows_frames() {
        let program = program("Function R(n)\nR = R(n + 1)\nEnd Function\nx = R(1)");
        let mut host = DefaultHost;
        let mut vm = Vm::new(&mut host).with_config(VmConfig {
            max_frames: 50,
            ..VmConfig::default()
        });
        assert_eq!(vm.run(&program), Err(VmError::FrameOverflow { limit: 50 }));
    }

    #[test]
    fn corrupt_bytecode_faults_instead_of_panicking() {
        let function = |instructions: Vec<u8>| {
            Arc::new(Function {
                name: "main".to_string(),
                bytecode: Bytecode {
                    instructions,
                    ..Bytecode::default()
                },
                parameter_count: 0,
                local_count: 0,
            })
        };
        let mut host = DefaultHost;
        let mut vm = Vm::new(&mut host);
        assert_eq!(
            vm.run(&function(vec![0xFE])),
            Err(VmError::UnknownOpcode {
                opcode: 0xFE,
                offset: 0
            })
        );
        assert_eq!(
            vm.run(&function(vec![OpCode::Constant as u8, 0])),
            Err(VmError::Truncated { offset: 2 })
        );
        assert_eq!(
            vm.run(&function(vec![OpCode::Constant as u8, 0, 3])),
            Err(VmError::InvalidConstant(3))
        );
        assert_eq!(
            vm.run(&function(vec![OpCode::Add as u8])),
            Err(VmError::StackUnderflow)
        );
    }

    #[test]
    fn names_are_case_insensitive_at_run_time() {
        let program = program("Foo = 1\nFOO = FOO + 1");
        let mut host = DefaultHost;
        let mut vm = Vm::new(&mut host);
        vm.run(&program).expect("run");
        assert_eq!(vm.global("foo"), Some(Value::Int(2)));
        assert_eq!(vm.global("FOO"), Some(Value::Int(2)));
    }

    #[test]
    fn option_compare_text_ignores_case() {
        assert_eq!(
            global("Option Compare Text\nx = (\"abc\" = \"ABC\")", "x"),
            Value::Bool(true)
        );
        assert_eq!(global("x = (\"abc\" = \"ABC\")", "x"), Value::Bool(false));
    }

    #[test]
    fn serialized_bytecode_runs_the_same() {
        let source = "Function Sq(n)\nSq = n * n\nEnd Function\nx = Sq(7)";
        let bytes = program(source).to_bytes().expect("serialize");
        let restored = Arc::new(Function::from_bytes(&bytes).expect("deserialize"));
        let mut host = DefaultHost;
        let mut vm = Vm::new(&mut host);
        vm.run(&restored).expect("run");
        assert_eq!(vm.global("x"), Some(Value::Int(49)));
    }

    #[test]
    fn main_program_returns_empty() {
        let program = program("x = 1");
        let mut host = DefaultHost;
        let mut vm = Vm::new(&mut host);
        assert_eq!(vm.run(&program), Ok(Value::Empty));
    }
}
