use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexSet;
use tracing::debug;
use vbs_syntax::{
    BinaryOp, CaseClause, ClassDecl, CompareMode, ElseIf, ExitKind, Expr, Ident, Literal,
    LoopCondition, LoopTest, Procedure, ProcedureKind, Program, Stmt, UnaryOp, VarDecl,
};

use crate::bytecode::{Bytecode, Constant, Function, OpCode, REDIM_FIXED, REDIM_PRESERVE};
use crate::error::CompileError;

const MAX_CONSTANTS: usize = u16::MAX as usize + 1;
const MAX_GLOBALS: usize = u16::MAX as usize + 1;
const MAX_LOCALS: usize = u8::MAX as usize + 1;
const MAX_ARGUMENTS: usize = u8::MAX as usize;
const JUMP_PLACEHOLDER: u16 = u16::MAX;

/// Compiles a parsed program into its top-level `main` function.
pub fn compile(program: &Program) -> Result<Function, CompileError> {
    Compiler::new().compile_program(program)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Main,
    Sub,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Do,
    For,
    While,
}

#[derive(Debug)]
struct LoopContext {
    kind: LoopKind,
    /// Operands the loop keeps on the stack while its body runs.
    stack_values: usize,
    exits: Vec<usize>,
}

impl LoopContext {
    fn new(kind: LoopKind, stack_values: usize) -> Self {
        Self {
            kind,
            stack_values,
            exits: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Local(u8),
    Global(u16),
}

/// Per-function code generation state.
#[derive(Debug)]
struct FunctionState {
    /// Lowercase.
    name: String,
    kind: FunctionKind,
    instructions: Vec<u8>,
    locals: IndexSet<String>,
    parameter_count: usize,
    loops: Vec<LoopContext>,
    with_slots: Vec<u8>,
}

impl FunctionState {
    fn new(name: String, kind: FunctionKind) -> Self {
        Self {
            name,
            kind,
            instructions: Vec::new(),
            locals: IndexSet::new(),
            parameter_count: 0,
            loops: Vec::new(),
            with_slots: Vec::new(),
        }
    }
}

/// Single-pass code generator. Procedures get their own instruction streams
/// but share one constant pool and global-name table with the program.
#[derive(Debug)]
pub struct Compiler {
    constants: Vec<Constant>,
    globals: IndexSet<String>,
    /// Top-level Sub/Function names.
    procedures: HashSet<String>,
    /// Globals that were declared or assigned somewhere before the current point.
    declared: HashSet<String>,
    current: FunctionState,
    compare_mode: CompareMode,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            constants: Vec::new(),
            globals: IndexSet::new(),
            procedures: HashSet::new(),
            declared: HashSet::new(),
            current: FunctionState::new("main".to_string(), FunctionKind::Main),
            compare_mode: CompareMode::Binary,
        }
    }

    pub fn compile_program(mut self, program: &Program) -> Result<Function, CompileError> {
        self.compare_mode = program.option_compare;
        self.prescan(&program.body);

        // Procedures and classes are bound before any other statement runs.
        for stmt in &program.body {
            match stmt {
                Stmt::Procedure(procedure) => {
                    let function = self.compile_procedure(procedure)?;
                    self.emit_constant(Constant::Function(Arc::new(function)))?;
                    let slot = self.global(&procedure.name.key())?;
                    self.emit_u16_op(OpCode::SetGlobal, slot);
                }
                Stmt::Class(class) => self.compile_class(class)?,
                _ => {}
            }
        }
        for stmt in &program.body {
            if !matches!(stmt, Stmt::Procedure(_) | Stmt::Class(_)) {
                self.compile_statement(stmt)?;
            }
        }
        self.emit_op(OpCode::Return);

        let main = self.current;
        debug!(
            instructions = main.instructions.len(),
            constants = self.constants.len(),
            globals = self.globals.len(),
            "compiled program"
        );
        Ok(Function {
            name: main.name,
            bytecode: Bytecode {
                instructions: main.instructions,
                constants: self.constants,
                global_names: self.globals.into_iter().collect(),
                compare_mode: self.compare_mode,
            },
            parameter_count: 0,
            local_count: main.locals.len(),
        })
    }

    fn prescan(&mut self, body: &[Stmt]) {
        for stmt in body {
            match stmt {
                Stmt::Procedure(procedure) => {
                    self.procedures.insert(procedure.name.key());
                    self.declared.insert(procedure.name.key());
                }
                Stmt::Class(class) => {
                    self.declared.insert(class.name.key());
                }
                Stmt::Dim { vars, .. } | Stmt::Field { vars, .. } => {
                    self.declared.extend(vars.iter().map(|var| var.name.key()));
                }
                Stmt::Const { items, .. } => {
                    self.declared.extend(items.iter().map(|item| item.name.key()));
                }
                _ => {}
            }
        }
    }

    // ----- emission -----

    fn emit_op(&mut self, op: OpCode) {
        self.current.instructions.push(op as u8);
    }

    fn emit_u8_op(&mut self, op: OpCode, operand: u8) {
        self.current.instructions.extend([op as u8, operand]);
    }

    fn emit_u16_op(&mut self, op: OpCode, operand: u16) {
        let [high, low] = operand.to_be_bytes();
        self.current.instructions.extend([op as u8, high, low]);
    }

    fn add_constant(&mut self, constant: Constant) -> Result<u16, CompileError> {
        let existing = self
            .constants
            .iter()
            .position(|candidate| same_scalar(candidate, &constant));
        let index = match existing {
            Some(index) => index,
            None => {
                self.constants.push(constant);
                self.constants.len() - 1
            }
        };
        u16::try_from(index).map_err(|_| CompileError::TooManyConstants {
            limit: MAX_CONSTANTS,
        })
    }

    fn emit_constant(&mut self, constant: Constant) -> Result<(), CompileError> {
        let index = self.add_constant(constant)?;
        self.emit_u16_op(OpCode::Constant, index);
        Ok(())
    }

    fn name_constant(&mut self, name: &Ident) -> Result<u16, CompileError> {
        self.add_constant(Constant::String(Arc::from(name.key())))
    }

    fn global(&mut self, key: &str) -> Result<u16, CompileError> {
        let (index, _) = self.globals.insert_full(key.to_string());
        u16::try_from(index).map_err(|_| CompileError::TooManyGlobals { limit: MAX_GLOBALS })
    }

    fn define_local(&mut self, key: String) -> Result<u8, CompileError> {
        let (index, _) = self.current.locals.insert_full(key);
        u8::try_from(index).map_err(|_| CompileError::TooManyLocals {
            function: self.current.name.clone(),
            limit: MAX_LOCALS,
        })
    }

    fn local(&self, key: &str) -> Option<u8> {
        self.current
            .locals
            .get_index_of(key)
            .and_then(|index| u8::try_from(index).ok())
    }

    fn resolve(&mut self, key: &str) -> Result<Slot, CompileError> {
        match self.local(key) {
            Some(index) => Ok(Slot::Local(index)),
            None => Ok(Slot::Global(self.global(key)?)),
        }
    }

    fn emit_get(&mut self, slot: Slot) {
        match slot {
            Slot::Local(index) => self.emit_u8_op(OpCode::GetLocal, index),
            Slot::Global(index) => self.emit_u16_op(OpCode::GetGlobal, index),
        }
    }

    fn emit_set(&mut self, slot: Slot) {
        match slot {
            Slot::Local(index) => self.emit_u8_op(OpCode::SetLocal, index),
            Slot::Global(index) => self.emit_u16_op(OpCode::SetGlobal, index),
        }
    }

    /// Resolves a write target, recording globals as declared from here on.
    fn resolve_store(&mut self, name: &Ident) -> Result<Slot, CompileError> {
        let key = name.key();
        let slot = self.resolve(&key)?;
        if let Slot::Global(_) = slot {
            self.declared.insert(key);
        }
        Ok(slot)
    }

    /// Emits a forward jump with a placeholder offset and returns its position.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        let at = self.current.instructions.len();
        self.emit_u16_op(op, JUMP_PLACEHOLDER);
        at
    }

    fn patch_jump(&mut self, at: usize) -> Result<(), CompileError> {
        let distance = self.current.instructions.len() - at - 3;
        let offset = u16::try_from(distance)
            .ok()
            .filter(|offset| *offset != JUMP_PLACEHOLDER)
            .ok_or(CompileError::JumpTooFar { distance })?;
        let [high, low] = offset.to_be_bytes();
        self.current.instructions[at + 1] = high;
        self.current.instructions[at + 2] = low;
        Ok(())
    }

    fn emit_loop(&mut self, start: usize) -> Result<(), CompileError> {
        let distance = self.current.instructions.len() + 3 - start;
        let offset =
            u16::try_from(distance).map_err(|_| CompileError::JumpTooFar { distance })?;
        self.emit_u16_op(OpCode::Loop, offset);
        Ok(())
    }

    fn here(&self) -> usize {
        self.current.instructions.len()
    }

    // ----- declarations -----

    fn compile_procedure(&mut self, procedure: &Procedure) -> Result<Function, CompileError> {
        let kind = match procedure.kind {
            ProcedureKind::Sub => FunctionKind::Sub,
            ProcedureKind::Function => FunctionKind::Function,
        };
        let outer = std::mem::replace(
            &mut self.current,
            FunctionState::new(procedure.name.key(), kind),
        );
        let result = self.compile_procedure_body(procedure);
        let state = std::mem::replace(&mut self.current, outer);
        result?;
        Ok(Function {
            name: procedure.name.name.clone(),
            bytecode: Bytecode {
                instructions: state.instructions,
                compare_mode: self.compare_mode,
                ..Bytecode::default()
            },
            parameter_count: state.parameter_count,
            local_count: state.locals.len(),
        })
    }

    fn compile_procedure_body(&mut self, procedure: &Procedure) -> Result<(), CompileError> {
        for param in &procedure.params {
            self.define_local(param.name.key())?;
        }
        self.current.parameter_count = procedure.params.len();
        if self.current.kind == FunctionKind::Function {
            // The function's own name is its return-value slot.
            self.define_local(procedure.name.key())?;
        }
        self.compile_block(&procedure.body)?;
        self.emit_return()
    }

    fn emit_return(&mut self) -> Result<(), CompileError> {
        match self.current.kind {
            FunctionKind::Function => {
                let name = self.current.name.clone();
                let slot = self.define_local(name)?;
                self.emit_u8_op(OpCode::GetLocal, slot);
                self.emit_op(OpCode::ReturnValue);
            }
            FunctionKind::Sub | FunctionKind::Main => self.emit_op(OpCode::Return),
        }
        Ok(())
    }

    fn compile_class(&mut self, class: &ClassDecl) -> Result<(), CompileError> {
        self.emit_constant(Constant::Class(Arc::new(class.clone())))?;
        let slot = self.global(&class.name.key())?;
        self.emit_u16_op(OpCode::SetGlobal, slot);
        Ok(())
    }

    fn in_procedure(&self) -> bool {
        self.current.kind != FunctionKind::Main
    }

    fn compile_dim(&mut self, vars: &[VarDecl]) -> Result<(), CompileError> {
        for var in vars {
            let key = var.name.key();
            let slot = if self.in_procedure() {
                Slot::Local(self.define_local(key)?)
            } else {
                self.declared.insert(key.clone());
                Slot::Global(self.global(&key)?)
            };
            if let Some(bounds) = var.bounds.as_deref().filter(|bounds| !bounds.is_empty()) {
                self.emit_op(OpCode::Empty);
                self.compile_bounds(bounds)?;
                self.emit_redim(bounds.len(), REDIM_FIXED)?;
                self.emit_set(slot);
            }
        }
        Ok(())
    }

    fn compile_bounds(&mut self, bounds: &[Expr]) -> Result<(), CompileError> {
        for bound in bounds {
            self.compile_expr(bound)?;
        }
        Ok(())
    }

    fn emit_redim(&mut self, dimensions: usize, flags: u8) -> Result<(), CompileError> {
        let dimensions = u8::try_from(dimensions)
            .map_err(|_| CompileError::TooManyArguments { count: dimensions })?;
        self.current
            .instructions
            .extend([OpCode::ReDim as u8, dimensions, flags]);
        Ok(())
    }

    /// `ReDim` inside a procedure creates a local unless a global of that
    /// name is already known.
    fn redim_slot(&mut self, name: &Ident) -> Result<Slot, CompileError> {
        let key = name.key();
        if self.in_procedure() && self.local(&key).is_none() && !self.declared.contains(&key) {
            return Ok(Slot::Local(self.define_local(key)?));
        }
        self.resolve_store(name)
    }

    // ----- statements -----

    fn compile_block(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        for stmt in body {
            self.compile_statement(stmt)?;
        }
        Ok(())
    }

    fn compile_statement(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Dim { vars, .. } | Stmt::Field { vars, .. } => self.compile_dim(vars)?,
            Stmt::Const { items, .. } => {
                for item in items {
                    self.compile_expr(&item.value)?;
                    let slot = if self.in_procedure() {
                        Slot::Local(self.define_local(item.name.key())?)
                    } else {
                        self.resolve_store(&item.name)?
                    };
                    self.emit_set(slot);
                }
            }
            Stmt::ReDim {
                preserve, items, ..
            } => {
                let flags = if *preserve { REDIM_PRESERVE } else { 0 };
                for item in items {
                    let slot = self.redim_slot(&item.name)?;
                    self.emit_get(slot);
                    self.compile_bounds(&item.bounds)?;
                    self.emit_redim(item.bounds.len(), flags)?;
                    self.emit_set(slot);
                }
            }
            Stmt::Erase { name, .. } => {
                let slot = self.resolve_store(name)?;
                self.emit_get(slot);
                self.emit_op(OpCode::Erase);
                self.emit_set(slot);
            }
            Stmt::Assign { target, value, .. } => self.compile_assignment(target, value)?,
            Stmt::Call { callee, args, .. } => {
                self.compile_call(callee, args)?;
                self.emit_op(OpCode::Pop);
            }
            Stmt::OnError { .. } => {
                let index = self.add_constant(Constant::Ast(Arc::new(stmt.clone())))?;
                self.emit_u16_op(OpCode::ExecAst, index);
            }
            Stmt::Exit { kind, .. } => self.compile_exit(*kind)?,
            Stmt::If {
                condition,
                then_body,
                else_ifs,
                else_body,
                ..
            } => self.compile_if(condition, then_body, else_ifs, else_body.as_deref())?,
            Stmt::For {
                var,
                from,
                to,
                step,
                body,
                ..
            } => self.compile_for(var, from, to, step.as_ref(), body)?,
            Stmt::ForEach {
                var,
                collection,
                body,
                ..
            } => self.compile_for_each(var, collection, body)?,
            Stmt::DoLoop { test, body, .. } => self.compile_do(test.as_ref(), body)?,
            Stmt::While {
                condition, body, ..
            } => {
                let start = self.here();
                self.compile_expr(condition)?;
                let exit = self.emit_jump(OpCode::JumpIfFalse);
                self.compile_loop_body(LoopKind::While, 0, body)?;
                self.emit_loop(start)?;
                self.patch_jump(exit)?;
                self.finish_loop()?;
            }
            Stmt::Select {
                subject,
                cases,
                else_body,
                ..
            } => self.compile_select(subject, cases, else_body.as_deref())?,
            Stmt::With { target, body, .. } => self.compile_with(target, body)?,
            Stmt::Procedure(_) | Stmt::Property(_) | Stmt::Class(_) => {
                return Err(CompileError::unsupported(stmt.kind_name()))
            }
        }
        Ok(())
    }

    fn compile_assignment(&mut self, target: &Expr, value: &Expr) -> Result<(), CompileError> {
        match target {
            Expr::Ident(name) => {
                let slot = self.resolve_store(name)?;
                if is_increment_of(name, value) {
                    match slot {
                        Slot::Local(index) => self.emit_u8_op(OpCode::IncLocal, index),
                        Slot::Global(index) => self.emit_u16_op(OpCode::IncGlobal, index),
                    }
                    return Ok(());
                }
                self.compile_expr(value)?;
                self.emit_set(slot);
            }
            Expr::Member { object, name, .. } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                let index = self.name_constant(name)?;
                self.emit_u16_op(OpCode::SetMember, index);
            }
            Expr::WithMember { name, .. } => {
                self.emit_with_target(target)?;
                self.compile_expr(value)?;
                let index = self.name_constant(name)?;
                self.emit_u16_op(OpCode::SetMember, index);
            }
            Expr::IndexOrCall { object, args, .. } => {
                self.compile_expr(object)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.compile_expr(value)?;
                let count = argument_count(args.len())?;
                self.emit_u8_op(OpCode::SetIndexed, count);
            }
            other => return Err(CompileError::unsupported(other.kind_name())),
        }
        Ok(())
    }

    fn compile_exit(&mut self, kind: ExitKind) -> Result<(), CompileError> {
        let loop_kind = match kind {
            ExitKind::Do => LoopKind::Do,
            ExitKind::For => LoopKind::For,
            ExitKind::Sub | ExitKind::Function | ExitKind::Property => {
                let expected = match kind {
                    ExitKind::Sub => FunctionKind::Sub,
                    ExitKind::Function => FunctionKind::Function,
                    _ => return Err(CompileError::InvalidExit { kind: "Property" }),
                };
                if self.current.kind != expected {
                    return Err(CompileError::InvalidExit {
                        kind: exit_name(kind),
                    });
                }
                // Returning discards the frame's stack, loop operands included.
                return self.emit_return();
            }
        };
        let target = self
            .current
            .loops
            .iter()
            .rposition(|context| context.kind == loop_kind)
            .ok_or(CompileError::InvalidExit {
                kind: exit_name(kind),
            })?;
        let inner: usize = self.current.loops[target + 1..]
            .iter()
            .map(|context| context.stack_values)
            .sum();
        for _ in 0..inner {
            self.emit_op(OpCode::Pop);
        }
        let jump = self.emit_jump(OpCode::Jump);
        self.current.loops[target].exits.push(jump);
        Ok(())
    }

    fn compile_if(
        &mut self,
        condition: &Expr,
        then_body: &[Stmt],
        else_ifs: &[ElseIf],
        else_body: Option<&[Stmt]>,
    ) -> Result<(), CompileError> {
        let mut ends = Vec::new();
        self.compile_expr(condition)?;
        let mut next = self.emit_jump(OpCode::JumpIfFalse);
        self.compile_block(then_body)?;
        for branch in else_ifs {
            ends.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(next)?;
            self.compile_expr(&branch.condition)?;
            next = self.emit_jump(OpCode::JumpIfFalse);
            self.compile_block(&branch.body)?;
        }
        if let Some(else_body) = else_body {
            ends.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(next)?;
            self.compile_block(else_body)?;
        } else {
            self.patch_jump(next)?;
        }
        for end in ends {
            self.patch_jump(end)?;
        }
        Ok(())
    }

    fn compile_loop_body(
        &mut self,
        kind: LoopKind,
        stack_values: usize,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        self.current.loops.push(LoopContext::new(kind, stack_values));
        self.compile_block(body)
    }

    /// Pops the innermost loop and lands its `Exit` jumps here.
    fn finish_loop(&mut self) -> Result<(), CompileError> {
        if let Some(context) = self.current.loops.pop() {
            for exit in context.exits {
                self.patch_jump(exit)?;
            }
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        var: &Ident,
        from: &Expr,
        to: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        let slot = self.resolve_store(var)?;
        self.compile_expr(from)?;
        self.emit_set(slot);
        self.compile_expr(to)?;
        match step {
            Some(step) => self.compile_expr(step)?,
            None => self.emit_constant(Constant::Int(1))?,
        }
        let start = self.here();
        self.emit_get(slot);
        let done = self.emit_jump(OpCode::ForCheck);
        self.compile_loop_body(LoopKind::For, 2, body)?;
        self.emit_get(slot);
        self.emit_op(OpCode::ForStep);
        self.emit_set(slot);
        self.emit_loop(start)?;
        self.patch_jump(done)?;
        self.finish_loop()?;
        self.emit_op(OpCode::Pop);
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn compile_for_each(
        &mut self,
        var: &Ident,
        collection: &Expr,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        let slot = self.resolve_store(var)?;
        self.compile_expr(collection)?;
        self.emit_op(OpCode::IterNew);
        let next = self.here();
        let done = self.emit_jump(OpCode::IterNext);
        self.emit_set(slot);
        self.compile_loop_body(LoopKind::For, 2, body)?;
        self.emit_loop(next)?;
        self.patch_jump(done)?;
        self.finish_loop()?;
        self.emit_op(OpCode::Pop);
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn compile_do(&mut self, test: Option<&LoopTest>, body: &[Stmt]) -> Result<(), CompileError> {
        let start = self.here();
        let mut exits = Vec::new();
        if let Some(test) = test.filter(|test| !test.post) {
            exits.push(self.compile_loop_test(test)?);
        }
        self.compile_loop_body(LoopKind::Do, 0, body)?;
        if let Some(test) = test.filter(|test| test.post) {
            exits.push(self.compile_loop_test(test)?);
        }
        self.emit_loop(start)?;
        for exit in exits {
            self.patch_jump(exit)?;
        }
        self.finish_loop()
    }

    /// Emits the loop condition and returns the jump taken when the loop ends.
    fn compile_loop_test(&mut self, test: &LoopTest) -> Result<usize, CompileError> {
        self.compile_expr(&test.condition)?;
        match test.kind {
            LoopCondition::While => Ok(self.emit_jump(OpCode::JumpIfFalse)),
            LoopCondition::Until => {
                let keep_going = self.emit_jump(OpCode::JumpIfFalse);
                let exit = self.emit_jump(OpCode::Jump);
                self.patch_jump(keep_going)?;
                Ok(exit)
            }
        }
    }

    fn compile_select(
        &mut self,
        subject: &Expr,
        cases: &[CaseClause],
        else_body: Option<&[Stmt]>,
    ) -> Result<(), CompileError> {
        self.compile_expr(subject)?;
        let mut ends = Vec::new();
        for case in cases {
            let mut matched = Vec::new();
            for value in &case.values {
                let misses = self.compile_case_test(value)?;
                matched.push(self.emit_jump(OpCode::Jump));
                for miss in misses {
                    self.patch_jump(miss)?;
                }
            }
            let next_case = self.emit_jump(OpCode::Jump);
            for jump in matched {
                self.patch_jump(jump)?;
            }
            self.emit_op(OpCode::Pop);
            self.compile_block(&case.body)?;
            ends.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(next_case)?;
        }
        self.emit_op(OpCode::Pop);
        if let Some(else_body) = else_body {
            self.compile_block(else_body)?;
        }
        for end in ends {
            self.patch_jump(end)?;
        }
        Ok(())
    }

    /// Tests the subject on top of the stack against one `Case` value, leaving
    /// the subject in place. Returns the jumps taken on a mismatch.
    fn compile_case_test(&mut self, value: &Expr) -> Result<Vec<usize>, CompileError> {
        match value {
            Expr::Range { low, high, .. } => {
                self.emit_op(OpCode::Dup);
                self.compile_expr(low)?;
                self.emit_op(OpCode::Ge);
                let below = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_op(OpCode::Dup);
                self.compile_expr(high)?;
                self.emit_op(OpCode::Le);
                let above = self.emit_jump(OpCode::JumpIfFalse);
                Ok(vec![below, above])
            }
            Expr::Binary {
                op, left, right, ..
            } if matches!(**left, Expr::Missing(_)) => {
                self.emit_op(OpCode::Dup);
                self.compile_expr(right)?;
                self.emit_op(binary_opcode(*op));
                Ok(vec![self.emit_jump(OpCode::JumpIfFalse)])
            }
            other => {
                self.emit_op(OpCode::Dup);
                self.compile_expr(other)?;
                self.emit_op(OpCode::Eq);
                Ok(vec![self.emit_jump(OpCode::JumpIfFalse)])
            }
        }
    }

    fn compile_with(&mut self, target: &Expr, body: &[Stmt]) -> Result<(), CompileError> {
        let depth = self.current.with_slots.len();
        let slot = self.define_local(format!("]with{depth}"))?;
        self.compile_expr(target)?;
        self.emit_u8_op(OpCode::SetLocal, slot);
        self.current.with_slots.push(slot);
        let result = self.compile_block(body);
        self.current.with_slots.pop();
        result
    }

    fn emit_with_target(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let slot = self
            .current
            .with_slots
            .last()
            .copied()
            .ok_or(CompileError::unsupported(expr.kind_name()))?;
        self.emit_u8_op(OpCode::GetLocal, slot);
        Ok(())
    }

    // ----- expressions -----

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Literal(literal, _) => self.compile_literal(literal)?,
            Expr::Ident(name) => self.compile_identifier(name)?,
            Expr::Unary { op, operand, .. } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Plus => {}
                    UnaryOp::Minus => self.emit_op(OpCode::Neg),
                    UnaryOp::Not => self.emit_op(OpCode::Not),
                }
            }
            Expr::Binary {
                op, left, right, ..
            } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit_op(binary_opcode(*op));
            }
            Expr::Member { object, name, .. } => {
                self.compile_expr(object)?;
                let index = self.name_constant(name)?;
                self.emit_u16_op(OpCode::GetMember, index);
            }
            Expr::WithMember { name, .. } => {
                self.emit_with_target(expr)?;
                let index = self.name_constant(name)?;
                self.emit_u16_op(OpCode::GetMember, index);
            }
            Expr::IndexOrCall { object, args, .. } => self.compile_call(object, args)?,
            Expr::New { class, .. } => {
                let index = self.name_constant(class)?;
                self.emit_u16_op(OpCode::New, index);
            }
            Expr::Missing(_) => self.emit_op(OpCode::Missing),
            Expr::Range { .. } => return Err(CompileError::unsupported(expr.kind_name())),
        }
        Ok(())
    }

    fn compile_literal(&mut self, literal: &Literal) -> Result<(), CompileError> {
        match literal {
            Literal::Int(value) => self.emit_constant(Constant::Int(*value))?,
            Literal::Float(value) => self.emit_constant(Constant::Float(*value))?,
            Literal::String(text) => self.emit_constant(Constant::String(Arc::from(text.as_str())))?,
            Literal::Date(value) => self.emit_constant(Constant::Date(*value))?,
            Literal::Bool(true) => self.emit_op(OpCode::True),
            Literal::Bool(false) => self.emit_op(OpCode::False),
            Literal::Null => self.emit_op(OpCode::Null),
            Literal::Empty => self.emit_op(OpCode::Empty),
            Literal::Nothing => self.emit_op(OpCode::Nothing),
        }
        Ok(())
    }

    fn compile_identifier(&mut self, name: &Ident) -> Result<(), CompileError> {
        let key = name.key();
        if let Some(index) = self.local(&key) {
            self.emit_u8_op(OpCode::GetLocal, index);
            return Ok(());
        }
        let slot = self.global(&key)?;
        self.emit_u16_op(OpCode::GetGlobal, slot);
        // A bare procedure name is a call without arguments.
        if self.procedures.contains(&key) {
            self.emit_u8_op(OpCode::Call, 0);
        }
        Ok(())
    }

    /// Leaves the result of `callee(args)` on the stack.
    fn compile_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<(), CompileError> {
        let count = argument_count(args.len())?;
        match callee {
            Expr::Member { object, name, .. } => {
                self.compile_expr(object)?;
                self.compile_arguments(args)?;
                let index = self.name_constant(name)?;
                self.emit_call_method(index, count);
                return Ok(());
            }
            Expr::WithMember { name, .. } => {
                self.emit_with_target(callee)?;
                self.compile_arguments(args)?;
                let index = self.name_constant(name)?;
                self.emit_call_method(index, count);
                return Ok(());
            }
            Expr::Ident(name) => self.compile_call_target(name)?,
            other => self.compile_expr(other)?,
        }
        self.compile_arguments(args)?;
        self.emit_u8_op(OpCode::Call, count);
        Ok(())
    }

    /// Loads the callee of `name(...)`. Inside a Function, call syntax on its
    /// own name recurses; only a bare reference reads the return slot.
    fn compile_call_target(&mut self, name: &Ident) -> Result<(), CompileError> {
        let key = name.key();
        let recursive = self.current.kind == FunctionKind::Function && self.current.name == key;
        if !recursive {
            if let Some(index) = self.local(&key) {
                self.emit_u8_op(OpCode::GetLocal, index);
                return Ok(());
            }
        }
        if recursive || self.declared.contains(&key) {
            let slot = self.global(&key)?;
            self.emit_u16_op(OpCode::GetGlobal, slot);
            return Ok(());
        }
        self.emit_constant(Constant::Builtin(Arc::from(key)))
    }

    fn compile_arguments(&mut self, args: &[Expr]) -> Result<(), CompileError> {
        for arg in args {
            self.compile_expr(arg)?;
        }
        Ok(())
    }

    fn emit_call_method(&mut self, name: u16, count: u8) {
        let [high, low] = name.to_be_bytes();
        self.current
            .instructions
            .extend([OpCode::CallMethod as u8, high, low, count]);
    }
}

fn argument_count(count: usize) -> Result<u8, CompileError> {
    if count > MAX_ARGUMENTS {
        return Err(CompileError::TooManyArguments { count });
    }
    u8::try_from(count).map_err(|_| CompileError::TooManyArguments { count })
}

fn binary_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Sub => OpCode::Sub,
        BinaryOp::Mul => OpCode::Mul,
        BinaryOp::Div => OpCode::Div,
        BinaryOp::IntDiv => OpCode::IntDiv,
        BinaryOp::Mod => OpCode::Mod,
        BinaryOp::Pow => OpCode::Pow,
        BinaryOp::Concat => OpCode::Concat,
        BinaryOp::Eq => OpCode::Eq,
        BinaryOp::Ne => OpCode::Ne,
        BinaryOp::Lt => OpCode::Lt,
        BinaryOp::Gt => OpCode::Gt,
        BinaryOp::Le => OpCode::Le,
        BinaryOp::Ge => OpCode::Ge,
        BinaryOp::Is => OpCode::Is,
        BinaryOp::And => OpCode::And,
        BinaryOp::Or => OpCode::Or,
        BinaryOp::Xor => OpCode::Xor,
        BinaryOp::Eqv => OpCode::Eqv,
        BinaryOp::Imp => OpCode::Imp,
    }
}

fn exit_name(kind: ExitKind) -> &'static str {
    match kind {
        ExitKind::Do => "Do",
        ExitKind::For => "For",
        ExitKind::Sub => "Sub",
        ExitKind::Function => "Function",
        ExitKind::Property => "Property",
    }
}

/// `x = x + 1`
fn is_increment_of(name: &Ident, value: &Expr) -> bool {
    match value {
        Expr::Binary {
            op: BinaryOp::Add,
            left,
            right,
            ..
        } => {
            matches!(&**left, Expr::Ident(other) if other.is(&name.name))
                && matches!(&**right, Expr::Literal(Literal::Int(1), _))
        }
        _ => false,
    }
}

/// Scalar constants are interned; functions, classes and statements are not.
fn same_scalar(a: &Constant, b: &Constant) -> bool {
    match (a, b) {
        (Constant::Int(a), Constant::Int(b)) => a == b,
        (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
        (Constant::String(a), Constant::String(b)) => a == b,
        (Constant::Date(a), Constant::Date(b)) => a == b,
        (Constant::Builtin(a), Constant::Builtin(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::compile;
    use crate::bytecode::{disassemble, Constant, Function};
    use crate::error::CompileError;
    use vbs_parser::parse_program;
    use vbs_syntax::CompareMode;

    fn compile_source(source: &str) -> Function {
        let program = parse_program(source).expect("parse");
        compile(&program).expect("compile")
    }

    fn compile_error(source: &str) -> CompileError {
        let program = parse_program(source).expect("parse");
        compile(&program).expect_err("compile should fail")
    }

    #[test]
    fn assignment_to_global() {
        let main = compile_source("Dim x\nx = 10");
        let listing = disassemble(&main);
        assert!(listing.contains("CONSTANT 0 (10)"), "{listing}");
        assert!(listing.contains("SET_GLOBAL 0 (x)"), "{listing}");
        assert_eq!(main.bytecode.global_names, vec!["x".to_string()]);
        assert_eq!(main.local_count, 0);
    }

    #[test]
    fn identifiers_share_slots_regardless_of_case() {
        let main = compile_source("Foo = 1\nFOO = FOO & \"x\"\nfoo = 3");
        assert_eq!(main.bytecode.global_names, vec!["foo".to_string()]);
    }

    #[test]
    fn increment_is_folded() {
        let listing = disassemble(&compile_source("x = 1 : x = x + 1"));
        assert!(listing.contains("INC_GLOBAL 0 (x)"), "{listing}");
        assert!(!listing.contains("ADD"), "{listing}");

        let listing = disassemble(&compile_source("x = 1 : x = y + 1"));
        assert!(listing.contains("ADD"), "{listing}");
    }

    #[test]
    fn unknown_call_targets_become_builtins() {
        let main = compile_source("n = Len(\"abc\")\nDim a(2)\nv = a(1)");
        let listing = disassemble(&main);
        assert!(listing.contains("(<builtin len>)"), "{listing}");
        assert!(!listing.contains("<builtin a>"), "{listing}");
    }

    #[test]
    fn procedures_are_hoisted_and_forward_callable() {
        let main = compile_source("x = Twice(2)\nFunction Twice(n)\nTwice = n * 2\nEnd Function");
        let listing = disassemble(&main);
        let first = listing.lines().nth(1).expect("first instruction");
        assert!(first.contains("<function Twice>"), "{listing}");
        assert!(!listing.contains("<builtin twice>"), "{listing}");
        let twice = main
            .bytecode
            .constants
            .iter()
            .find_map(|constant| match constant {
                Constant::Function(function) => Some(function.clone()),
                _ => None,
            })
            .expect("function constant");
        assert_eq!(twice.parameter_count, 1);
        assert_eq!(twice.local_count, 2);
        assert!(twice.bytecode.constants.is_empty());
        assert!(listing.contains("RETURN_VALUE"), "{listing}");
    }

    #[test]
    fn recursive_call_loads_the_function_not_the_return_slot() {
        let main = compile_source(
            "Function Fact(n)\nIf n <= 1 Then\nFact = 1\nElse\nFact = n * Fact(n - 1)\nEnd If\nEnd Function",
        );
        let listing = disassemble(&main);
        assert!(listing.contains("GET_GLOBAL 0 (fact)"), "{listing}");
    }

    #[test]
    fn parenthesized_self_call_without_arguments_recurses() {
        let main = compile_source("Function Down()\nDown = Down() + 1\nEnd Function");
        let listing = disassemble(&main);
        let body = listing
            .split("== Down")
            .nth(1)
            .expect("function listing");
        assert!(body.contains("GET_GLOBAL 0 (down)"), "{listing}");
        assert!(body.contains("CALL 0"), "{listing}");
    }

    #[test]
    fn constants_are_interned() {
        let main = compile_source("a = \"x\"\nb = \"x\"\nc = 1.5\nd = 1.5");
        assert_eq!(main.bytecode.constants.len(), 2);
    }

    #[test]
    fn class_declaration_is_an_opaque_constant() {
        let main = compile_source("Class Point\nPublic X\nEnd Class\nSet p = New Point");
        assert!(main
            .bytecode
            .constants
            .iter()
            .any(|constant| matches!(constant, Constant::Class(class) if class.name.is("point"))));
        let listing = disassemble(&main);
        assert!(listing.contains("NEW"), "{listing}");
    }

    #[test]
    fn on_error_is_left_to_the_host() {
        let listing = disassemble(&compile_source("On Error Resume Next\nx = 1"));
        assert!(listing.contains("EXEC_AST 0 (<OnErrorStatement>)"), "{listing}");
    }

    #[test]
    fn with_uses_a_hidden_local() {
        let main = compile_source("With obj\n.Name = \"a\"\nx = .Name\nEnd With");
        assert_eq!(main.local_count, 1);
        let listing = disassemble(&main);
        assert!(listing.contains("SET_MEMBER"), "{listing}");
        assert!(listing.contains("GET_MEMBER"), "{listing}");
    }

    #[test]
    fn exit_outside_its_block_is_rejected() {
        assert_eq!(
            compile_error("Sub S\nExit Function\nEnd Sub"),
            CompileError::InvalidExit { kind: "Function" }
        );
    }

    #[test]
    fn option_compare_is_recorded() {
        let main = compile_source("Option Compare Text\nx = \"a\" = \"A\"");
        assert_eq!(main.bytecode.compare_mode, CompareMode::Text);
        assert_eq!(
            compile_source("x = 1").bytecode.compare_mode,
            CompareMode::Binary
        );
    }

    #[test]
    fn jumps_are_patched() {
        let main = compile_source("If a Then\nx = 1\nElseIf b Then\nx = 2\nElse\nx = 3\nEnd If");
        let code = &main.bytecode.instructions;
        assert!(!code.windows(2).any(|pair| pair == [0xFF, 0xFF]));
    }
}
