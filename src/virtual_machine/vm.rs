//! Core virtual machine implementation.
//!
//! The interpreter fetches one opcode at a time from the current context's
//! code, charges its gas, decodes its operands and dispatches to a handler.
//! A run ends `Halted` when the root frame of the root context returns, or
//! `Faulted` on the first error, after which all run state is discarded.

pub mod context;
pub mod gas;
pub mod heap;
mod registers;
pub mod stack;

use crate::virtual_machine::config::RunParams;
use crate::virtual_machine::disassembler::instruction_starts;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::extcall::{Effect, HostFrame};
use crate::virtual_machine::isa::Opcode;
use crate::virtual_machine::operand::{Cursor, Literal, NameOperand};
use crate::virtual_machine::script::Script;
use crate::virtual_machine::value::VMObject;
use context::{CallFrame, Context, ContextFrame, ContextRef, ExecContext};
use gas::{GasCategory, GasMeter, GasProfile};
use heap::{Aggregate, Heap};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use registers::Registers;
use stack::OperandStack;
use std::sync::Arc;

/// Name of the context a run starts in.
pub const ROOT_CONTEXT: &str = "entry";

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        ctx = $ctx:ident,
        cursor = $cursor:ident,
        opcode = $opcode:ident,
        { $( $variant:ident => $handler:ident $args:tt ),* $(,)? }
    ) => {{
        match $opcode {
            $(
                Opcode::$variant => {
                    let instr_name = $opcode.mnemonic();
                    exec_vm!(@call $vm, $ctx, $cursor, instr_name, $handler, $args)
                }
            ),*
        }
    }};

    // Handler that needs the host collaborators (semicolon separator)
    (@call $vm:ident, $ctx:ident, $cursor:ident, $instr_name:expr, $handler:ident,
        (ctx; $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $cursor, $kind)?; )*
        $vm.current.ip = $cursor.position();
        $vm.$handler($instr_name, $ctx, $( $field ),*)
    }};

    // Handler on VM state only (no semicolon)
    (@call $vm:ident, $ctx:ident, $cursor:ident, $instr_name:expr, $handler:ident,
        ( $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $cursor, $kind)?; )*
        $vm.current.ip = $cursor.position();
        $vm.$handler($instr_name, $( $field ),*)
    }};

    // Decode a u8 register index
    (@read $cursor:ident, Reg) => {{
        $cursor.read_u8()
    }};

    // Decode a tagged inline literal
    (@read $cursor:ident, Literal) => {{
        $cursor.read_literal()
    }};

    // Decode an absolute jump target (u32 LE)
    (@read $cursor:ident, Target) => {{
        $cursor.read_u32().map(|v| v as usize)
    }};

    // Decode a u32 immediate
    (@read $cursor:ident, ImmU32) => {{
        $cursor.read_u32().map(|v| v as usize)
    }};

    // Decode an extcall name (register or inline string)
    (@read $cursor:ident, Name) => {{
        $cursor.read_name()
    }};
}

/// Run state of a [`VM`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionState {
    Running,
    /// The root frame returned; the operand stack holds the result.
    Halted,
    /// A fault stopped the run; see [`VM::fault`].
    Faulted,
}

/// Bytecode virtual machine.
///
/// One instance executes one run of a [`Script`]: it owns the context stack,
/// the call frames, the shared operand stack, the aggregate heap and the gas
/// meter. Host collaborators (extcalls, switchable contexts) are borrowed per
/// call to [`VM::run`].
pub struct VM {
    state: ExecutionState,
    /// Context currently executing.
    current: ContextFrame,
    /// Contexts suspended by `switch`, innermost last.
    suspended: Vec<ContextFrame>,
    /// Call frames across all contexts; each context starts with a root frame.
    frames: Vec<CallFrame>,
    stack: OperandStack,
    heap: Heap,
    gas: GasMeter,
    params: RunParams,
    fault: Option<VMError>,
}

impl VM {
    /// Prepares a run of `script`.
    ///
    /// Fails when the script exceeds the size limit or does not decode.
    pub fn new(script: &Script, params: RunParams) -> Result<Self, VMError> {
        let limits = &params.limits;
        if script.len() > limits.max_script_size {
            return Err(VMError::ScriptTooLarge {
                size: script.len(),
                limit: limits.max_script_size,
            });
        }
        let code = script.shared_code();
        let starts = instruction_starts(&code)?;
        let current = ContextFrame::new(
            ROOT_CONTEXT.to_string(),
            code,
            starts.into(),
            limits.register_count(),
        );

        Ok(Self {
            state: ExecutionState::Running,
            current,
            suspended: Vec::new(),
            frames: vec![CallFrame::root()],
            stack: OperandStack::new(limits.max_stack_depth),
            heap: Heap::new(limits.max_heap_objects),
            gas: GasMeter::new(params.gas_limit, params.gas_price),
            params,
            fault: None,
        })
    }

    /// Executes until the run halts or faults.
    ///
    /// On fault every register, frame, context, stack entry and aggregate is
    /// dropped and the error is kept for [`VM::fault`]. Calling `run` again on
    /// a finished VM returns the same outcome without executing anything.
    pub fn run(&mut self, ctx: &ExecContext<'_>) -> Result<(), VMError> {
        while self.state == ExecutionState::Running {
            if let Err(err) = self.step(ctx) {
                self.abort(err.clone());
                return Err(err);
            }
        }
        match &self.fault {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn abort(&mut self, err: VMError) {
        self.current.registers.clear();
        self.suspended.clear();
        self.frames.clear();
        self.stack.clear();
        self.heap.clear();
        self.state = ExecutionState::Faulted;
        self.fault = Some(err);
    }

    /// Executes a single instruction of the current context.
    fn step(&mut self, ctx: &ExecContext<'_>) -> Result<(), VMError> {
        let offset = self.current.ip;
        if offset >= self.current.code.len() {
            return self.op_ret("ret");
        }

        let code = Arc::clone(&self.current.code);
        let byte = code[offset];
        let opcode = Opcode::try_from(byte)
            .map_err(|_| VMError::InvalidInstruction { opcode: byte, offset })?;
        self.charge(self.params.schedule.opcode_cost(opcode), GasCategory::OpcodeBase)?;

        let mut cursor = Cursor::new(&code, offset + 1);
        self.exec(opcode, ctx, &mut cursor)
    }

    /// Decodes operands and runs the handler for `opcode`.
    fn exec(
        &mut self,
        opcode: Opcode,
        ctx: &ExecContext<'_>,
        cursor: &mut Cursor<'_>,
    ) -> Result<(), VMError> {
        exec_vm! {
            vm = self,
            ctx = ctx,
            cursor = cursor,
            opcode = opcode,
            {
                // Registers and stack
                Nop => op_nop(),
                Move => op_move(src: Reg, dst: Reg),
                Copy => op_copy(src: Reg, dst: Reg),
                Load => op_load(dst: Reg, literal: Literal),
                Push => op_push(src: Reg),
                Pop => op_pop(dst: Reg),
                Swap => op_swap(a: Reg, b: Reg),
                // Control flow
                Call => op_call(target: Target),
                ExtCall => op_extcall(ctx; method: Name),
                Jmp => op_jmp(target: Target),
                JmpIf => op_jmp_if(cond: Reg, target: Target),
                JmpNot => op_jmp_not(cond: Reg, target: Target),
                Ret => op_ret(),
                Throw => op_throw(),
                // Logic and comparison
                Not => op_not(src: Reg, dst: Reg),
                And => op_and(a: Reg, b: Reg, dst: Reg),
                Or => op_or(a: Reg, b: Reg, dst: Reg),
                Xor => op_xor(a: Reg, b: Reg, dst: Reg),
                Equal => op_equal(a: Reg, b: Reg, dst: Reg),
                Lt => op_lt(a: Reg, b: Reg, dst: Reg),
                Gt => op_gt(a: Reg, b: Reg, dst: Reg),
                Lte => op_lte(a: Reg, b: Reg, dst: Reg),
                Gte => op_gte(a: Reg, b: Reg, dst: Reg),
                // Numeric
                Inc => op_inc(reg: Reg),
                Dec => op_dec(reg: Reg),
                Sign => op_sign(src: Reg, dst: Reg),
                Negate => op_negate(src: Reg, dst: Reg),
                Abs => op_abs(src: Reg, dst: Reg),
                Add => op_add(a: Reg, b: Reg, dst: Reg),
                Sub => op_sub(a: Reg, b: Reg, dst: Reg),
                Mul => op_mul(a: Reg, b: Reg, dst: Reg),
                Div => op_div(a: Reg, b: Reg, dst: Reg),
                Mod => op_mod(a: Reg, b: Reg, dst: Reg),
                Shl => op_shl(a: Reg, b: Reg, dst: Reg),
                Shr => op_shr(a: Reg, b: Reg, dst: Reg),
                Min => op_min(a: Reg, b: Reg, dst: Reg),
                Max => op_max(a: Reg, b: Reg, dst: Reg),
                // Contexts
                Ctx => op_ctx(ctx; src: Reg, dst: Reg),
                Switch => op_switch(ctx; src: Reg),
                // Aggregates and data
                Put => op_put(src: Reg, dst: Reg, key: Reg),
                Get => op_get(src: Reg, dst: Reg, key: Reg),
                Cat => op_cat(a: Reg, b: Reg, dst: Reg),
                Left => op_left(src: Reg, dst: Reg, len: ImmU32),
                Right => op_right(src: Reg, dst: Reg, len: ImmU32),
                Size => op_size(src: Reg, dst: Reg),
            }
        }
    }

    // ==================== Accessors ====================

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Operand stack, bottom to top. After a halt this is the run's result.
    pub fn stack(&self) -> &[VMObject] {
        self.stack.as_slice()
    }

    /// Value of a register in the current context, if set.
    pub fn register(&self, idx: u8) -> Option<&VMObject> {
        self.current.registers.get_opt(idx).ok().flatten()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn gas_used(&self) -> u64 {
        self.gas.used()
    }

    pub fn gas_remaining(&self) -> u64 {
        self.gas.remaining()
    }

    pub fn gas_profile(&self) -> &GasProfile {
        self.gas.profile()
    }

    /// Fee owed for the gas used (`used * price`).
    pub fn fee(&self) -> u128 {
        self.gas.fee()
    }

    /// The error that stopped the run, if it faulted.
    pub fn fault(&self) -> Option<&VMError> {
        self.fault.as_ref()
    }

    /// Name of the executing context.
    pub fn context_name(&self) -> &str {
        &self.current.name
    }

    // ==================== Helpers ====================

    fn charge(&mut self, amount: u64, category: GasCategory) -> Result<(), VMError> {
        self.gas.charge(amount, category)
    }

    fn regs(&self) -> &Registers {
        &self.current.registers
    }

    fn set(&mut self, dst: u8, value: VMObject) -> Result<(), VMError> {
        self.current.registers.set(dst, value)
    }

    fn host_frame(&mut self) -> HostFrame<'_> {
        HostFrame {
            heap: &mut self.heap,
            stack: &mut self.stack,
            gas: &mut self.gas,
            schedule: &self.params.schedule,
            read_only: self.params.read_only,
        }
    }

    fn push_frame(&mut self, frame: CallFrame) -> Result<(), VMError> {
        let limit = self.params.limits.max_call_depth;
        if self.frames.len() >= limit {
            return Err(VMError::CallDepthExceeded(limit));
        }
        self.frames.push(frame);
        Ok(())
    }

    fn jump(&mut self, target: usize) -> Result<(), VMError> {
        if !self.current.is_boundary(target) {
            return Err(VMError::InvalidJumpTarget {
                target,
                len: self.current.code.len(),
            });
        }
        self.current.ip = target;
        Ok(())
    }

    /// Stores an integer result after checking it against the width limit.
    fn set_int(&mut self, dst: u8, value: BigInt) -> Result<(), VMError> {
        let limit = self.params.limits.max_integer_bits;
        let bits = value.bits();
        if bits > limit {
            return Err(VMError::IntegerTooLarge { bits, limit });
        }
        self.set(dst, VMObject::Integer(value))
    }

    fn unary_int<F>(&mut self, instr: &'static str, src: u8, dst: u8, f: F) -> Result<(), VMError>
    where
        F: FnOnce(&BigInt) -> BigInt,
    {
        let result = f(self.regs().get_int(src, instr, 0)?);
        self.set_int(dst, result)
    }

    fn binary_int<F>(
        &mut self,
        instr: &'static str,
        a: u8,
        b: u8,
        dst: u8,
        f: F,
    ) -> Result<(), VMError>
    where
        F: FnOnce(&BigInt, &BigInt) -> Result<BigInt, VMError>,
    {
        let regs = self.regs();
        let result = f(regs.get_int(a, instr, 0)?, regs.get_int(b, instr, 1)?)?;
        self.set_int(dst, result)
    }

    fn compare<F>(&mut self, instr: &'static str, a: u8, b: u8, dst: u8, f: F) -> Result<(), VMError>
    where
        F: FnOnce(&BigInt, &BigInt) -> bool,
    {
        let regs = self.regs();
        let result = f(regs.get_int(a, instr, 0)?, regs.get_int(b, instr, 1)?);
        self.set(dst, VMObject::Bool(result))
    }

    fn logic<F>(&mut self, instr: &'static str, a: u8, b: u8, dst: u8, f: F) -> Result<(), VMError>
    where
        F: FnOnce(bool, bool) -> bool,
    {
        let regs = self.regs();
        let result = f(regs.get_bool(a, instr, 0)?, regs.get_bool(b, instr, 1)?);
        self.set(dst, VMObject::Bool(result))
    }

    /// Combined operand width, for size-proportional arithmetic gas.
    fn operand_bits(&self, instr: &'static str, a: u8, b: u8) -> Result<u64, VMError> {
        let regs = self.regs();
        Ok(regs.get_int(a, instr, 0)?.bits() + regs.get_int(b, instr, 1)?.bits())
    }

    /// Shift amount as a non-negative machine integer; `None` when it does not fit.
    fn shift_amount(&self, instr: &'static str, b: u8) -> Result<Option<u64>, VMError> {
        let amount = self.regs().get_int(b, instr, 1)?;
        if amount.is_negative() {
            return Err(VMError::NegativeShift(instr));
        }
        Ok(amount.to_u64())
    }

    // ==================== Registers and stack ====================

    fn op_nop(&mut self, _instr: &'static str) -> Result<(), VMError> {
        Ok(())
    }

    fn op_move(&mut self, instr: &'static str, src: u8, dst: u8) -> Result<(), VMError> {
        let value = self.regs().get(src, instr)?.clone();
        self.set(dst, value)
    }

    fn op_copy(&mut self, instr: &'static str, src: u8, dst: u8) -> Result<(), VMError> {
        let value = self.regs().get(src, instr)?.clone();
        let entries = self.heap.footprint(&value)?;
        self.charge(
            self.params.schedule.entries_cost(entries),
            GasCategory::HeapAllocation,
        )?;
        if let VMObject::String(_) | VMObject::Bytes(_) = value {
            let len = value.as_bytes()?.len();
            self.charge(self.params.schedule.bytes_cost(len), GasCategory::Memory)?;
        }
        let copied = self.heap.deep_copy(&value)?;
        self.set(dst, copied)
    }

    fn op_load(&mut self, _instr: &'static str, dst: u8, literal: Literal) -> Result<(), VMError> {
        match literal {
            Literal::Integer(value) => self.set_int(dst, value),
            other => self.set(dst, other.into_object()),
        }
    }

    fn op_push(&mut self, instr: &'static str, src: u8) -> Result<(), VMError> {
        let value = self.regs().get(src, instr)?.clone();
        self.stack.push(value)
    }

    fn op_pop(&mut self, instr: &'static str, dst: u8) -> Result<(), VMError> {
        let value = self.stack.pop(instr)?;
        self.set(dst, value)
    }

    fn op_swap(&mut self, _instr: &'static str, a: u8, b: u8) -> Result<(), VMError> {
        self.current.registers.swap(a, b)
    }

    // ==================== Control flow ====================

    fn op_call(&mut self, _instr: &'static str, target: usize) -> Result<(), VMError> {
        if !self.current.is_boundary(target) {
            return Err(VMError::InvalidJumpTarget {
                target,
                len: self.current.code.len(),
            });
        }
        self.push_frame(CallFrame::returning_to(self.current.ip))?;
        self.current.ip = target;
        Ok(())
    }

    fn op_extcall(
        &mut self,
        instr: &'static str,
        ctx: &ExecContext<'_>,
        method: NameOperand,
    ) -> Result<(), VMError> {
        let name = match method {
            NameOperand::Inline(name) => name,
            NameOperand::Reg(r) => self.regs().get_str(r, instr, 0)?.to_string(),
        };
        let call = ctx
            .extcalls
            .get(&name)
            .ok_or(VMError::UnknownExtcall(name))?;

        let mut args = Vec::with_capacity(call.arity() as usize);
        for _ in 0..call.arity() {
            args.push(self.stack.pop(instr)?);
        }
        if self.params.read_only && call.effect() == Effect::Mutating {
            return Ok(());
        }

        let results = call.invoke(&mut self.host_frame(), args)?;
        for value in results {
            self.stack.push(value)?;
        }
        Ok(())
    }

    fn op_jmp(&mut self, _instr: &'static str, target: usize) -> Result<(), VMError> {
        self.jump(target)
    }

    fn op_jmp_if(&mut self, instr: &'static str, cond: u8, target: usize) -> Result<(), VMError> {
        if self.regs().get_bool(cond, instr, 0)? {
            self.jump(target)?;
        }
        Ok(())
    }

    fn op_jmp_not(&mut self, instr: &'static str, cond: u8, target: usize) -> Result<(), VMError> {
        if !self.regs().get_bool(cond, instr, 0)? {
            self.jump(target)?;
        }
        Ok(())
    }

    /// Returns from a call, leaves a switched context, or halts at the root.
    fn op_ret(&mut self, instr: &'static str) -> Result<(), VMError> {
        let frame = self.frames.pop().ok_or(VMError::StackUnderflow(instr))?;
        if let Some(addr) = frame.return_addr {
            self.current.ip = addr;
            return Ok(());
        }

        match self.suspended.pop() {
            Some(caller) => self.current = caller,
            None => self.state = ExecutionState::Halted,
        }
        Ok(())
    }

    fn op_throw(&mut self, instr: &'static str) -> Result<(), VMError> {
        let value = self.stack.pop(instr)?;
        Err(VMError::Thrown(value))
    }

    // ==================== Logic and comparison ====================

    fn op_not(&mut self, instr: &'static str, src: u8, dst: u8) -> Result<(), VMError> {
        let value = self.regs().get_bool(src, instr, 0)?;
        self.set(dst, VMObject::Bool(!value))
    }

    fn op_and(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.logic(instr, a, b, dst, |x, y| x && y)
    }

    fn op_or(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.logic(instr, a, b, dst, |x, y| x || y)
    }

    fn op_xor(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.logic(instr, a, b, dst, |x, y| x ^ y)
    }

    fn op_equal(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        let regs = self.regs();
        let result = self
            .heap
            .structural_eq(regs.get(a, instr)?, regs.get(b, instr)?)?;
        self.set(dst, VMObject::Bool(result))
    }

    fn op_lt(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.compare(instr, a, b, dst, |x, y| x < y)
    }

    fn op_gt(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.compare(instr, a, b, dst, |x, y| x > y)
    }

    fn op_lte(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.compare(instr, a, b, dst, |x, y| x <= y)
    }

    fn op_gte(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.compare(instr, a, b, dst, |x, y| x >= y)
    }

    // ==================== Numeric ====================

    fn op_inc(&mut self, instr: &'static str, reg: u8) -> Result<(), VMError> {
        self.unary_int(instr, reg, reg, |v| v + 1u32)
    }

    fn op_dec(&mut self, instr: &'static str, reg: u8) -> Result<(), VMError> {
        self.unary_int(instr, reg, reg, |v| v - 1u32)
    }

    fn op_sign(&mut self, instr: &'static str, src: u8, dst: u8) -> Result<(), VMError> {
        self.unary_int(instr, src, dst, |v| v.signum())
    }

    fn op_negate(&mut self, instr: &'static str, src: u8, dst: u8) -> Result<(), VMError> {
        self.unary_int(instr, src, dst, |v| -v)
    }

    fn op_abs(&mut self, instr: &'static str, src: u8, dst: u8) -> Result<(), VMError> {
        self.unary_int(instr, src, dst, |v| v.abs())
    }

    fn op_add(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.binary_int(instr, a, b, dst, |x, y| Ok(x + y))
    }

    fn op_sub(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.binary_int(instr, a, b, dst, |x, y| Ok(x - y))
    }

    fn op_mul(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        let bits = self.operand_bits(instr, a, b)?;
        self.charge(self.params.schedule.words_cost(bits), GasCategory::Arithmetic)?;
        self.binary_int(instr, a, b, dst, |x, y| Ok(x * y))
    }

    fn op_div(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.binary_int(instr, a, b, dst, |x, y| {
            if y.is_zero() {
                return Err(VMError::DivisionByZero(instr));
            }
            Ok(x / y)
        })
    }

    fn op_mod(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.binary_int(instr, a, b, dst, |x, y| {
            if y.is_zero() {
                return Err(VMError::DivisionByZero(instr));
            }
            Ok(x % y)
        })
    }

    fn op_shl(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        let shift = self.shift_amount(instr, b)?;
        let value = self.regs().get_int(a, instr, 0)?;
        if value.is_zero() {
            return self.set_int(dst, BigInt::zero());
        }

        // Reject before shifting so huge amounts never allocate.
        let limit = self.params.limits.max_integer_bits;
        let bits = shift
            .and_then(|s| value.bits().checked_add(s))
            .unwrap_or(u64::MAX);
        if bits > limit {
            return Err(VMError::IntegerTooLarge { bits, limit });
        }
        self.charge(self.params.schedule.words_cost(bits), GasCategory::Arithmetic)?;
        let result = self.regs().get_int(a, instr, 0)? << shift.unwrap_or(0);
        self.set_int(dst, result)
    }

    fn op_shr(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        let shift = self.shift_amount(instr, b)?;
        let value = self.regs().get_int(a, instr, 0)?;
        let result = match shift {
            Some(s) if s < value.bits() => value >> s,
            _ if value.is_negative() => BigInt::from(-1),
            _ => BigInt::zero(),
        };
        self.set_int(dst, result)
    }

    fn op_min(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.binary_int(instr, a, b, dst, |x, y| Ok(x.min(y).clone()))
    }

    fn op_max(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        self.binary_int(instr, a, b, dst, |x, y| Ok(x.max(y).clone()))
    }

    // ==================== Contexts ====================

    fn op_ctx(
        &mut self,
        instr: &'static str,
        ctx: &ExecContext<'_>,
        src: u8,
        dst: u8,
    ) -> Result<(), VMError> {
        let name = self.regs().get_str(src, instr, 0)?;
        if !ctx.contexts.contains(name) {
            return Err(VMError::UnknownContext(name.to_string()));
        }
        let handle = ContextRef::handle(name);
        self.set(dst, handle)
    }

    fn op_switch(
        &mut self,
        instr: &'static str,
        ctx: &ExecContext<'_>,
        src: u8,
    ) -> Result<(), VMError> {
        let name = match self.regs().get(src, instr)? {
            VMObject::String(name) => name.clone(),
            VMObject::Interop(handle) => match handle.downcast_ref::<ContextRef>() {
                Some(context) => context.name.clone(),
                None => {
                    return Err(VMError::TypeMismatch {
                        instruction: instr,
                        arg_index: 0,
                        expected: "Context",
                        actual: handle.type_name(),
                    });
                }
            },
            other => {
                return Err(VMError::TypeMismatch {
                    instruction: instr,
                    arg_index: 0,
                    expected: "Context",
                    actual: other.type_name(),
                });
            }
        };
        let context = ctx
            .contexts
            .get(&name)
            .ok_or_else(|| VMError::UnknownContext(name.clone()))?;

        match context {
            Context::Native(native) => {
                if self.params.read_only && native.effect() == Effect::Mutating {
                    return Ok(());
                }
                native.execute(&mut self.host_frame())
            }
            Context::Script(script) => self.enter_script(name, script),
        }
    }

    /// Suspends the current context and starts `script` with fresh registers.
    fn enter_script(&mut self, name: String, script: &Script) -> Result<(), VMError> {
        let limits = &self.params.limits;
        if self.suspended.len() + 1 >= limits.max_context_depth {
            return Err(VMError::ContextDepthExceeded(limits.max_context_depth));
        }
        if script.len() > limits.max_script_size {
            return Err(VMError::ScriptTooLarge {
                size: script.len(),
                limit: limits.max_script_size,
            });
        }
        let registers = limits.register_count();
        self.charge(self.params.schedule.context_switch, GasCategory::CallOverhead)?;

        let code = script.shared_code();
        let starts = instruction_starts(&code)?;
        self.push_frame(CallFrame::root())?;
        let entered = ContextFrame::new(name, code, starts.into(), registers);
        let caller = std::mem::replace(&mut self.current, entered);
        self.suspended.push(caller);
        Ok(())
    }

    // ==================== Aggregates and data ====================

    fn op_put(&mut self, instr: &'static str, src: u8, dst: u8, key: u8) -> Result<(), VMError> {
        let regs = self.regs();
        let key = regs.get(key, instr)?.clone();
        if !key.is_primitive() {
            return Err(VMError::InvalidKey(key.type_name()));
        }
        let value = regs.get(src, instr)?.clone();

        let target = match regs.get_opt(dst)? {
            None => None,
            Some(VMObject::Struct(r) | VMObject::Object(r)) => Some(*r),
            Some(other) => {
                return Err(VMError::TypeMismatch {
                    instruction: instr,
                    arg_index: 1,
                    expected: "Struct",
                    actual: other.type_name(),
                });
            }
        };
        self.charge(self.params.schedule.entries_cost(1), GasCategory::HeapAllocation)?;
        let target = match target {
            Some(r) => r,
            None => {
                let r = self.heap.alloc(Aggregate::default())?;
                self.set(dst, VMObject::Struct(r))?;
                r
            }
        };
        self.heap.get_mut(target)?.insert(key, value);
        Ok(())
    }

    fn op_get(&mut self, instr: &'static str, src: u8, dst: u8, key: u8) -> Result<(), VMError> {
        let regs = self.regs();
        let key = regs.get(key, instr)?;
        let source = match regs.get(src, instr)? {
            VMObject::Struct(r) | VMObject::Object(r) => *r,
            other => {
                return Err(VMError::TypeMismatch {
                    instruction: instr,
                    arg_index: 0,
                    expected: "Struct",
                    actual: other.type_name(),
                });
            }
        };
        let value = self
            .heap
            .get(source)?
            .get(key)
            .cloned()
            .ok_or_else(|| VMError::KeyNotFound(key.to_string()))?;
        self.set(dst, value)
    }

    /// Bytes of a `cat` operand and whether it was a bytes value; unset is empty.
    fn cat_operand(&self, instr: &'static str, reg: u8, arg: usize) -> Result<(&[u8], bool), VMError> {
        match self.regs().get_opt(reg)? {
            None => Ok((&[] as &[u8], false)),
            Some(VMObject::String(s)) => Ok((s.as_bytes(), false)),
            Some(VMObject::Bytes(b)) => Ok((b.as_slice(), true)),
            Some(other) => Err(VMError::TypeMismatch {
                instruction: instr,
                arg_index: arg,
                expected: "String",
                actual: other.type_name(),
            }),
        }
    }

    fn op_cat(&mut self, instr: &'static str, a: u8, b: u8, dst: u8) -> Result<(), VMError> {
        let (left, left_bytes) = self.cat_operand(instr, a, 0)?;
        let (right, right_bytes) = self.cat_operand(instr, b, 1)?;
        let mut joined = Vec::with_capacity(left.len() + right.len());
        joined.extend_from_slice(left);
        joined.extend_from_slice(right);

        self.charge(self.params.schedule.bytes_cost(joined.len()), GasCategory::Memory)?;
        let result = if left_bytes || right_bytes {
            VMObject::Bytes(joined)
        } else {
            // Both halves were strings, so the concatenation is valid UTF-8.
            VMObject::String(String::from_utf8(joined).map_err(|_| VMError::InvalidUtf8)?)
        };
        self.set(dst, result)
    }

    /// Slices `len` bytes from the front or back of a string or bytes value.
    fn slice(
        &mut self,
        instr: &'static str,
        src: u8,
        dst: u8,
        len: usize,
        from_end: bool,
    ) -> Result<(), VMError> {
        let result = match self.regs().get(src, instr)? {
            VMObject::String(s) => {
                let at = Self::cut_point(s.len(), len, from_end)?;
                if !s.is_char_boundary(at) {
                    return Err(VMError::InvalidUtf8);
                }
                let part = if from_end { &s[at..] } else { &s[..at] };
                VMObject::String(part.to_string())
            }
            VMObject::Bytes(b) => {
                let at = Self::cut_point(b.len(), len, from_end)?;
                let part = if from_end { &b[at..] } else { &b[..at] };
                VMObject::Bytes(part.to_vec())
            }
            other => {
                return Err(VMError::TypeMismatch {
                    instruction: instr,
                    arg_index: 0,
                    expected: "String",
                    actual: other.type_name(),
                });
            }
        };
        self.charge(self.params.schedule.bytes_cost(len), GasCategory::Memory)?;
        self.set(dst, result)
    }

    fn cut_point(size: usize, len: usize, from_end: bool) -> Result<usize, VMError> {
        if len > size {
            return Err(VMError::SliceOutOfRange {
                requested: len,
                len: size,
            });
        }
        Ok(if from_end { size - len } else { len })
    }

    fn op_left(&mut self, instr: &'static str, src: u8, dst: u8, len: usize) -> Result<(), VMError> {
        self.slice(instr, src, dst, len, false)
    }

    fn op_right(&mut self, instr: &'static str, src: u8, dst: u8, len: usize) -> Result<(), VMError> {
        self.slice(instr, src, dst, len, true)
    }

    fn op_size(&mut self, instr: &'static str, src: u8, dst: u8) -> Result<(), VMError> {
        let len = self.regs().get_bytes(src, instr, 0)?.len();
        self.set(dst, VMObject::Integer(BigInt::from(len)))
    }
}
