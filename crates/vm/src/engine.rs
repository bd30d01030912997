//! Execution engine of the Skein Virtual Machine.
//!
//! The engine owns the register file, the Scheme stack, the
//! resolved-reference table built by global patching, and the dispatch
//! loop over the 16-bit instruction stream. Re-entrant native calls into
//! Scheme (`apply`) nest dispatch-loop incarnations; nonlocal transfers
//! from the handler protocol and from continuation restoration unwind
//! those incarnations through dedicated control values.

use std::rc::Rc;

use hashbrown::HashMap;
use log::{debug, error, trace};

use crate::code::{opcode_name, CodeChunk, CodePtr};
use crate::error::{VmError, VmResult};
use crate::frame::Frame;
use crate::module::{Binding, Module};
use crate::op_code::{first_byte, second_byte, OpCode};
use crate::stack::{
    decode_code_ptr, decode_index, decode_opt_index, encode_index, encode_opt_index, ValueStack,
    ACT_RECORD_SIZE, ACT_SAVE_CST, ACT_SAVE_ENV, ACT_SAVE_FP, ACT_SAVE_INFO, ACT_SAVE_PC,
    ACT_SAVE_PROC, HANDLER_END, HANDLER_PREV, HANDLER_PROC, HANDLER_SIZE, VM_STATE_ANCHOR,
    VM_STATE_CST, VM_STATE_ENV, VM_STATE_FP, VM_STATE_PC, VM_STATE_SIZE,
};
use crate::symbol::Symbol;
use crate::value::{Condition, Value};
use crate::{number, primitives, value};

/// Number of multiple-value registers. Arities beyond this are packed
/// into a vector held in the first register.
pub const MAX_VALS: usize = 8;

/// Restrictions on the engine.
#[derive(Debug, Clone)]
pub struct EngineLimits {
    /// Scheme stack length, in value slots.
    pub stack_len: usize,
    /// Maximum nesting of dispatch-loop incarnations.
    pub max_reentry_depth: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            stack_len: 100_000,
            max_reentry_depth: 10_000,
        }
    }
}

/// Resolves the applicable methods of a pure generic function.
///
/// The engine consults this callback and nothing else: ordering and
/// specificity are entirely the resolver's business. The returned
/// procedures are tried most specific first.
pub trait MethodResolver {
    /// Returns the method procedures applicable to `(gf, args)`.
    fn applicable_methods(&self, gf: &Value, args: &[Value]) -> Vec<Value>;
}

/// Outcome of one dispatched instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Continue with the next instruction.
    Next,
    /// Leave the current dispatch-loop incarnation.
    Finished,
}

/// The Skein virtual machine.
pub struct Engine {
    limits: EngineLimits,

    /// The Scheme stack.
    pub(crate) stack: ValueStack,
    /// Frame pointer: index of the current activation record, or the
    /// initial-top sentinel (the stack length).
    pub(crate) fp: usize,
    /// Accumulator and return-value register.
    pub(crate) val: Value,
    /// Current lexical environment: a frame or a module.
    pub(crate) env: Value,
    /// Current code chunk.
    pub(crate) code: Rc<CodeChunk>,
    /// Instruction cursor into the current chunk.
    pub(crate) pc: usize,
    /// Constant pool of the current chunk.
    pub(crate) constants: Value,
    /// Topmost handler record, as a stack index.
    pub(crate) handlers: Option<usize>,
    /// Re-entry depth owning the topmost escape anchor.
    pub(crate) top_anchor: usize,
    /// Current dispatch-loop nesting depth.
    pub(crate) depth: usize,
    /// Scratch registers for cross-call handoff.
    pub(crate) r1: Value,
    pub(crate) r2: Value,
    /// Multiple-value registers and their count.
    pub(crate) vals: [Value; MAX_VALS],
    pub(crate) valc: usize,

    /// The current module.
    pub(crate) current_module: Value,
    core_module: Rc<Module>,
    /// Resolved-reference table filled by global patching.
    pub(crate) checked_globals: Vec<Binding>,
    /// Named primitives, for inlined-opcode backtrace identities.
    pub(crate) prims: HashMap<&'static str, Value>,
    /// Generic-function dispatch callback.
    pub(crate) resolver: Option<Rc<dyn MethodResolver>>,
    /// In-flight continuation restoration.
    pub(crate) pending_restore: Option<(Rc<crate::continuation::Continuation>, Value)>,
    booted: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineLimits::default())
    }
}

impl Engine {
    /// Creates an engine with the given limits and the core module
    /// populated with the built-in primitives.
    pub fn new(limits: EngineLimits) -> Self {
        let core = Module::new("skein/core");
        let stack_len = limits.stack_len;
        let mut engine = Self {
            limits,
            stack: ValueStack::new(stack_len),
            fp: stack_len,
            val: Value::Void,
            env: Value::Module(core.clone()),
            code: CodeChunk::new(Vec::new()),
            pc: 0,
            constants: Value::vector(Vec::new()),
            handlers: None,
            top_anchor: 0,
            depth: 0,
            r1: Value::Void,
            r2: Value::Void,
            vals: std::array::from_fn(|_| Value::Void),
            valc: 0,
            current_module: Value::Module(core.clone()),
            core_module: core,
            checked_globals: Vec::new(),
            prims: HashMap::new(),
            resolver: None,
            pending_restore: None,
            booted: false,
        };
        primitives::install(&mut engine);
        engine
    }

    /// Returns the engine limits.
    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    /// Returns the value register.
    pub fn val(&self) -> &Value {
        &self.val
    }

    /// Returns the current module.
    pub fn current_module(&self) -> &Value {
        &self.current_module
    }

    /// Returns the core module, where the primitives are bound.
    pub fn core_module(&self) -> &Rc<Module> {
        &self.core_module
    }

    /// Installs the generic-function dispatch callback.
    pub fn set_method_resolver(&mut self, resolver: Rc<dyn MethodResolver>) {
        self.resolver = Some(resolver);
    }

    /// True once a boot image has been loaded.
    pub fn is_booted(&self) -> bool {
        self.booted
    }

    pub(crate) fn set_booted(&mut self) {
        self.booted = true;
    }

    /// Discards all execution state, keeping modules and globals. After
    /// an error has propagated out of [`Engine::execute`] the machine
    /// registers are unspecified; this brings them back to the initial
    /// top.
    pub fn reset(&mut self) {
        let len = self.stack.total_len();
        self.stack = ValueStack::new(len);
        self.fp = len;
        self.val = Value::Void;
        self.env = self.current_module.clone();
        self.code = CodeChunk::new(Vec::new());
        self.pc = 0;
        self.handlers = None;
        self.top_anchor = 0;
        self.depth = 0;
        self.valc = 0;
        self.pending_restore = None;
    }

    // === Entry points ===================================================

    /// Runs a code chunk against a constant pool and an environment,
    /// returning the value register. This is the `%execute` entry point;
    /// `env` defaults to the current module.
    pub fn execute(
        &mut self,
        code: Rc<CodeChunk>,
        constants: Value,
        env: Option<Value>,
    ) -> VmResult<Value> {
        let envt = match env {
            Some(v @ Value::Module(_)) => v,
            None => self.current_module.clone(),
            Some(other) => {
                return Err(VmError::bad_operand("%execute", other.to_string()));
            }
        };
        self.save_vm_state()?;
        self.run(code, 0, constants, envt)?;
        self.full_restore_vm_state()?;
        Ok(self.val.clone())
    }

    /// Calls a Scheme procedure from native code with the given
    /// arguments, returning its value. Re-enters the dispatch loop.
    pub fn apply(&mut self, func: &Value, args: &[Value]) -> VmResult<Value> {
        self.save_vm_state()?;
        self.prep_call()?;
        for arg in args {
            self.stack.push(arg.clone())?;
        }
        self.val = func.clone();
        let code = CodeChunk::new(vec![
            OpCode::INVOKE as u16,
            args.len() as u16,
            OpCode::END_OF_CODE as u16,
        ]);
        let constants = self.constants.clone();
        let env = self.env.clone();
        self.run(code, 0, constants, env)?;
        self.full_restore_vm_state()?;
        Ok(self.val.clone())
    }

    /// Returns the current backtrace: a list of `(callee . info)` pairs
    /// walking the saved frame-pointer chain, innermost first.
    pub fn backtrace(&self) -> VmResult<Value> {
        let top = self.stack.total_len();
        let mut frames = Vec::new();
        let mut fp = self.fp;
        while fp + ACT_RECORD_SIZE <= top {
            let proc = self.stack.get(fp + ACT_SAVE_PROC)?.clone();
            if proc.is_false() {
                break;
            }
            let info = self.stack.get(fp + ACT_SAVE_INFO)?.clone();
            frames.push(Value::cons(proc, info));
            fp = decode_index(self.stack.get(fp + ACT_SAVE_FP)?)?;
        }
        Ok(Value::list(&frames))
    }

    // === The dispatch loop ==============================================

    pub(crate) fn run(
        &mut self,
        chunk: Rc<CodeChunk>,
        entry: usize,
        constants: Value,
        env: Value,
    ) -> VmResult<()> {
        if self.depth >= self.limits.max_reentry_depth {
            return Err(VmError::StackOverflow);
        }
        self.code = chunk;
        self.pc = entry;
        self.constants = constants;
        self.env = env;
        self.depth += 1;
        let result = self.run_loop();
        self.depth -= 1;
        result
    }

    fn run_loop(&mut self) -> VmResult<()> {
        let depth = self.depth;
        let mut old_anchor = self.top_anchor;
        loop {
            match self.step(&mut old_anchor) {
                Ok(Flow::Next) => {}
                Ok(Flow::Finished) => return Ok(()),
                Err(err) => self.divert(err, depth)?,
            }
        }
    }

    /// Routes an error raised during dispatch: intercepts the nonlocal
    /// transfers addressed to this incarnation, converts everything else
    /// into a condition for the handler protocol, and propagates what
    /// remains to the enclosing incarnation.
    fn divert(&mut self, err: VmError, depth: usize) -> VmResult<()> {
        match err {
            VmError::HandlerUnwind { depth: to } if to == depth => Ok(()),
            VmError::ContinuationUnwind => match self.pending_restore.take() {
                Some((k, value)) if depth <= k.depth => self.install_continuation(&k, value),
                Some(pending) => {
                    self.pending_restore = Some(pending);
                    Err(VmError::ContinuationUnwind)
                }
                None => Err(VmError::corrupted_stack(
                    "continuation transfer without a pending restoration",
                )),
            },
            err if err.is_control() => Err(err),
            err => {
                if self.handlers.is_some() {
                    let cond = condition_from_error(&err);
                    let control = self.raise_value(cond)?;
                    self.divert(control, depth)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// The raising entry point of the handler protocol.
    ///
    /// Pops the topmost handler record and its saved VM state, invokes
    /// the handler procedure with `cond` re-entrantly, and returns the
    /// control value that transfers execution to the resume point in the
    /// incarnation that installed the handler. With no handler installed
    /// the condition is printed and an uncaught-condition control value
    /// is returned instead.
    pub fn raise_value(&mut self, cond: Value) -> VmResult<VmError> {
        let Some(handler) = self.handlers else {
            let message = condition_message(&cond);
            error!("no handler present for condition: {message}");
            eprintln!("{cond}: {message}\n**** FATAL ERROR: no handler present!");
            return Ok(VmError::UncaughtCondition { message });
        };

        let proc = self.stack.get(handler + HANDLER_PROC)?.clone();
        let resume = decode_code_ptr(self.stack.get(handler + HANDLER_END)?)?;

        // Pop the handler record, then the VM state saved right above it.
        self.handlers = decode_opt_index(self.stack.get(handler + HANDLER_PREV)?)?;
        let state = handler + HANDLER_SIZE;
        self.restore_vm_state(state)?;
        self.code = resume.chunk;
        self.pc = resume.pos;

        // Run the handler on behalf of the previous handler, since the
        // handler itself may raise.
        self.val = self.apply(&proc, &[cond])?;

        Ok(VmError::HandlerUnwind {
            depth: self.top_anchor,
        })
    }

    fn step(&mut self, old_anchor: &mut usize) -> VmResult<Flow> {
        let ip = self.pc;
        let word = self.fetch_word()?;
        let op = OpCode::try_from(word)?;
        trace!(
            "{ip:6} {:16} sp={} fp={}",
            opcode_name(word),
            self.stack.sp(),
            self.fp
        );

        match op {
            OpCode::NOP => {}

            OpCode::IM_FALSE => self.load(Value::False),
            OpCode::IM_TRUE => self.load(Value::True),
            OpCode::IM_NIL => self.load(Value::Nil),
            OpCode::IM_MINUS1 => self.load(Value::Fixnum(-1)),
            OpCode::IM_ZERO => self.load(Value::Fixnum(0)),
            OpCode::IM_ONE => self.load(Value::Fixnum(1)),
            OpCode::IM_VOID => self.load(Value::Void),
            OpCode::SMALL_INT => {
                let n = self.fetch_word()? as i16;
                self.load(Value::Fixnum(n as i64));
            }
            OpCode::CONSTANT => {
                let v = self.fetch_const()?;
                self.load(v);
            }

            OpCode::FALSE_PUSH => self.load_push(Value::False)?,
            OpCode::TRUE_PUSH => self.load_push(Value::True)?,
            OpCode::NIL_PUSH => self.load_push(Value::Nil)?,
            OpCode::MINUS1_PUSH => self.load_push(Value::Fixnum(-1))?,
            OpCode::ZERO_PUSH => self.load_push(Value::Fixnum(0))?,
            OpCode::ONE_PUSH => self.load_push(Value::Fixnum(1))?,
            OpCode::VOID_PUSH => self.load_push(Value::Void)?,
            OpCode::INT_PUSH => {
                let n = self.fetch_word()? as i16;
                self.load_push(Value::Fixnum(n as i64))?;
            }
            OpCode::CONSTANT_PUSH => {
                let v = self.fetch_const()?;
                self.load_push(v)?;
            }

            OpCode::GLOBAL_REF => {
                let sym = self.fetch_const_symbol()?;
                let cell = self.lookup_binding(&sym)?;
                self.val = cell.borrow().clone();
                self.patch_global(ip, OpCode::UGLOBAL_REF, cell);
                self.valc = 1;
            }
            OpCode::UGLOBAL_REF => {
                let idx = self.fetch_word()? as usize;
                self.val = self.fetch_global(idx)?;
                self.valc = 1;
            }
            OpCode::GREF_INVOKE => {
                let sym = self.fetch_const_symbol()?;
                let cell = self.lookup_binding(&sym)?;
                self.val = cell.borrow().clone();
                let nargs = self.fetch_word()? as usize;
                self.patch_global(ip, OpCode::UGREF_INVOKE, cell);
                return self.funcall(nargs, false);
            }
            OpCode::UGREF_INVOKE => {
                let idx = self.fetch_word()? as usize;
                self.val = self.fetch_global(idx)?;
                let nargs = self.fetch_word()? as usize;
                return self.funcall(nargs, false);
            }
            OpCode::GLOBAL_SET => {
                let sym = self.fetch_const_symbol()?;
                let cell = self.lookup_binding(&sym)?;
                *cell.borrow_mut() = self.val.clone();
                self.val = Value::Void;
                self.patch_global(ip, OpCode::UGLOBAL_SET, cell);
                self.valc = 0;
            }
            OpCode::UGLOBAL_SET => {
                let idx = self.fetch_word()? as usize;
                let cell = self
                    .checked_globals
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| VmError::corrupted_stack("unresolved global slot"))?;
                *cell.borrow_mut() = self.val.clone();
                self.val = Value::Void;
                self.valc = 0;
            }

            OpCode::LOCAL_REF0 => self.local_ref(0)?,
            OpCode::LOCAL_REF1 => self.local_ref(1)?,
            OpCode::LOCAL_REF2 => self.local_ref(2)?,
            OpCode::LOCAL_REF3 => self.local_ref(3)?,
            OpCode::LOCAL_REF4 => self.local_ref(4)?,
            OpCode::LOCAL_REF => {
                let n = self.fetch_word()? as usize;
                self.local_ref(n)?;
            }
            OpCode::DEEP_LOCAL_REF => {
                let info = self.fetch_word()?;
                let frame = self.frame_at_depth(first_byte(info) as usize)?;
                self.val = frame.local_ref(second_byte(info) as usize)?;
                self.valc = 1;
            }
            OpCode::LOCAL_SET0 => self.local_set(0)?,
            OpCode::LOCAL_SET1 => self.local_set(1)?,
            OpCode::LOCAL_SET2 => self.local_set(2)?,
            OpCode::LOCAL_SET3 => self.local_set(3)?,
            OpCode::LOCAL_SET4 => self.local_set(4)?,
            OpCode::LOCAL_SET => {
                let n = self.fetch_word()? as usize;
                self.local_set(n)?;
            }
            OpCode::DEEP_LOCAL_SET => {
                let info = self.fetch_word()?;
                let frame = self.frame_at_depth(first_byte(info) as usize)?;
                frame.local_set(second_byte(info) as usize, self.val.clone())?;
                self.val = Value::Void;
                self.valc = 0;
            }

            OpCode::GOTO => {
                let off = self.fetch_word()? as i16;
                self.pc = self.jump_target(off)?;
            }
            OpCode::JUMP_FALSE => {
                let off = self.fetch_word()? as i16;
                if self.val.is_false() {
                    self.pc = self.jump_target(off)?;
                }
            }
            OpCode::JUMP_TRUE => {
                let off = self.fetch_word()? as i16;
                if !self.val.is_false() {
                    self.pc = self.jump_target(off)?;
                }
            }
            OpCode::JUMP_NUMEQ => self.jump_num(number::numeq2)?,
            OpCode::JUMP_NUMDIFF => {
                let off = self.fetch_word()? as i16;
                let left = self.stack.pop()?;
                if !number::numeq2(&left, &self.val)? {
                    self.pc = self.jump_target(off)?;
                }
            }
            OpCode::JUMP_NUMLT => self.jump_num(number::numlt2)?,
            OpCode::JUMP_NUMLE => self.jump_num(number::numle2)?,
            OpCode::JUMP_NUMGT => self.jump_num(number::numgt2)?,
            OpCode::JUMP_NUMGE => self.jump_num(number::numge2)?,
            OpCode::JUMP_NOT_EQ => {
                let off = self.fetch_word()? as i16;
                let left = self.stack.pop()?;
                if !value::eq(&left, &self.val) {
                    self.pc = self.jump_target(off)?;
                }
            }
            OpCode::JUMP_NOT_EQV => {
                let off = self.fetch_word()? as i16;
                let left = self.stack.pop()?;
                if !value::eqv(&left, &self.val) {
                    self.pc = self.jump_target(off)?;
                }
            }
            OpCode::JUMP_NOT_EQUAL => {
                let off = self.fetch_word()? as i16;
                let left = self.stack.pop()?;
                if !value::equal(&left, &self.val) {
                    self.pc = self.jump_target(off)?;
                }
            }

            OpCode::DEFINE_SYMBOL => {
                let sym = self.fetch_const_symbol()?;
                let module = self.env_module()?;
                module.define(sym.clone(), self.val.clone());
                if let Value::Closure(c) = &self.val {
                    if c.name.borrow().is_false() {
                        *c.name.borrow_mut() = Value::Symbol(sym.clone());
                    }
                }
                self.val = Value::Void;
                self.vals[1] = Value::Symbol(sym);
                self.valc = 2;
            }
            OpCode::SET_CUR_MOD => {
                if !matches!(self.val, Value::Module(_)) {
                    return Err(VmError::bad_operand("set-current-module", self.val.to_string()));
                }
                self.current_module = self.val.clone();
                self.env = self.val.clone();
                self.val = Value::Void;
                self.valc = 0;
            }

            OpCode::POP => {
                self.val = self.stack.pop()?;
                self.valc = 1;
            }
            OpCode::PUSH => {
                self.stack.push(self.val.clone())?;
            }

            OpCode::DBG_VM => {
                let kind = self.fetch_word()?;
                self.vm_debug(kind)?;
            }

            OpCode::CREATE_CLOSURE => {
                let off = self.fetch_word()? as usize;
                let arity = self.fetch_word()? as i16;
                if off == 0 || ip + 2 + off > self.code.len() {
                    return Err(VmError::bad_bytecode("closure body outside code"));
                }
                self.val = Value::Closure(Rc::new(crate::value::Closure {
                    code: self.code.clone(),
                    entry: self.pc,
                    len: off - 1,
                    arity,
                    constants: self.constants.clone(),
                    env: std::cell::RefCell::new(self.env.clone()),
                    name: std::cell::RefCell::new(Value::False),
                    next_method: std::cell::RefCell::new(Value::Void),
                }));
                self.pc = ip + 2 + off;
                self.valc = 1;
            }

            OpCode::PREPARE_CALL => self.prep_call()?,
            OpCode::RETURN => self.ret_call()?,
            OpCode::INVOKE => {
                let nargs = self.fetch_word()? as usize;
                return self.funcall(nargs, false);
            }
            OpCode::TAIL_INVOKE => {
                let nargs = self.fetch_word()? as usize;
                return self.funcall(nargs, true);
            }

            OpCode::ENTER_LET => {
                let n = self.fetch_word()? as usize;
                self.enter_let(n)?;
            }
            OpCode::ENTER_LET_STAR => {
                let n = self.fetch_word()? as usize;
                self.prep_call()?;
                let frame = Frame::with_count(self.val.clone(), self.env.clone(), n);
                self.env = Value::Frame(Rc::new(frame));
            }
            OpCode::LEAVE_LET => {
                let fp = self.fp;
                let saved_fp = decode_index(self.stack.get(fp + ACT_SAVE_FP)?)?;
                self.stack.set_sp(fp + ACT_RECORD_SIZE)?;
                self.env = self.current_frame()?.next();
                self.fp = saved_fp;
            }
            OpCode::ENTER_TAIL_LET => {
                let n = self.fetch_word()? as usize;
                let mut slots = vec![Value::Void; n];
                for slot in slots.iter_mut().rev() {
                    *slot = self.stack.pop()?;
                }
                self.enter_tail_frame(slots)?;
            }
            OpCode::ENTER_TAIL_LET_STAR => {
                let n = self.fetch_word()? as usize;
                self.prep_call()?;
                self.enter_tail_frame(vec![Value::Void; n])?;
            }

            OpCode::PUSH_HANDLER => {
                let off = self.fetch_word()? as i16;
                if !self.val.is_procedure() {
                    return Err(VmError::bad_operand("with-handler", self.val.to_string()));
                }
                let resume = CodePtr::new(self.code.clone(), self.jump_target(off)?);
                *old_anchor = self.top_anchor;
                self.top_anchor = self.depth;
                self.save_vm_state()?;
                let prev = self.handlers;
                self.stack.reserve(HANDLER_SIZE)?;
                let base = self.stack.sp();
                self.stack.set(base + HANDLER_PROC, self.val.clone())?;
                self.stack.set(base + HANDLER_END, Value::CodePointer(resume))?;
                self.stack.set(base + HANDLER_PREV, encode_opt_index(prev))?;
                self.handlers = Some(base);
            }
            OpCode::POP_HANDLER => {
                let handler = self.handlers.ok_or_else(|| {
                    VmError::corrupted_stack("handler pop without an installed handler")
                })?;
                self.handlers = decode_opt_index(self.stack.get(handler + HANDLER_PREV)?)?;
                self.restore_vm_state(handler + HANDLER_SIZE)?;
                self.top_anchor = *old_anchor;
            }

            OpCode::MAKE_EXPANDER => {
                let name = self.fetch_const_symbol()?;
                let list_sym = Symbol::intern("*expander-list*");
                let module = self.module_of(&self.current_module)?;
                let cell = module
                    .lookup(&list_sym)
                    .or_else(|| self.core_module.lookup(&list_sym))
                    .ok_or_else(|| VmError::UnboundVariable {
                        name: list_sym.to_string(),
                    })?;
                let old = cell.borrow().clone();
                *cell.borrow_mut() =
                    Value::cons(Value::cons(Value::Symbol(name.clone()), self.val.clone()), old);
                self.val = Value::Void;
                self.vals[1] = Value::Symbol(name);
                self.valc = 2;
            }

            OpCode::END_OF_CODE => return Ok(Flow::Finished),

            OpCode::IN_ADD2 => self.in_add2()?,
            OpCode::IN_SUB2 => self.in_sub2()?,
            OpCode::IN_MUL2 => self.in_mul2()?,
            OpCode::IN_DIV2 => self.in_div2()?,
            OpCode::IN_NUMEQ => self.in_numcmp("=", number::numeq2)?,
            OpCode::IN_NUMDIFF => self.in_numdiff()?,
            OpCode::IN_NUMLT => self.in_numcmp("<", number::numlt2)?,
            OpCode::IN_NUMGT => self.in_numcmp(">", number::numgt2)?,
            OpCode::IN_NUMLE => self.in_numcmp("<=", number::numle2)?,
            OpCode::IN_NUMGE => self.in_numcmp(">=", number::numge2)?,
            OpCode::IN_INCR => self.in_incr()?,
            OpCode::IN_DECR => self.in_decr()?,
            OpCode::IN_CONS => self.in_cons()?,
            OpCode::IN_CAR => self.in_car()?,
            OpCode::IN_CDR => self.in_cdr()?,
            OpCode::IN_NULLP => self.in_nullp(),
            OpCode::IN_LIST => {
                let n = self.fetch_word()? as usize;
                self.val = self.listify_top(n)?;
                self.valc = 1;
            }
            OpCode::IN_NOT => self.in_not(),
            OpCode::IN_EQUAL => self.in_equality(value::equal, false)?,
            OpCode::IN_EQV => self.in_equality(value::eqv, false)?,
            OpCode::IN_EQ => self.in_equality(value::eq, false)?,
            OpCode::IN_NOT_EQUAL => self.in_equality(value::equal, true)?,
            OpCode::IN_NOT_EQV => self.in_equality(value::eqv, true)?,
            OpCode::IN_NOT_EQ => self.in_equality(value::eq, true)?,
            OpCode::IN_VREF => self.in_vref()?,
            OpCode::IN_SREF => self.in_sref()?,
            OpCode::IN_VSET => self.in_vset()?,
            OpCode::IN_SSET => self.in_sset()?,
        }

        Ok(Flow::Next)
    }

    // === Instruction helpers ============================================

    #[inline]
    fn load(&mut self, v: Value) {
        self.val = v;
        self.valc = 1;
    }

    #[inline]
    fn load_push(&mut self, v: Value) -> VmResult<()> {
        self.stack.push(v.clone())?;
        self.val = v;
        self.valc = 1;
        Ok(())
    }

    fn local_ref(&mut self, index: usize) -> VmResult<()> {
        self.val = self.current_frame()?.local_ref(index)?;
        self.valc = 1;
        Ok(())
    }

    fn local_set(&mut self, index: usize) -> VmResult<()> {
        self.current_frame()?.local_set(index, self.val.clone())?;
        self.val = Value::Void;
        self.valc = 0;
        Ok(())
    }

    fn jump_num(&mut self, cmp: fn(&Value, &Value) -> VmResult<bool>) -> VmResult<()> {
        let off = self.fetch_word()? as i16;
        let left = self.stack.pop()?;
        if cmp(&left, &self.val)? {
            self.pc = self.jump_target(off)?;
        }
        Ok(())
    }

    fn enter_let(&mut self, n: usize) -> VmResult<()> {
        let mut slots = vec![Value::Void; n];
        for slot in slots.iter_mut().rev() {
            *slot = self.stack.pop()?;
        }
        let frame = Frame::new(self.val.clone(), self.env.clone(), slots);
        self.env = Value::Frame(Rc::new(frame));
        Ok(())
    }

    /// Shared tail for `ENTER_TAIL_LET` and `ENTER_TAIL_LET_STAR`:
    /// reuses the enclosing activation record.
    fn enter_tail_frame(&mut self, slots: Vec<Value>) -> VmResult<()> {
        let old_fp = decode_index(self.stack.get(self.fp + ACT_SAVE_FP)?)?;
        self.fp = old_fp;
        self.stack.set_sp(self.fp)?;
        let frame = Frame::new(self.val.clone(), self.env.clone(), slots);
        self.env = Value::Frame(Rc::new(frame));
        Ok(())
    }

    fn vm_debug(&mut self, kind: u16) -> VmResult<()> {
        match kind {
            0 => Err(VmError::bad_bytecode(
                "obsolete line information, recompile the file",
            )),
            1 => {
                let line = self.val.clone();
                let file = self.stack.pop()?;
                if self.fp + ACT_RECORD_SIZE <= self.stack.total_len() {
                    self.stack
                        .set(self.fp + ACT_SAVE_INFO, Value::cons(file, line))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // === Fetching =======================================================

    #[inline]
    pub(crate) fn fetch_word(&mut self) -> VmResult<u16> {
        let word = self.code.fetch(self.pc)?;
        self.pc += 1;
        Ok(word)
    }

    fn fetch_const(&mut self) -> VmResult<Value> {
        let index = self.fetch_word()? as usize;
        match &self.constants {
            Value::Vector(items) => items.borrow().get(index).cloned().ok_or_else(|| {
                VmError::bad_bytecode(format!("constant index {index} out of range"))
            }),
            _ => Err(VmError::corrupted_stack("constant pool is not a vector")),
        }
    }

    fn fetch_const_symbol(&mut self) -> VmResult<Symbol> {
        match self.fetch_const()? {
            Value::Symbol(sym) => Ok(sym),
            other => Err(VmError::bad_bytecode(format!(
                "expected a symbol constant, found {other}"
            ))),
        }
    }

    fn fetch_global(&mut self, index: usize) -> VmResult<Value> {
        let cell = self
            .checked_globals
            .get(index)
            .ok_or_else(|| VmError::corrupted_stack("unresolved global slot"))?;
        Ok(cell.borrow().clone())
    }

    fn jump_target(&self, off: i16) -> VmResult<usize> {
        let target = self.pc as i64 + off as i64;
        if target < 0 || target as usize >= self.code.len() {
            return Err(VmError::bad_bytecode(format!(
                "jump target {target} outside code"
            )));
        }
        Ok(target as usize)
    }

    // === Globals ========================================================

    /// Remembers a resolved binding cell and patches the instruction at
    /// `ip` to its unresolved-free variant. Slots beyond the 16-bit
    /// operand range stay on the slow path.
    fn patch_global(&mut self, ip: usize, new_opcode: OpCode, cell: Binding) {
        let index = self.checked_globals.len();
        if index <= u16::MAX as usize {
            self.checked_globals.push(cell);
            self.code.patch_instruction(ip, new_opcode, index as u16);
            debug!("patched {} at {ip} (slot {index})", new_opcode.name());
        }
    }

    pub(crate) fn lookup_binding(&self, sym: &Symbol) -> VmResult<Binding> {
        let module = self.env_module()?;
        module
            .lookup(sym)
            .or_else(|| self.core_module.lookup(sym))
            .ok_or_else(|| VmError::UnboundVariable {
                name: sym.to_string(),
            })
    }

    /// Looks a symbol up in the current module, for the dispatch
    /// protocol entry points obtained by name.
    pub(crate) fn lookup_value(&self, name: &str) -> VmResult<Value> {
        let sym = Symbol::intern(name);
        let module = self.module_of(&self.current_module)?;
        module
            .lookup(&sym)
            .or_else(|| self.core_module.lookup(&sym))
            .map(|cell| cell.borrow().clone())
            .ok_or(VmError::UnboundVariable {
                name: name.to_string(),
            })
    }

    fn module_of(&self, v: &Value) -> VmResult<Rc<Module>> {
        match v {
            Value::Module(m) => Ok(m.clone()),
            other => Err(VmError::corrupted_stack(format!(
                "expected a module, found {other}"
            ))),
        }
    }

    /// Walks the environment chain down to its root module.
    fn env_module(&self) -> VmResult<Rc<Module>> {
        let mut cursor = self.env.clone();
        loop {
            match cursor {
                Value::Module(m) => return Ok(m),
                Value::Frame(f) => cursor = f.next(),
                other => {
                    return Err(VmError::corrupted_stack(format!(
                        "environment chain ends in {other}"
                    )))
                }
            }
        }
    }

    fn current_frame(&self) -> VmResult<Rc<Frame>> {
        match &self.env {
            Value::Frame(f) => Ok(f.clone()),
            other => Err(VmError::corrupted_stack(format!(
                "local access outside a frame ({other})"
            ))),
        }
    }

    fn frame_at_depth(&self, levels: usize) -> VmResult<Rc<Frame>> {
        let mut frame = self.current_frame()?;
        for _ in 0..levels {
            match frame.next() {
                Value::Frame(f) => frame = f,
                other => {
                    return Err(VmError::corrupted_stack(format!(
                        "environment chain too short ({other})"
                    )))
                }
            }
        }
        Ok(frame)
    }

    // === Records ========================================================

    /// Pushes an activation record and points `fp` at it.
    pub(crate) fn prep_call(&mut self) -> VmResult<()> {
        let fp_save = self.fp;
        self.stack.reserve(ACT_RECORD_SIZE)?;
        self.fp = self.stack.sp();
        self.stack.set(self.fp + ACT_SAVE_FP, encode_index(fp_save))?;
        self.stack.set(self.fp + ACT_SAVE_PROC, Value::False)?;
        self.stack.set(self.fp + ACT_SAVE_INFO, Value::False)?;
        Ok(())
    }

    /// Returns from a closure call: restores the caller's registers from
    /// the activation record at `fp`.
    pub(crate) fn ret_call(&mut self) -> VmResult<()> {
        let fp = self.fp;
        let env = self.stack.get(fp + ACT_SAVE_ENV)?.clone();
        let pc = decode_code_ptr(self.stack.get(fp + ACT_SAVE_PC)?)?;
        let constants = self.stack.get(fp + ACT_SAVE_CST)?.clone();
        let saved_fp = decode_index(self.stack.get(fp + ACT_SAVE_FP)?)?;
        self.stack.set_sp(fp + ACT_RECORD_SIZE)?;
        self.env = env;
        self.code = pc.chunk;
        self.pc = pc.pos;
        self.constants = constants;
        self.fp = saved_fp;
        Ok(())
    }

    /// Tears down the activation record after a primitive call.
    pub(crate) fn return_from_primitive(&mut self) -> VmResult<()> {
        let fp = self.fp;
        let saved_fp = decode_index(self.stack.get(fp + ACT_SAVE_FP)?)?;
        self.stack.set_sp(fp + ACT_RECORD_SIZE)?;
        self.fp = saved_fp;
        Ok(())
    }

    /// Pushes a VM-state record for a re-entrant call.
    pub(crate) fn save_vm_state(&mut self) -> VmResult<()> {
        self.stack.reserve(VM_STATE_SIZE)?;
        let base = self.stack.sp();
        self.stack.set(
            base + VM_STATE_PC,
            Value::CodePointer(CodePtr::new(self.code.clone(), self.pc)),
        )?;
        self.stack.set(base + VM_STATE_CST, self.constants.clone())?;
        self.stack.set(base + VM_STATE_ENV, self.env.clone())?;
        self.stack.set(base + VM_STATE_FP, encode_index(self.fp))?;
        self.stack
            .set(base + VM_STATE_ANCHOR, encode_index(self.top_anchor))?;
        Ok(())
    }

    /// Restores everything but the program counter from the VM-state
    /// record at `base`, popping it.
    pub(crate) fn restore_vm_state(&mut self, base: usize) -> VmResult<()> {
        let constants = self.stack.get(base + VM_STATE_CST)?.clone();
        let env = self.stack.get(base + VM_STATE_ENV)?.clone();
        let fp = decode_index(self.stack.get(base + VM_STATE_FP)?)?;
        let anchor = decode_index(self.stack.get(base + VM_STATE_ANCHOR)?)?;
        self.stack.set_sp(base + VM_STATE_SIZE)?;
        self.constants = constants;
        self.env = env;
        self.fp = fp;
        self.top_anchor = anchor;
        Ok(())
    }

    /// Restores the full VM-state record at the current stack pointer,
    /// including the program counter.
    pub(crate) fn full_restore_vm_state(&mut self) -> VmResult<()> {
        let base = self.stack.sp();
        let pc = decode_code_ptr(self.stack.get(base + VM_STATE_PC)?)?;
        self.restore_vm_state(base)?;
        self.code = pc.chunk;
        self.pc = pc.pos;
        Ok(())
    }

    // === Misc ===========================================================

    /// Pops the top `n` slots into a freshly consed list, first pushed
    /// first.
    pub(crate) fn listify_top(&mut self, n: usize) -> VmResult<Value> {
        let sp = self.stack.sp();
        let mut result = Value::Nil;
        for i in 0..n {
            result = Value::cons(self.stack.get(sp + i)?.clone(), result);
        }
        self.stack.set_sp(sp + n)?;
        Ok(result)
    }

    /// Reads argument `i` (zero-based, call order) of `nargs` arguments
    /// sitting on the stack.
    pub(crate) fn arg(&self, nargs: usize, i: usize) -> VmResult<Value> {
        Ok(self.stack.get(self.stack.sp() + nargs - 1 - i)?.clone())
    }

    /// Records a named primitive as the current callee for backtraces,
    /// on behalf of the inlined opcode that shares its semantics.
    pub(crate) fn note_primitive(&mut self, name: &'static str) -> VmResult<()> {
        if self.fp + ACT_RECORD_SIZE <= self.stack.total_len() {
            if let Some(prim) = self.prims.get(name).cloned() {
                self.stack.set(self.fp + ACT_SAVE_PROC, prim)?;
            }
        }
        Ok(())
    }
}

/// Builds the condition delivered to handlers for a VM error.
pub(crate) fn condition_from_error(err: &VmError) -> Value {
    let kind = match err {
        VmError::WrongArity { .. } => "wrong-arity",
        VmError::BadCallable { .. } => "bad-callable",
        VmError::BadOperandType { .. } | VmError::DivisionByZero { .. } => "bad-operand-type",
        VmError::BadContinuation { .. } => "bad-continuation",
        VmError::BadBytecode { .. } => "bad-bytecode",
        VmError::UnboundVariable { .. } => "unbound-variable",
        VmError::StackOverflow | VmError::StackUnderflow => "stack-overflow",
        VmError::ExitRequested { .. } => "exit-request",
        _ => "error",
    };
    Condition::make(kind, err.to_string())
}

/// Returns the printable message of a raised value.
pub(crate) fn condition_message(cond: &Value) -> String {
    match cond {
        Value::Condition(c) => c.message.clone(),
        other => other.to_string(),
    }
}
