//! First-class continuations for the Skein Virtual Machine.
//!
//! A continuation owns a copy of the live Scheme-stack region together
//! with a full register snapshot. Capture is taken as if the capturing
//! primitive had already returned, so restoration needs nothing but a
//! dispatch loop: the image is copied back to its original addresses,
//! the registers are installed, and a nonlocal transfer unwinds native
//! re-entries until the nearest live incarnation at or below the
//! captured depth resumes dispatching. A continuation may be invoked any
//! number of times; `fresh` flips to false on the first restoration.

use std::cell::Cell;
use std::rc::Rc;

use crate::code::CodePtr;
use crate::engine::Engine;
use crate::error::{VmError, VmResult};
use crate::stack::{decode_index, ACT_RECORD_SIZE, ACT_SAVE_FP};
use crate::value::Value;

/// A reified suspension of the VM.
pub struct Continuation {
    /// Copy of the Scheme stack from `sp` to the stack top.
    pub(crate) stack_image: Vec<Value>,
    /// Stack-pointer index at capture.
    pub(crate) sp: usize,
    /// Frame-pointer index at capture.
    pub(crate) fp: usize,
    /// Resume position.
    pub(crate) pc: CodePtr,
    /// Environment register at capture.
    pub(crate) env: Value,
    /// Constant-pool register at capture.
    pub(crate) constants: Value,
    /// Handler chain head at capture.
    pub(crate) handlers: Option<usize>,
    /// Escape anchor at capture.
    pub(crate) top_anchor: usize,
    /// Re-entry depth of the capturing incarnation.
    pub(crate) depth: usize,
    /// True until the first restoration.
    pub(crate) fresh: Cell<bool>,
}

impl Continuation {
    /// Returns true when the continuation has never been restored.
    pub fn is_fresh(&self) -> bool {
        self.fresh.get()
    }

    /// Number of stack slots held in the captured image.
    pub fn stack_image_len(&self) -> usize {
        self.stack_image.len()
    }
}

impl Engine {
    /// Captures the current suspension as a continuation value.
    ///
    /// The snapshot describes the machine as it will be once the
    /// capturing primitive call returns: the activation record of that
    /// call is already torn down in the captured registers.
    pub(crate) fn capture_continuation(&mut self) -> VmResult<Value> {
        let ret_sp = self.fp + ACT_RECORD_SIZE;
        let ret_fp = decode_index(self.stack.get(self.fp + ACT_SAVE_FP)?)?;

        Ok(Value::Continuation(Rc::new(Continuation {
            stack_image: self.stack.image_from(ret_sp),
            sp: ret_sp,
            fp: ret_fp,
            pc: CodePtr::new(self.code.clone(), self.pc),
            env: self.env.clone(),
            constants: self.constants.clone(),
            handlers: self.handlers,
            top_anchor: self.top_anchor,
            depth: self.depth,
            fresh: Cell::new(true),
        })))
    }

    /// Begins restoring `cont`, delivering `value` at the resume point.
    ///
    /// The returned error is the control value that unwinds native
    /// re-entries; a dispatch loop at a suitable depth intercepts it and
    /// completes the transfer with [`Engine::install_continuation`].
    pub(crate) fn restore_continuation(&mut self, cont: &Value, value: Value) -> VmError {
        match cont {
            Value::Continuation(k) => {
                self.pending_restore = Some((k.clone(), value));
                VmError::ContinuationUnwind
            }
            other => VmError::BadContinuation {
                value: other.to_string(),
            },
        }
    }

    /// Installs a captured snapshot, completing a nonlocal transfer.
    pub(crate) fn install_continuation(&mut self, k: &Rc<Continuation>, value: Value) -> VmResult<()> {
        self.stack.restore_image(k.sp, &k.stack_image);
        self.stack.set_sp(k.sp)?;
        self.fp = k.fp;
        self.code = k.pc.chunk.clone();
        self.pc = k.pc.pos;
        self.env = k.env.clone();
        self.constants = k.constants.clone();
        self.handlers = k.handlers;
        self.top_anchor = k.top_anchor;
        k.fresh.set(false);
        self.val = value;
        self.valc = 1;
        Ok(())
    }
}
