//! The Scheme stack of the Skein Virtual Machine.
//!
//! A single contiguous array of values carries operands, activation
//! records, and handler records. The stack grows downward: `sp` is the
//! index of the current top and decreases on push, exactly mirroring the
//! pointer arithmetic of the activation-record protocol.
//!
//! Record layouts (slot offsets from the record base):
//!
//! - activation record (7 slots): variadic placeholder, saved env,
//!   saved pc, saved constants, saved fp, saved callee, call-site info;
//! - VM-state record (5 slots): saved pc, constants, env, fp, escape
//!   anchor;
//! - handler record (3 slots): handler procedure, resume point,
//!   previous handler.

use crate::code::CodePtr;
use crate::error::{VmError, VmResult};
use crate::value::Value;

/// Size of an activation record in stack slots.
pub const ACT_RECORD_SIZE: usize = 7;
/// Placeholder slot for folded variadic arguments.
pub const ACT_VARARG: usize = 0;
/// Saved environment register.
pub const ACT_SAVE_ENV: usize = 1;
/// Saved program counter.
pub const ACT_SAVE_PC: usize = 2;
/// Saved constant-pool register.
pub const ACT_SAVE_CST: usize = 3;
/// Saved frame pointer.
pub const ACT_SAVE_FP: usize = 4;
/// Saved callee, for backtraces.
pub const ACT_SAVE_PROC: usize = 5;
/// Call-site debugging information.
pub const ACT_SAVE_INFO: usize = 6;

/// Size of a VM-state record in stack slots.
pub const VM_STATE_SIZE: usize = 5;
/// Saved program counter.
pub const VM_STATE_PC: usize = 0;
/// Saved constant-pool register.
pub const VM_STATE_CST: usize = 1;
/// Saved environment register.
pub const VM_STATE_ENV: usize = 2;
/// Saved frame pointer.
pub const VM_STATE_FP: usize = 3;
/// Saved escape anchor.
pub const VM_STATE_ANCHOR: usize = 4;

/// Size of a handler record in stack slots.
pub const HANDLER_SIZE: usize = 3;
/// The handler procedure.
pub const HANDLER_PROC: usize = 0;
/// Resume point used after the handler returns.
pub const HANDLER_END: usize = 1;
/// Previous handler record, or the no-handler sentinel.
pub const HANDLER_PREV: usize = 2;

/// Encodes a stack index as a record slot value.
pub fn encode_index(index: usize) -> Value {
    Value::Fixnum(index as i64)
}

/// Decodes a stack index from a record slot value.
pub fn decode_index(value: &Value) -> VmResult<usize> {
    match value {
        Value::Fixnum(n) if *n >= 0 => Ok(*n as usize),
        other => Err(VmError::corrupted_stack(format!(
            "expected stack index, found {other}"
        ))),
    }
}

/// Encodes an optional stack index; `None` becomes -1.
pub fn encode_opt_index(index: Option<usize>) -> Value {
    match index {
        Some(i) => Value::Fixnum(i as i64),
        None => Value::Fixnum(-1),
    }
}

/// Decodes an optional stack index.
pub fn decode_opt_index(value: &Value) -> VmResult<Option<usize>> {
    match value {
        Value::Fixnum(-1) => Ok(None),
        Value::Fixnum(n) if *n >= 0 => Ok(Some(*n as usize)),
        other => Err(VmError::corrupted_stack(format!(
            "expected optional stack index, found {other}"
        ))),
    }
}

/// Decodes a saved code position from a record slot value.
pub fn decode_code_ptr(value: &Value) -> VmResult<CodePtr> {
    match value {
        Value::CodePointer(ptr) => Ok(ptr.clone()),
        other => Err(VmError::corrupted_stack(format!(
            "expected saved code position, found {other}"
        ))),
    }
}

/// The contiguous, downward-growing value stack.
pub struct ValueStack {
    cells: Vec<Value>,
    sp: usize,
}

impl ValueStack {
    /// Allocates a stack of `len` slots with `sp` at the initial top.
    pub fn new(len: usize) -> Self {
        Self {
            cells: vec![Value::Void; len],
            sp: len,
        }
    }

    /// Total slot count; also the initial-top sentinel value of `sp`.
    pub fn total_len(&self) -> usize {
        self.cells.len()
    }

    /// Current stack-pointer index.
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Moves `sp` directly. Raising `sp` discards slots; lowering it
    /// re-exposes previously written cells, which is how continuation
    /// restoration and record teardown work.
    pub fn set_sp(&mut self, sp: usize) -> VmResult<()> {
        if sp > self.cells.len() {
            return Err(VmError::corrupted_stack(format!(
                "stack pointer {sp} beyond stack top"
            )));
        }
        self.sp = sp;
        Ok(())
    }

    /// Pushes one value.
    pub fn push(&mut self, value: Value) -> VmResult<()> {
        if self.sp == 0 {
            return Err(VmError::StackOverflow);
        }
        self.sp -= 1;
        self.cells[self.sp] = value;
        Ok(())
    }

    /// Pops one value.
    pub fn pop(&mut self) -> VmResult<Value> {
        if self.sp >= self.cells.len() {
            return Err(VmError::StackUnderflow);
        }
        let value = self.cells[self.sp].clone();
        self.sp += 1;
        Ok(value)
    }

    /// Reserves `count` slots, initialized to void, for a record.
    pub fn reserve(&mut self, count: usize) -> VmResult<()> {
        if self.sp < count {
            return Err(VmError::StackOverflow);
        }
        self.sp -= count;
        for slot in &mut self.cells[self.sp..self.sp + count] {
            *slot = Value::Void;
        }
        Ok(())
    }

    /// Reads the slot at `index`.
    pub fn get(&self, index: usize) -> VmResult<&Value> {
        self.cells
            .get(index)
            .ok_or_else(|| VmError::corrupted_stack(format!("slot {index} beyond stack top")))
    }

    /// Writes the slot at `index`.
    pub fn set(&mut self, index: usize, value: Value) -> VmResult<()> {
        match self.cells.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::corrupted_stack(format!(
                "slot {index} beyond stack top"
            ))),
        }
    }

    /// Clones the live region from `from` up to the stack top.
    pub fn image_from(&self, from: usize) -> Vec<Value> {
        self.cells[from..].to_vec()
    }

    /// Writes an image captured by [`ValueStack::image_from`] back to
    /// its original position.
    pub fn restore_image(&mut self, from: usize, image: &[Value]) {
        self.cells[from..from + image.len()].clone_from_slice(image);
    }
}
