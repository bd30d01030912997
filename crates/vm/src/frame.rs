//! Lexical environment frames for the Skein Virtual Machine.
//!
//! A frame owns a fixed collection of binding slots plus a link to its
//! parent environment. Chains terminate at the module that served as the
//! initial environment. Frames are heap-resident and reference-counted,
//! so a chain captured by a closure or a continuation stays valid after
//! the activation that created it has been popped.

use std::cell::RefCell;

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// A lexical environment frame.
pub struct Frame {
    /// The closure or primitive that created the frame.
    owner: RefCell<Value>,
    /// Parent environment: another frame or the root module.
    next: RefCell<Value>,
    /// The binding slots. Their number equals the declared frame length.
    slots: RefCell<Vec<Value>>,
}

impl Frame {
    /// Creates a frame with the given slots.
    pub fn new(owner: Value, next: Value, slots: Vec<Value>) -> Self {
        Self {
            owner: RefCell::new(owner),
            next: RefCell::new(next),
            slots: RefCell::new(slots),
        }
    }

    /// Creates a frame of `count` void slots, for sequential binding.
    pub fn with_count(owner: Value, next: Value, count: usize) -> Self {
        Self::new(owner, next, vec![Value::Void; count])
    }

    /// Returns the declared slot count.
    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Returns true when the frame has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Returns the owner recorded at creation.
    pub fn owner(&self) -> Value {
        self.owner.borrow().clone()
    }

    /// Returns the parent environment.
    pub fn next(&self) -> Value {
        self.next.borrow().clone()
    }

    /// Reads the slot at `index`.
    pub fn local_ref(&self, index: usize) -> VmResult<Value> {
        let slots = self.slots.borrow();
        slots
            .get(index)
            .cloned()
            .ok_or_else(|| Self::index_out_of_range(index, slots.len()))
    }

    /// Writes the slot at `index`.
    pub fn local_set(&self, index: usize, value: Value) -> VmResult<()> {
        let mut slots = self.slots.borrow_mut();
        if index >= slots.len() {
            return Err(Self::index_out_of_range(index, slots.len()));
        }
        slots[index] = value;
        Ok(())
    }

    fn index_out_of_range(index: usize, length: usize) -> VmError {
        VmError::corrupted_stack(format!(
            "frame slot {index} out of range (length {length})"
        ))
    }
}
