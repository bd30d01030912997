//! Inlined primitive opcodes of the Skein Virtual Machine.
//!
//! Each of these bytecodes has the semantics and error behavior of the
//! correspondingly named primitive, with dispatch fused into the
//! interpreter loop. Before doing its work an inlined opcode records the
//! named primitive as the current callee, so a type error surfaces in
//! backtraces exactly as if the slow path had been taken.

use crate::engine::Engine;
use crate::error::{VmError, VmResult};
use crate::number;
use crate::value::Value;

impl Engine {
    pub(crate) fn in_add2(&mut self) -> VmResult<()> {
        self.note_primitive("+")?;
        let left = self.stack.pop()?;
        self.val = number::add2(&left, &self.val)?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_sub2(&mut self) -> VmResult<()> {
        self.note_primitive("-")?;
        let left = self.stack.pop()?;
        self.val = number::sub2(&left, &self.val)?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_mul2(&mut self) -> VmResult<()> {
        self.note_primitive("*")?;
        let left = self.stack.pop()?;
        self.val = number::mul2(&left, &self.val)?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_div2(&mut self) -> VmResult<()> {
        self.note_primitive("/")?;
        let left = self.stack.pop()?;
        self.val = number::div2(&left, &self.val)?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_numcmp(
        &mut self,
        name: &'static str,
        cmp: fn(&Value, &Value) -> VmResult<bool>,
    ) -> VmResult<()> {
        self.note_primitive(name)?;
        let left = self.stack.pop()?;
        self.val = Value::boolean(cmp(&left, &self.val)?);
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_numdiff(&mut self) -> VmResult<()> {
        self.note_primitive("=")?;
        let left = self.stack.pop()?;
        self.val = Value::boolean(!number::numeq2(&left, &self.val)?);
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_incr(&mut self) -> VmResult<()> {
        self.note_primitive("+")?;
        self.val = number::add2(&self.val, &Value::Fixnum(1))?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_decr(&mut self) -> VmResult<()> {
        self.note_primitive("-")?;
        self.val = number::sub2(&self.val, &Value::Fixnum(1))?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_cons(&mut self) -> VmResult<()> {
        let left = self.stack.pop()?;
        self.val = Value::cons(left, self.val.clone());
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_car(&mut self) -> VmResult<()> {
        self.note_primitive("car")?;
        self.val = self.val.car()?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_cdr(&mut self) -> VmResult<()> {
        self.note_primitive("cdr")?;
        self.val = self.val.cdr()?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_nullp(&mut self) {
        self.val = Value::boolean(matches!(self.val, Value::Nil));
        self.valc = 1;
    }

    pub(crate) fn in_not(&mut self) {
        self.val = Value::boolean(self.val.is_false());
        self.valc = 1;
    }

    pub(crate) fn in_equality(
        &mut self,
        pred: fn(&Value, &Value) -> bool,
        negate: bool,
    ) -> VmResult<()> {
        let left = self.stack.pop()?;
        self.val = Value::boolean(pred(&left, &self.val) != negate);
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_vref(&mut self) -> VmResult<()> {
        self.note_primitive("vector-ref")?;
        let vec = self.stack.pop()?;
        self.val = vector_ref(&vec, &self.val)?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_sref(&mut self) -> VmResult<()> {
        self.note_primitive("string-ref")?;
        let s = self.stack.pop()?;
        self.val = string_ref(&s, &self.val)?;
        self.valc = 1;
        Ok(())
    }

    pub(crate) fn in_vset(&mut self) -> VmResult<()> {
        self.note_primitive("vector-set!")?;
        let index = self.stack.pop()?;
        let vec = self.stack.pop()?;
        vector_set(&vec, &index, self.val.clone())?;
        self.val = Value::Void;
        self.valc = 0;
        Ok(())
    }

    pub(crate) fn in_sset(&mut self) -> VmResult<()> {
        self.note_primitive("string-set!")?;
        let index = self.stack.pop()?;
        let s = self.stack.pop()?;
        string_set(&s, &index, &self.val)?;
        self.val = Value::Void;
        self.valc = 0;
        Ok(())
    }
}

/// `vector-ref`, shared with the named primitive.
pub(crate) fn vector_ref(vec: &Value, index: &Value) -> VmResult<Value> {
    let Value::Vector(items) = vec else {
        return Err(VmError::bad_operand("vector-ref", vec.to_string()));
    };
    let i = index.as_fixnum()?;
    let items = items.borrow();
    if i < 0 || i as usize >= items.len() {
        return Err(VmError::bad_operand(
            "vector-ref",
            format!("index {i} out of bounds"),
        ));
    }
    Ok(items[i as usize].clone())
}

/// `vector-set!`, shared with the named primitive.
pub(crate) fn vector_set(vec: &Value, index: &Value, value: Value) -> VmResult<()> {
    let Value::Vector(items) = vec else {
        return Err(VmError::bad_operand("vector-set!", vec.to_string()));
    };
    let i = index.as_fixnum()?;
    let mut items = items.borrow_mut();
    if i < 0 || i as usize >= items.len() {
        return Err(VmError::bad_operand(
            "vector-set!",
            format!("index {i} out of bounds"),
        ));
    }
    items[i as usize] = value;
    Ok(())
}

/// `string-ref`, shared with the named primitive.
pub(crate) fn string_ref(s: &Value, index: &Value) -> VmResult<Value> {
    let Value::Str(chars) = s else {
        return Err(VmError::bad_operand("string-ref", s.to_string()));
    };
    let i = index.as_fixnum()?;
    if i < 0 {
        return Err(VmError::bad_operand(
            "string-ref",
            format!("index {i} out of bounds"),
        ));
    }
    chars
        .borrow()
        .chars()
        .nth(i as usize)
        .map(Value::Char)
        .ok_or_else(|| VmError::bad_operand("string-ref", format!("index {i} out of bounds")))
}

/// `string-set!`, shared with the named primitive.
pub(crate) fn string_set(s: &Value, index: &Value, value: &Value) -> VmResult<()> {
    let Value::Str(chars) = s else {
        return Err(VmError::bad_operand("string-set!", s.to_string()));
    };
    let Value::Char(replacement) = value else {
        return Err(VmError::bad_operand("string-set!", value.to_string()));
    };
    let i = index.as_fixnum()?;
    let mut text = chars.borrow_mut();
    if i < 0 {
        return Err(VmError::bad_operand(
            "string-set!",
            format!("index {i} out of bounds"),
        ));
    }
    let mut rebuilt = String::with_capacity(text.len());
    let mut replaced = false;
    for (pos, c) in text.chars().enumerate() {
        if pos == i as usize {
            rebuilt.push(*replacement);
            replaced = true;
        } else {
            rebuilt.push(c);
        }
    }
    if !replaced {
        return Err(VmError::bad_operand(
            "string-set!",
            format!("index {i} out of bounds"),
        ));
    }
    *text = rebuilt;
    Ok(())
}
