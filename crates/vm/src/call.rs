//! The call protocol of the Skein Virtual Machine.
//!
//! `funcall` dispatches on the callee tag: closures enter the dispatch
//! loop directly (reusing the activation record for tail calls),
//! primitives run natively by arity class, generic functions and
//! next-method tokens loop back with a rewritten callee, the `apply`
//! trampoline rearranges the argument region in place, and parameter
//! objects behave as zero/one-argument accessors.

use std::rc::Rc;

use crate::engine::{Engine, Flow};
use crate::error::{VmError, VmResult};
use crate::frame::Frame;
use crate::stack::{decode_index, ACT_SAVE_CST, ACT_SAVE_ENV, ACT_SAVE_FP, ACT_SAVE_PC, ACT_SAVE_PROC};
use crate::code::CodePtr;
use crate::value::{Closure, NextMethod, Subr, Value};

/// Describes a closure for arity conditions.
fn closure_label(callee: &Value) -> String {
    callee.to_string()
}

impl Engine {
    /// Invokes the callee in `val` with `nargs` arguments already on the
    /// stack. With `tailp` the current activation record is reused.
    pub(crate) fn funcall(&mut self, nargs: usize, tailp: bool) -> VmResult<Flow> {
        let mut nargs = nargs;
        loop {
            let callee = self.val.clone();
            match &callee {
                Value::Closure(clos) => {
                    let clos = clos.clone();
                    self.call_closure(&callee, &clos, nargs, tailp)?;
                    return Ok(Flow::Next);
                }

                Value::Primitive(prim) if matches!(prim.subr, Subr::Apply) => {
                    self.apply_trampoline(nargs)?;
                    nargs = decode_index(&self.r2)?;
                    self.val = self.r1.clone();
                    continue;
                }

                Value::Primitive(prim) => {
                    let prim = prim.clone();
                    self.stack.set(self.fp + ACT_SAVE_PROC, callee.clone())?;
                    let result = self.call_primitive(&prim, nargs)?;
                    self.val = result;
                    self.return_from_primitive()?;
                    return Ok(Flow::Next);
                }

                Value::Generic(gf) if gf.pure_generic => {
                    let mut args = Vec::with_capacity(nargs);
                    for i in 0..nargs {
                        args.push(self.arg(nargs, i)?);
                    }
                    let methods = match &self.resolver {
                        Some(resolver) => resolver.clone().applicable_methods(&callee, &args),
                        None => Vec::new(),
                    };
                    if methods.is_empty() {
                        // The no-applicable-method hook declined to error.
                        self.val = Value::Void;
                        return Ok(Flow::Finished);
                    }
                    let first = methods[0].clone();
                    let token = NextMethod {
                        gf: callee.clone(),
                        method: first.clone(),
                        args,
                        methods: methods[1..].to_vec(),
                    };
                    install_next_method(&first, token);
                    self.val = first;
                    continue;
                }

                Value::Generic(_) => {
                    // Functionable instance: hand over to the MOP.
                    let args = self.listify_top(nargs)?;
                    self.stack.push(callee.clone())?;
                    self.stack.push(args)?;
                    self.val = self.lookup_value("apply-generic")?;
                    nargs = 2;
                    continue;
                }

                Value::NextMethod(token) => {
                    let token = token.clone();
                    if nargs == 0 {
                        // Replay the arguments of the original call.
                        for arg in &token.args {
                            self.stack.push(arg.clone())?;
                        }
                        nargs = token.args.len();
                    }
                    if token.methods.is_empty() {
                        let args = self.listify_top(nargs)?;
                        self.stack.push(token.gf.clone())?;
                        self.stack.push(token.method.clone())?;
                        self.stack.push(args)?;
                        nargs = 3;
                        self.val = self.lookup_value("no-next-method")?;
                    } else {
                        let next = token.methods[0].clone();
                        let mut args = Vec::with_capacity(nargs);
                        for i in 0..nargs {
                            args.push(self.arg(nargs, i)?);
                        }
                        let refreshed = NextMethod {
                            gf: token.gf.clone(),
                            method: next.clone(),
                            args,
                            methods: token.methods[1..].to_vec(),
                        };
                        install_next_method(&next, refreshed);
                        self.val = next;
                    }
                    continue;
                }

                Value::Parameter(param) => {
                    let param = param.clone();
                    self.stack.set(self.fp + ACT_SAVE_PROC, callee.clone())?;
                    let result = match nargs {
                        0 => param.value.borrow().clone(),
                        1 => {
                            let mut v = self.arg(1, 0)?;
                            let converter = param.converter.clone();
                            if converter.is_procedure() {
                                v = self.apply(&converter, &[v])?;
                            }
                            *param.value.borrow_mut() = v.clone();
                            v
                        }
                        _ => {
                            return Err(invoke_arity_error("parameter", "0 or 1 arguments", nargs))
                        }
                    };
                    self.val = result;
                    self.return_from_primitive()?;
                    return Ok(Flow::Next);
                }

                Value::Continuation(_) => {
                    if nargs != 1 {
                        return Err(invoke_arity_error("continuation", "1 argument", nargs));
                    }
                    let v = self.arg(1, 0)?;
                    return Err(self.restore_continuation(&callee, v));
                }

                other => {
                    self.stack.set(self.fp + ACT_SAVE_PROC, callee.clone())?;
                    return Err(VmError::bad_callable(other.to_string()));
                }
            }
        }
    }

    /// Checks and adjusts the argument count against the closure arity,
    /// folding the excess of a variadic call into a list on the stack.
    fn adjust_arity(&mut self, callee: &Value, arity: i16, nargs: usize) -> VmResult<usize> {
        if arity >= 0 {
            if nargs != arity as usize {
                self.stack.set(self.fp + ACT_SAVE_PROC, callee.clone())?;
                return Err(VmError::arity_exact(closure_label(callee), arity, nargs));
            }
            return Ok(nargs);
        }
        let min = (-arity - 1) as usize;
        if nargs < min {
            self.stack.set(self.fp + ACT_SAVE_PROC, callee.clone())?;
            return Err(VmError::arity_at_least(
                closure_label(callee),
                min as i16,
                nargs,
            ));
        }
        let rest = self.listify_top(nargs - min)?;
        self.stack.push(rest)?;
        Ok(min + 1)
    }

    fn call_closure(
        &mut self,
        callee: &Value,
        clos: &Rc<Closure>,
        nargs: usize,
        tailp: bool,
    ) -> VmResult<()> {
        let nargs = self.adjust_arity(callee, clos.arity, nargs)?;

        let mut slots = vec![Value::Void; nargs];
        for slot in slots.iter_mut().rev() {
            *slot = self.stack.pop()?;
        }

        if tailp {
            // Reuse the enclosing record: the one this call prepared is
            // discarded by stepping back to its saved frame pointer.
            let old_fp = decode_index(self.stack.get(self.fp + ACT_SAVE_FP)?)?;
            self.fp = old_fp;
            self.stack.set_sp(self.fp)?;
        } else {
            self.stack.set(self.fp + ACT_SAVE_ENV, self.env.clone())?;
            self.stack.set(
                self.fp + ACT_SAVE_PC,
                Value::CodePointer(CodePtr::new(self.code.clone(), self.pc)),
            )?;
            self.stack
                .set(self.fp + ACT_SAVE_CST, self.constants.clone())?;
        }
        self.stack.set(self.fp + ACT_SAVE_PROC, callee.clone())?;

        let frame = Frame::new(callee.clone(), clos.env.borrow().clone(), slots);
        self.env = Value::Frame(Rc::new(frame));
        self.code = clos.code.clone();
        self.pc = clos.entry;
        self.constants = clos.constants.clone();
        Ok(())
    }

    /// Runs a primitive subroutine after verifying its arity class.
    fn call_primitive(&mut self, prim: &Rc<crate::value::Primitive>, nargs: usize) -> VmResult<Value> {
        match prim.subr {
            Subr::F0(f) if nargs == 0 => f(self),
            Subr::F1(f) if nargs == 1 => {
                let a = self.arg(1, 0)?;
                f(self, a)
            }
            Subr::F2(f) if nargs == 2 => {
                let a = self.arg(2, 0)?;
                let b = self.arg(2, 1)?;
                f(self, a, b)
            }
            Subr::F3(f) if nargs == 3 => {
                let a = self.arg(3, 0)?;
                let b = self.arg(3, 1)?;
                let c = self.arg(3, 2)?;
                f(self, a, b, c)
            }
            Subr::F4(f) if nargs == 4 => {
                let a = self.arg(4, 0)?;
                let b = self.arg(4, 1)?;
                let c = self.arg(4, 2)?;
                let d = self.arg(4, 3)?;
                f(self, a, b, c, d)
            }
            Subr::F5(f) if nargs == 5 => {
                let a = self.arg(5, 0)?;
                let b = self.arg(5, 1)?;
                let c = self.arg(5, 2)?;
                let d = self.arg(5, 3)?;
                let e = self.arg(5, 4)?;
                f(self, a, b, c, d, e)
            }
            Subr::F01(f) if nargs <= 1 => {
                let a = if nargs == 1 { Some(self.arg(1, 0)?) } else { None };
                f(self, a)
            }
            Subr::F12(f) if (1..=2).contains(&nargs) => {
                let a = self.arg(nargs, 0)?;
                let b = if nargs == 2 { Some(self.arg(2, 1)?) } else { None };
                f(self, a, b)
            }
            Subr::F23(f) if (2..=3).contains(&nargs) => {
                let a = self.arg(nargs, 0)?;
                let b = self.arg(nargs, 1)?;
                let c = if nargs == 3 { Some(self.arg(3, 2)?) } else { None };
                f(self, a, b, c)
            }
            Subr::Vararg(f) => f(self, nargs),
            // The apply trampoline is dispatched by funcall itself.
            Subr::Apply => Err(VmError::corrupted_stack("apply reached the primitive path")),
            _ => Err(invoke_arity_error(prim.name, expected_of(&prim.subr), nargs)),
        }
    }

    /// The `apply` trampoline: collapses the callee and trailing
    /// argument list into a flat argument region, leaving the target
    /// procedure and its argument count in the scratch registers.
    fn apply_trampoline(&mut self, argc: usize) -> VmResult<()> {
        if argc == 0 {
            return Err(VmError::arity_at_least("apply", 1, 0));
        }
        let func = self.arg(argc, 0)?;
        let mut nargs = argc - 1;
        if nargs > 0 {
            let last = self.arg(argc, argc - 1)?;
            let len = last.list_length().ok_or_else(|| {
                VmError::bad_operand("apply", format!("last argument {last} is not a list"))
            })?;
            let mut middle = Vec::with_capacity(nargs - 1);
            for i in 1..argc - 1 {
                middle.push(self.arg(argc, i)?);
            }
            let sp = self.stack.sp();
            self.stack.set_sp(sp + argc)?;
            for arg in middle {
                self.stack.push(arg)?;
            }
            let mut cursor = last;
            while let Value::Pair(p) = cursor {
                self.stack.push(p.car.borrow().clone())?;
                let next = p.cdr.borrow().clone();
                cursor = next;
            }
            nargs = argc - 2 + len;
        } else {
            let sp = self.stack.sp();
            self.stack.set_sp(sp + 1)?;
        }
        self.r1 = func;
        self.r2 = Value::Fixnum(nargs as i64);
        Ok(())
    }
}

fn install_next_method(procedure: &Value, token: NextMethod) {
    if let Value::Closure(c) = procedure {
        *c.next_method.borrow_mut() = Value::NextMethod(Rc::new(token));
    }
}

fn expected_of(subr: &Subr) -> &'static str {
    match subr {
        Subr::F0(_) => "0 arguments",
        Subr::F1(_) => "1 argument",
        Subr::F2(_) => "2 arguments",
        Subr::F3(_) => "3 arguments",
        Subr::F4(_) => "4 arguments",
        Subr::F5(_) => "5 arguments",
        Subr::F01(_) => "0 or 1 arguments",
        Subr::F12(_) => "1 or 2 arguments",
        Subr::F23(_) => "2 or 3 arguments",
        Subr::Vararg(_) | Subr::Apply => "any number of arguments",
    }
}

fn invoke_arity_error(callee: &str, expected: &str, given: usize) -> VmError {
    VmError::WrongArity {
        callee: callee.to_string(),
        expected: expected.to_string(),
        given,
    }
}
