//! Shared helpers for the VM integration suites.
#![allow(dead_code)]

use skein_vm::{CodeBuilder, Engine, OpCode, Value, VmResult};

/// Assembles a program with `build`, appends `END_OF_CODE`, and runs it
/// on `engine` against the current module.
pub fn run(engine: &mut Engine, build: impl FnOnce(&mut CodeBuilder)) -> VmResult<Value> {
    let mut b = CodeBuilder::new();
    build(&mut b);
    let (chunk, constants) = b.finish();
    engine.execute(chunk, constants, None)
}

/// Emits a fused global-reference-and-invoke of `name`.
pub fn gref_invoke(b: &mut CodeBuilder, name: &str, nargs: u16) {
    let k = b.constant(Value::symbol(name));
    b.emit2(OpCode::GREF_INVOKE, k, nargs);
}

/// Emits a global reference of `name`.
pub fn gref(b: &mut CodeBuilder, name: &str) {
    let k = b.constant(Value::symbol(name));
    b.emit1(OpCode::GLOBAL_REF, k);
}

/// Emits a definition of `name` from the value register.
pub fn define(b: &mut CodeBuilder, name: &str) {
    let k = b.constant(Value::symbol(name));
    b.emit1(OpCode::DEFINE_SYMBOL, k);
}
