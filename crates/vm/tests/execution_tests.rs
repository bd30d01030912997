//! Core interpreter tests: immediates, constants, globals and patching,
//! locals, branches, closures, let forms and tail calls.

mod common;

use common::{define, gref, gref_invoke, run};
use skein_vm::{CodeBuilder, Engine, EngineLimits, OpCode, Value, VmError};

#[test]
fn immediates_load_into_val() {
    let mut engine = Engine::default();

    let v = run(&mut engine, |b| {
        b.emit(OpCode::IM_TRUE);
    })
    .unwrap();
    assert!(matches!(v, Value::True));

    let v = run(&mut engine, |b| {
        b.emit(OpCode::IM_MINUS1);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), -1);

    let v = run(&mut engine, |b| {
        b.emit1(OpCode::SMALL_INT, (-300i16) as u16);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), -300);
}

#[test]
fn constants_and_push_variants() {
    let mut engine = Engine::default();
    let v = run(&mut engine, |b| {
        let k = b.constant(Value::string("hello"));
        b.emit1(OpCode::CONSTANT_PUSH, k);
        b.emit1(OpCode::SMALL_INT, 1);
        b.emit(OpCode::POP);
    })
    .unwrap();
    assert!(skein_vm::equal(&v, &Value::string("hello")));
}

#[test]
fn inlined_arithmetic_and_comparisons() {
    let mut engine = Engine::default();

    let v = run(&mut engine, |b| {
        b.emit1(OpCode::INT_PUSH, 10);
        b.emit1(OpCode::SMALL_INT, 4);
        b.emit(OpCode::IN_SUB2);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 6);

    let v = run(&mut engine, |b| {
        b.emit1(OpCode::INT_PUSH, 3);
        b.emit1(OpCode::SMALL_INT, 7);
        b.emit(OpCode::IN_NUMLT);
    })
    .unwrap();
    assert!(matches!(v, Value::True));

    let v = run(&mut engine, |b| {
        b.emit1(OpCode::INT_PUSH, 5);
        b.emit(OpCode::IN_INCR);
        b.emit(OpCode::IN_DECR);
        b.emit(OpCode::IN_DECR);
        // val = 4, still 5 on the stack from INT_PUSH.
        b.emit(OpCode::IN_ADD2);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 9);
}

#[test]
fn pair_and_vector_opcodes() {
    let mut engine = Engine::default();

    let v = run(&mut engine, |b| {
        b.emit1(OpCode::INT_PUSH, 1);
        b.emit1(OpCode::SMALL_INT, 2);
        b.emit(OpCode::IN_CONS);
        b.emit(OpCode::IN_CAR);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 1);

    let v = run(&mut engine, |b| {
        b.emit1(OpCode::INT_PUSH, 1);
        b.emit1(OpCode::INT_PUSH, 2);
        b.emit1(OpCode::INT_PUSH, 3);
        b.emit1(OpCode::IN_LIST, 3);
        b.emit(OpCode::IN_CDR);
        b.emit(OpCode::IN_CAR);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 2);

    let v = run(&mut engine, |b| {
        let k = b.constant(Value::vector(vec![
            Value::Fixnum(10),
            Value::Fixnum(20),
            Value::Fixnum(30),
        ]));
        b.emit1(OpCode::CONSTANT_PUSH, k);
        b.emit1(OpCode::SMALL_INT, 2);
        b.emit(OpCode::IN_VREF);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 30);
}

#[test]
fn branches_take_and_fall_through() {
    let mut engine = Engine::default();

    // (if (< 1 2) 'yes 'no)
    let v = run(&mut engine, |b| {
        b.emit1(OpCode::INT_PUSH, 1);
        b.emit1(OpCode::SMALL_INT, 2);
        let to_else = b.emit_jump(OpCode::JUMP_NUMGE);
        let yes = b.constant(Value::symbol("yes"));
        b.emit1(OpCode::CONSTANT, yes);
        let to_end = b.emit_jump(OpCode::GOTO);
        b.patch_here(to_else);
        let no = b.constant(Value::symbol("no"));
        b.emit1(OpCode::CONSTANT, no);
        b.patch_here(to_end);
        b.emit(OpCode::NOP);
    })
    .unwrap();
    assert!(skein_vm::equal(&v, &Value::symbol("yes")));

    // JUMP_NOT_EQV on distinct values branches.
    let v = run(&mut engine, |b| {
        b.emit1(OpCode::INT_PUSH, 1);
        b.emit1(OpCode::SMALL_INT, 2);
        let taken = b.emit_jump(OpCode::JUMP_NOT_EQV);
        b.emit(OpCode::IM_FALSE);
        let end = b.emit_jump(OpCode::GOTO);
        b.patch_here(taken);
        b.emit(OpCode::IM_TRUE);
        b.patch_here(end);
        b.emit(OpCode::NOP);
    })
    .unwrap();
    assert!(matches!(v, Value::True));
}

#[test]
fn globals_define_set_and_patching() {
    let mut engine = Engine::default();

    run(&mut engine, |b| {
        b.emit1(OpCode::SMALL_INT, 11);
        define(b, "counter");
    })
    .unwrap();

    // A loop body re-executes GLOBAL_REF after it has been patched to
    // UGLOBAL_REF; both executions must read the same binding.
    let v = run(&mut engine, |b| {
        // first read, patches in place
        gref(b, "counter");
        b.emit(OpCode::PUSH);
        // second read through the same (now patched) instruction would
        // need a loop; instead re-emit and compare both reads.
        gref(b, "counter");
        b.emit(OpCode::IN_ADD2);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 22);

    // GLOBAL_SET mutates the same cell GLOBAL_REF resolves.
    let v = run(&mut engine, |b| {
        let k = b.constant(Value::symbol("counter"));
        b.emit1(OpCode::SMALL_INT, 5);
        b.emit1(OpCode::GLOBAL_SET, k);
        gref(b, "counter");
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 5);
}

#[test]
fn patched_and_unpatched_reads_agree_across_executions() {
    let mut engine = Engine::default();
    run(&mut engine, |b| {
        b.emit1(OpCode::SMALL_INT, 7);
        define(b, "x");
    })
    .unwrap();

    // Run the same chunk twice: the first execution patches GLOBAL_REF
    // into UGLOBAL_REF, the second goes through the patched slot.
    let mut b = CodeBuilder::new();
    gref(&mut b, "x");
    let (chunk, constants) = b.finish();

    let first = engine
        .execute(chunk.clone(), constants.clone(), None)
        .unwrap();
    assert_eq!(chunk.fetch(0).unwrap(), OpCode::UGLOBAL_REF as u16);
    let second = engine.execute(chunk, constants, None).unwrap();
    assert_eq!(first.as_fixnum().unwrap(), 7);
    assert_eq!(second.as_fixnum().unwrap(), 7);
}

#[test]
fn unbound_global_reports_the_name() {
    let mut engine = Engine::default();
    let err = run(&mut engine, |b| {
        gref(b, "no-such-binding");
    })
    .unwrap_err();
    match err {
        VmError::UnboundVariable { name } => assert_eq!(name, "no-such-binding"),
        other => panic!("expected unbound variable, got {other}"),
    }
}

#[test]
fn closure_call_and_local_access() {
    let mut engine = Engine::default();

    // (define (second a b) b) (second 1 2)
    let v = run(&mut engine, |b| {
        let body = b.begin_closure(2);
        b.emit(OpCode::LOCAL_REF1);
        b.emit(OpCode::RETURN);
        b.patch_here(body);
        define(b, "second");

        b.emit(OpCode::PREPARE_CALL);
        b.emit1(OpCode::INT_PUSH, 1);
        b.emit1(OpCode::INT_PUSH, 2);
        gref_invoke(b, "second", 2);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 2);
}

#[test]
fn closure_captures_its_environment() {
    let mut engine = Engine::default();

    // (define (adder n) (lambda (m) (+ n m))) ((adder 10) 32)
    let v = run(&mut engine, |b| {
        let outer = b.begin_closure(1);
        {
            let inner = b.begin_closure(1);
            b.emit1(OpCode::DEEP_LOCAL_REF, 1 << 8);
            b.emit(OpCode::PUSH);
            b.emit(OpCode::LOCAL_REF0);
            b.emit(OpCode::IN_ADD2);
            b.emit(OpCode::RETURN);
            b.patch_here(inner);
        }
        b.emit(OpCode::RETURN);
        b.patch_here(outer);
        define(b, "adder");

        b.emit(OpCode::PREPARE_CALL);
        b.emit1(OpCode::INT_PUSH, 10);
        gref_invoke(b, "adder", 1);
        define(b, "add10");

        b.emit(OpCode::PREPARE_CALL);
        b.emit1(OpCode::INT_PUSH, 32);
        gref_invoke(b, "add10", 1);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 42);
}

#[test]
fn define_names_anonymous_closures() {
    let mut engine = Engine::default();
    let v = run(&mut engine, |b| {
        let body = b.begin_closure(0);
        b.emit(OpCode::IM_NIL);
        b.emit(OpCode::RETURN);
        b.patch_here(body);
        define(b, "nothing");
        gref(b, "nothing");
    })
    .unwrap();
    match v {
        Value::Closure(c) => {
            assert!(skein_vm::equal(&c.name.borrow(), &Value::symbol("nothing")))
        }
        other => panic!("expected closure, got {other}"),
    }
}

#[test]
fn let_forms_bind_and_unbind() {
    let mut engine = Engine::default();

    // (let ((a 3) (b 4)) (+ a b))
    let v = run(&mut engine, |b| {
        b.emit(OpCode::PREPARE_CALL);
        b.emit1(OpCode::INT_PUSH, 3);
        b.emit1(OpCode::INT_PUSH, 4);
        b.emit1(OpCode::ENTER_LET, 2);
        b.emit(OpCode::LOCAL_REF0);
        b.emit(OpCode::PUSH);
        b.emit(OpCode::LOCAL_REF1);
        b.emit(OpCode::IN_ADD2);
        b.emit(OpCode::LEAVE_LET);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 7);

    // (let* ((a 5) (b (+ a 1))) (* a b))
    let v = run(&mut engine, |b| {
        b.emit1(OpCode::ENTER_LET_STAR, 2);
        b.emit1(OpCode::SMALL_INT, 5);
        b.emit(OpCode::LOCAL_SET0);
        b.emit(OpCode::LOCAL_REF0);
        b.emit(OpCode::IN_INCR);
        b.emit(OpCode::LOCAL_SET1);
        b.emit(OpCode::LOCAL_REF0);
        b.emit(OpCode::PUSH);
        b.emit(OpCode::LOCAL_REF1);
        b.emit(OpCode::IN_MUL2);
        b.emit(OpCode::LEAVE_LET);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 30);
}

#[test]
fn self_tail_call_runs_in_constant_space() {
    // A small stack proves record reuse: a hundred thousand iterations
    // would need seven hundred thousand slots without it.
    let mut engine = Engine::new(EngineLimits {
        stack_len: 512,
        ..EngineLimits::default()
    });

    // (define (loop n) (if (= n 0) 'done (loop (- n 1)))) (loop 100000)
    let v = run(&mut engine, |b| {
        let done = b.constant(Value::symbol("done"));
        let loop_sym = b.constant(Value::symbol("loop"));
        let count = b.constant(Value::Fixnum(100_000));

        let body = b.begin_closure(1);
        b.emit(OpCode::LOCAL_REF0);
        b.emit(OpCode::PUSH);
        b.emit(OpCode::IM_ZERO);
        let recurse = b.emit_jump(OpCode::JUMP_NUMDIFF);
        b.emit1(OpCode::CONSTANT, done);
        b.emit(OpCode::RETURN);
        b.patch_here(recurse);
        b.emit(OpCode::PREPARE_CALL);
        b.emit(OpCode::LOCAL_REF0);
        b.emit(OpCode::IN_DECR);
        b.emit(OpCode::PUSH);
        b.emit1(OpCode::GLOBAL_REF, loop_sym);
        b.emit1(OpCode::TAIL_INVOKE, 1);
        b.patch_here(body);
        define(b, "loop");

        b.emit(OpCode::PREPARE_CALL);
        b.emit1(OpCode::CONSTANT_PUSH, count);
        gref_invoke(b, "loop", 1);
    })
    .unwrap();
    assert!(skein_vm::equal(&v, &Value::symbol("done")));
}

#[test]
fn deep_recursion_without_tail_calls_overflows() {
    let mut engine = Engine::new(EngineLimits {
        stack_len: 256,
        ..EngineLimits::default()
    });

    // (define (f n) (if (= n 0) 0 (+ 1 (f (- n 1))))) (f 1000)
    let err = run(&mut engine, |b| {
        let f = b.constant(Value::symbol("f"));
        let body = b.begin_closure(1);
        b.emit(OpCode::LOCAL_REF0);
        b.emit(OpCode::PUSH);
        b.emit(OpCode::IM_ZERO);
        let recurse = b.emit_jump(OpCode::JUMP_NUMDIFF);
        b.emit(OpCode::IM_ZERO);
        b.emit(OpCode::RETURN);
        b.patch_here(recurse);
        b.emit(OpCode::ONE_PUSH);
        b.emit(OpCode::PREPARE_CALL);
        b.emit(OpCode::LOCAL_REF0);
        b.emit(OpCode::IN_DECR);
        b.emit(OpCode::PUSH);
        b.emit1(OpCode::GLOBAL_REF, f);
        b.emit1(OpCode::INVOKE, 1);
        b.emit(OpCode::IN_ADD2);
        b.emit(OpCode::RETURN);
        b.patch_here(body);
        define(b, "f");

        b.emit(OpCode::PREPARE_CALL);
        b.emit1(OpCode::INT_PUSH, 1000);
        gref_invoke(b, "f", 1);
    })
    .unwrap_err();
    assert!(matches!(err, VmError::StackOverflow));
    engine.reset();
}

#[test]
fn obsolete_debug_bytecode_is_rejected() {
    let mut engine = Engine::default();
    let err = run(&mut engine, |b| {
        b.emit(OpCode::IM_ZERO);
        b.emit(OpCode::PUSH);
        b.emit(OpCode::IM_ONE);
        b.emit1(OpCode::DBG_VM, 0);
    })
    .unwrap_err();
    assert!(matches!(err, VmError::BadBytecode { .. }));
    engine.reset();
}

#[test]
fn invalid_opcode_is_bad_bytecode() {
    let mut engine = Engine::default();
    let chunk = skein_vm::CodeChunk::new(vec![9999]);
    let err = engine
        .execute(chunk, Value::vector(Vec::new()), None)
        .unwrap_err();
    assert!(matches!(err, VmError::BadBytecode { .. }));
    engine.reset();
}
