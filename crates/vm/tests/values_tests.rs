//! Multiple-value protocol tests: `values`, `call-with-values`, the
//! register-overflow packing rule, and single-value contexts.

mod common;

use common::{gref, gref_invoke, run};
use skein_vm::{Engine, OpCode, Value, MAX_VALS};

#[test]
fn producer_and_consumer_see_all_values() {
    let mut engine = Engine::default();

    // (call-with-values (lambda () (values 4 5)) (lambda (a b) b)) => 5
    let v = run(&mut engine, |b| {
        b.emit(OpCode::PREPARE_CALL);
        {
            let producer = b.begin_closure(0);
            b.emit(OpCode::PREPARE_CALL);
            b.emit1(OpCode::INT_PUSH, 4);
            b.emit1(OpCode::INT_PUSH, 5);
            gref_invoke(b, "values", 2);
            b.emit(OpCode::RETURN);
            b.patch_here(producer);
        }
        b.emit(OpCode::PUSH);
        {
            let consumer = b.begin_closure(2);
            b.emit(OpCode::LOCAL_REF1);
            b.emit(OpCode::RETURN);
            b.patch_here(consumer);
        }
        b.emit(OpCode::PUSH);
        gref_invoke(b, "call-with-values", 2);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 5);
}

#[test]
fn primitive_producer_and_consumer() {
    let mut engine = Engine::default();

    // (call-with-values * -) => -1
    let v = run(&mut engine, |b| {
        b.emit(OpCode::PREPARE_CALL);
        gref(b, "*");
        b.emit(OpCode::PUSH);
        gref(b, "-");
        b.emit(OpCode::PUSH);
        gref_invoke(b, "call-with-values", 2);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), -1);
}

#[test]
fn zero_values_call_the_consumer_with_no_arguments() {
    let mut engine = Engine::default();

    // (call-with-values (lambda () (values)) list) => ()
    let v = run(&mut engine, |b| {
        b.emit(OpCode::PREPARE_CALL);
        {
            let producer = b.begin_closure(0);
            b.emit(OpCode::PREPARE_CALL);
            gref_invoke(b, "values", 0);
            b.emit(OpCode::RETURN);
            b.patch_here(producer);
        }
        b.emit(OpCode::PUSH);
        gref(b, "list");
        b.emit(OpCode::PUSH);
        gref_invoke(b, "call-with-values", 2);
    })
    .unwrap();
    assert!(matches!(v, Value::Nil));
}

#[test]
fn many_values_pack_into_a_vector_register() {
    let mut engine = Engine::default();

    // Twelve values exceed the register file; the consumer must still
    // receive all of them in order.
    let count = (MAX_VALS + 4) as u16;
    let v = run(&mut engine, |b| {
        b.emit(OpCode::PREPARE_CALL);
        {
            let producer = b.begin_closure(0);
            b.emit(OpCode::PREPARE_CALL);
            for i in 0..count {
                b.emit1(OpCode::INT_PUSH, i);
            }
            gref_invoke(b, "values", count);
            b.emit(OpCode::RETURN);
            b.patch_here(producer);
        }
        b.emit(OpCode::PUSH);
        gref(b, "list");
        b.emit(OpCode::PUSH);
        gref_invoke(b, "call-with-values", 2);
    })
    .unwrap();

    let items = v.list_to_vec().unwrap();
    assert_eq!(items.len(), count as usize);
    for (i, item) in items.iter().enumerate() {
        assert_eq!(item.as_fixnum().unwrap(), i as i64);
    }
}

#[test]
fn extra_values_are_ignored_outside_call_with_values() {
    let mut engine = Engine::default();

    // (+ 1 (values 41 99)) => 42: only the first value is observable.
    let v = run(&mut engine, |b| {
        b.emit(OpCode::ONE_PUSH);
        b.emit(OpCode::PREPARE_CALL);
        b.emit1(OpCode::INT_PUSH, 41);
        b.emit1(OpCode::INT_PUSH, 99);
        gref_invoke(b, "values", 2);
        b.emit(OpCode::IN_ADD2);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 42);
}

#[test]
fn values_of_one_behaves_as_identity() {
    let mut engine = Engine::default();
    let v = run(&mut engine, |b| {
        b.emit(OpCode::PREPARE_CALL);
        {
            let producer = b.begin_closure(0);
            b.emit(OpCode::PREPARE_CALL);
            b.emit1(OpCode::INT_PUSH, 8);
            gref_invoke(b, "values", 1);
            b.emit(OpCode::RETURN);
            b.patch_here(producer);
        }
        b.emit(OpCode::PUSH);
        {
            let consumer = b.begin_closure(1);
            b.emit(OpCode::LOCAL_REF0);
            b.emit(OpCode::RETURN);
            b.patch_here(consumer);
        }
        b.emit(OpCode::PUSH);
        gref_invoke(b, "call-with-values", 2);
    })
    .unwrap();
    assert_eq!(v.as_fixnum().unwrap(), 8);
}
