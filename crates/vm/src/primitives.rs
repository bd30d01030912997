//! Built-in primitives of the Skein Virtual Machine.
//!
//! These are the procedures the core itself must provide: the reflection
//! surface (`%execute`, `%vm-backtrace`, `%dump-code`), multiple values,
//! the continuation operations, the raising entry point, and the named
//! counterparts of the inlined opcodes. Everything else belongs to the
//! library subsystems outside the VM.

use std::cell::RefCell;
use std::fs::File;
use std::io::BufWriter;
use std::rc::Rc;

use crate::code::CodeChunk;
use crate::engine::{Engine, MAX_VALS};
use crate::error::{VmError, VmResult};
use crate::inlined;
use crate::loader;
use crate::number;
use crate::symbol::Symbol;
use crate::value::{eq, equal, eqv, ParameterObject, Primitive, Subr, Value};

/// Installs the built-in primitives into the core module and records
/// them in the engine's named-primitive registry.
pub(crate) fn install(engine: &mut Engine) {
    let table: &[(&'static str, Subr)] = &[
        ("apply", Subr::Apply),
        ("values", Subr::Vararg(prim_values)),
        ("call-with-values", Subr::F2(prim_call_with_values)),
        ("%execute", Subr::F23(prim_execute)),
        ("%vm-backtrace", Subr::F0(prim_vm_backtrace)),
        ("%dump-code", Subr::F2(prim_dump_code)),
        ("%make-continuation", Subr::F0(prim_make_continuation)),
        ("%restore-continuation", Subr::F2(prim_restore_continuation)),
        ("%continuation?", Subr::F1(prim_continuation_p)),
        ("%fresh-continuation?", Subr::F1(prim_fresh_continuation_p)),
        ("raise", Subr::F1(prim_raise)),
        ("exit", Subr::F01(prim_exit)),
        ("make-parameter", Subr::F12(prim_make_parameter)),
        ("+", Subr::Vararg(prim_plus)),
        ("-", Subr::Vararg(prim_minus)),
        ("*", Subr::Vararg(prim_times)),
        ("/", Subr::Vararg(prim_divide)),
        ("=", Subr::Vararg(prim_numeq)),
        ("<", Subr::Vararg(prim_numlt)),
        ("<=", Subr::Vararg(prim_numle)),
        (">", Subr::Vararg(prim_numgt)),
        (">=", Subr::Vararg(prim_numge)),
        ("cons", Subr::F2(prim_cons)),
        ("car", Subr::F1(prim_car)),
        ("cdr", Subr::F1(prim_cdr)),
        ("null?", Subr::F1(prim_null_p)),
        ("list", Subr::Vararg(prim_list)),
        ("not", Subr::F1(prim_not)),
        ("eq?", Subr::F2(prim_eq)),
        ("eqv?", Subr::F2(prim_eqv)),
        ("equal?", Subr::F2(prim_equal)),
        ("vector-ref", Subr::F2(prim_vector_ref)),
        ("vector-set!", Subr::F3(prim_vector_set)),
        ("string-ref", Subr::F2(prim_string_ref)),
        ("string-set!", Subr::F3(prim_string_set)),
    ];

    let core = engine.core_module().clone();
    for &(name, ref subr) in table {
        let prim = Value::Primitive(Rc::new(Primitive {
            name,
            subr: clone_subr(subr),
        }));
        core.define(Symbol::intern(name), prim.clone());
        engine.prims.insert(name, prim);
    }

    core.define(Symbol::intern("*expander-list*"), Value::Nil);
}

// `Subr` holds only function pointers, but deriving `Clone` would force
// it on `Engine` signatures; a manual copy keeps the table readable.
fn clone_subr(subr: &Subr) -> Subr {
    match subr {
        Subr::F0(f) => Subr::F0(*f),
        Subr::F1(f) => Subr::F1(*f),
        Subr::F2(f) => Subr::F2(*f),
        Subr::F3(f) => Subr::F3(*f),
        Subr::F4(f) => Subr::F4(*f),
        Subr::F5(f) => Subr::F5(*f),
        Subr::F01(f) => Subr::F01(*f),
        Subr::F12(f) => Subr::F12(*f),
        Subr::F23(f) => Subr::F23(*f),
        Subr::Vararg(f) => Subr::Vararg(*f),
        Subr::Apply => Subr::Apply,
    }
}

// === Multiple values ====================================================

fn prim_values(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    if argc == 0 {
        engine.valc = 0;
        return Ok(Value::Void);
    }
    let first = engine.arg(argc, 0)?;
    if argc <= MAX_VALS {
        for i in 1..argc {
            engine.vals[i] = engine.arg(argc, i)?;
        }
    } else {
        // Too many values for the registers: pack everything, including
        // the first value, into a vector.
        let mut all = Vec::with_capacity(argc);
        for i in 0..argc {
            all.push(engine.arg(argc, i)?);
        }
        engine.vals[0] = Value::vector(all);
    }
    engine.valc = argc;
    Ok(first)
}

fn prim_call_with_values(engine: &mut Engine, producer: Value, consumer: Value) -> VmResult<Value> {
    if !producer.is_procedure() {
        return Err(VmError::bad_operand(
            "call-with-values",
            producer.to_string(),
        ));
    }
    if !consumer.is_procedure() {
        return Err(VmError::bad_operand(
            "call-with-values",
            consumer.to_string(),
        ));
    }

    let first = engine.apply(&producer, &[])?;
    let count = engine.valc;
    let args: Vec<Value> = if count == 0 {
        Vec::new()
    } else if count == 1 {
        vec![first]
    } else if count <= MAX_VALS {
        let mut args = Vec::with_capacity(count);
        args.push(first);
        args.extend(engine.vals[1..count].iter().cloned());
        args
    } else {
        match &engine.vals[0] {
            Value::Vector(items) => items.borrow().clone(),
            other => {
                return Err(VmError::corrupted_stack(format!(
                    "packed values register holds {other}"
                )))
            }
        }
    };
    engine.apply(&consumer, &args)
}

// === Reflection =========================================================

fn prim_execute(
    engine: &mut Engine,
    code: Value,
    constants: Value,
    envt: Option<Value>,
) -> VmResult<Value> {
    let words = code_vector_words(&code)?;
    if !matches!(constants, Value::Vector(_)) {
        return Err(VmError::bad_operand("%execute", constants.to_string()));
    }
    engine.execute(CodeChunk::new(words), constants, envt)
}

/// Converts a vector of fixnums into instruction words.
fn code_vector_words(code: &Value) -> VmResult<Vec<u16>> {
    let Value::Vector(items) = code else {
        return Err(VmError::bad_operand("%execute", code.to_string()));
    };
    let items = items.borrow();
    let mut words = Vec::with_capacity(items.len());
    for item in items.iter() {
        match item {
            Value::Fixnum(n) if (0..=u16::MAX as i64).contains(n) => words.push(*n as u16),
            other => {
                return Err(VmError::bad_bytecode(format!(
                    "non-integer {other} in code vector"
                )))
            }
        }
    }
    Ok(words)
}

fn prim_vm_backtrace(engine: &mut Engine) -> VmResult<Value> {
    engine.backtrace()
}

fn prim_dump_code(_engine: &mut Engine, file: Value, code: Value) -> VmResult<Value> {
    let Value::Str(path) = &file else {
        return Err(VmError::bad_operand("%dump-code", file.to_string()));
    };
    let words = code_vector_words(&code)
        .map_err(|_| VmError::bad_operand("%dump-code", code.to_string()))?;
    let path = path.borrow().clone();
    let out = File::create(&path).map_err(|e| VmError::io(format!("{path}: {e}")))?;
    loader::dump_code(&mut BufWriter::new(out), &words)?;
    Ok(Value::Void)
}

// === Continuations ======================================================

fn prim_make_continuation(engine: &mut Engine) -> VmResult<Value> {
    engine.capture_continuation()
}

fn prim_restore_continuation(engine: &mut Engine, cont: Value, value: Value) -> VmResult<Value> {
    Err(engine.restore_continuation(&cont, value))
}

fn prim_continuation_p(_engine: &mut Engine, obj: Value) -> VmResult<Value> {
    Ok(Value::boolean(matches!(obj, Value::Continuation(_))))
}

fn prim_fresh_continuation_p(_engine: &mut Engine, obj: Value) -> VmResult<Value> {
    Ok(Value::boolean(matches!(
        obj,
        Value::Continuation(ref k) if k.is_fresh()
    )))
}

// === Conditions =========================================================

fn prim_raise(engine: &mut Engine, cond: Value) -> VmResult<Value> {
    let control = engine.raise_value(cond)?;
    Err(control)
}

fn prim_exit(_engine: &mut Engine, code: Option<Value>) -> VmResult<Value> {
    let code = match code {
        Some(v) => v.as_fixnum()? as i32,
        None => 0,
    };
    Err(VmError::ExitRequested { code })
}

// === Parameter objects ==================================================

fn prim_make_parameter(engine: &mut Engine, init: Value, converter: Option<Value>) -> VmResult<Value> {
    let converter = converter.unwrap_or(Value::Void);
    let value = if converter.is_procedure() {
        engine.apply(&converter, &[init])?
    } else {
        init
    };
    Ok(Value::Parameter(Rc::new(ParameterObject {
        value: RefCell::new(value),
        converter,
    })))
}

// === Numeric primitives =================================================

fn prim_plus(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    let mut acc = Value::Fixnum(0);
    for i in 0..argc {
        let arg = engine.arg(argc, i)?;
        acc = number::add2(&acc, &arg)?;
    }
    Ok(acc)
}

fn prim_minus(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    if argc == 0 {
        return Err(VmError::arity_at_least("-", 1, 0));
    }
    let first = engine.arg(argc, 0)?;
    if argc == 1 {
        return number::sub2(&Value::Fixnum(0), &first);
    }
    let mut acc = first;
    for i in 1..argc {
        let arg = engine.arg(argc, i)?;
        acc = number::sub2(&acc, &arg)?;
    }
    Ok(acc)
}

fn prim_times(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    let mut acc = Value::Fixnum(1);
    for i in 0..argc {
        let arg = engine.arg(argc, i)?;
        acc = number::mul2(&acc, &arg)?;
    }
    Ok(acc)
}

fn prim_divide(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    if argc == 0 {
        return Err(VmError::arity_at_least("/", 1, 0));
    }
    let first = engine.arg(argc, 0)?;
    if argc == 1 {
        return number::div2(&Value::Fixnum(1), &first);
    }
    let mut acc = first;
    for i in 1..argc {
        let arg = engine.arg(argc, i)?;
        acc = number::div2(&acc, &arg)?;
    }
    Ok(acc)
}

fn fold_compare(
    engine: &mut Engine,
    name: &'static str,
    argc: usize,
    cmp: fn(&Value, &Value) -> VmResult<bool>,
) -> VmResult<Value> {
    if argc == 0 {
        return Err(VmError::arity_at_least(name, 1, 0));
    }
    for i in 1..argc {
        let left = engine.arg(argc, i - 1)?;
        let right = engine.arg(argc, i)?;
        if !cmp(&left, &right)? {
            return Ok(Value::False);
        }
    }
    Ok(Value::True)
}

fn prim_numeq(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    fold_compare(engine, "=", argc, number::numeq2)
}

fn prim_numlt(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    fold_compare(engine, "<", argc, number::numlt2)
}

fn prim_numle(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    fold_compare(engine, "<=", argc, number::numle2)
}

fn prim_numgt(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    fold_compare(engine, ">", argc, number::numgt2)
}

fn prim_numge(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    fold_compare(engine, ">=", argc, number::numge2)
}

// === Pairs, lists and predicates ========================================

fn prim_cons(_engine: &mut Engine, car: Value, cdr: Value) -> VmResult<Value> {
    Ok(Value::cons(car, cdr))
}

fn prim_car(_engine: &mut Engine, pair: Value) -> VmResult<Value> {
    pair.car()
}

fn prim_cdr(_engine: &mut Engine, pair: Value) -> VmResult<Value> {
    pair.cdr()
}

fn prim_null_p(_engine: &mut Engine, obj: Value) -> VmResult<Value> {
    Ok(Value::boolean(matches!(obj, Value::Nil)))
}

fn prim_list(engine: &mut Engine, argc: usize) -> VmResult<Value> {
    let mut items = Vec::with_capacity(argc);
    for i in 0..argc {
        items.push(engine.arg(argc, i)?);
    }
    Ok(Value::list(&items))
}

fn prim_not(_engine: &mut Engine, obj: Value) -> VmResult<Value> {
    Ok(Value::boolean(obj.is_false()))
}

fn prim_eq(_engine: &mut Engine, a: Value, b: Value) -> VmResult<Value> {
    Ok(Value::boolean(eq(&a, &b)))
}

fn prim_eqv(_engine: &mut Engine, a: Value, b: Value) -> VmResult<Value> {
    Ok(Value::boolean(eqv(&a, &b)))
}

fn prim_equal(_engine: &mut Engine, a: Value, b: Value) -> VmResult<Value> {
    Ok(Value::boolean(equal(&a, &b)))
}

// === Vectors and strings ================================================

fn prim_vector_ref(_engine: &mut Engine, vec: Value, index: Value) -> VmResult<Value> {
    inlined::vector_ref(&vec, &index)
}

fn prim_vector_set(_engine: &mut Engine, vec: Value, index: Value, value: Value) -> VmResult<Value> {
    inlined::vector_set(&vec, &index, value)?;
    Ok(Value::Void)
}

fn prim_string_ref(_engine: &mut Engine, s: Value, index: Value) -> VmResult<Value> {
    inlined::string_ref(&s, &index)
}

fn prim_string_set(_engine: &mut Engine, s: Value, index: Value, value: Value) -> VmResult<Value> {
    inlined::string_set(&s, &index, &value)?;
    Ok(Value::Void)
}
