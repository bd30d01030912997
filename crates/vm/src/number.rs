//! Numeric operations for the Skein Virtual Machine.
//!
//! Exact integers are `i64` fixnums that promote to heap bignums on
//! overflow; inexact reals are `f64` flonums with the usual contagion
//! rule. These functions back both the inlined opcodes and the named
//! arithmetic primitives, so their error behavior is shared.

use std::cmp::Ordering;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// Normalizes a bignum back into a fixnum when it fits.
pub fn normalize(n: BigInt) -> Value {
    match n.to_i64() {
        Some(small) => Value::Fixnum(small),
        None => Value::Bignum(Rc::new(n)),
    }
}

fn bad_number(op: &'static str, v: &Value) -> VmError {
    VmError::bad_operand(op, v.to_string())
}

enum Num {
    Exact(BigInt),
    Inexact(f64),
}

fn numeric(op: &'static str, v: &Value) -> VmResult<Num> {
    match v {
        Value::Fixnum(n) => Ok(Num::Exact(BigInt::from(*n))),
        Value::Bignum(n) => Ok(Num::Exact((**n).clone())),
        Value::Flonum(x) => Ok(Num::Inexact(*x)),
        other => Err(bad_number(op, other)),
    }
}

fn big_to_f64(n: &BigInt) -> f64 {
    n.to_f64().unwrap_or(if n.is_negative() {
        f64::NEG_INFINITY
    } else {
        f64::INFINITY
    })
}

/// Adds two numbers.
pub fn add2(a: &Value, b: &Value) -> VmResult<Value> {
    if let (Value::Fixnum(x), Value::Fixnum(y)) = (a, b) {
        return Ok(match x.checked_add(*y) {
            Some(n) => Value::Fixnum(n),
            None => normalize(BigInt::from(*x) + BigInt::from(*y)),
        });
    }
    match (numeric("+", a)?, numeric("+", b)?) {
        (Num::Exact(x), Num::Exact(y)) => Ok(normalize(x + y)),
        (Num::Exact(x), Num::Inexact(y)) => Ok(Value::Flonum(big_to_f64(&x) + y)),
        (Num::Inexact(x), Num::Exact(y)) => Ok(Value::Flonum(x + big_to_f64(&y))),
        (Num::Inexact(x), Num::Inexact(y)) => Ok(Value::Flonum(x + y)),
    }
}

/// Subtracts `b` from `a`.
pub fn sub2(a: &Value, b: &Value) -> VmResult<Value> {
    if let (Value::Fixnum(x), Value::Fixnum(y)) = (a, b) {
        return Ok(match x.checked_sub(*y) {
            Some(n) => Value::Fixnum(n),
            None => normalize(BigInt::from(*x) - BigInt::from(*y)),
        });
    }
    match (numeric("-", a)?, numeric("-", b)?) {
        (Num::Exact(x), Num::Exact(y)) => Ok(normalize(x - y)),
        (Num::Exact(x), Num::Inexact(y)) => Ok(Value::Flonum(big_to_f64(&x) - y)),
        (Num::Inexact(x), Num::Exact(y)) => Ok(Value::Flonum(x - big_to_f64(&y))),
        (Num::Inexact(x), Num::Inexact(y)) => Ok(Value::Flonum(x - y)),
    }
}

/// Multiplies two numbers.
pub fn mul2(a: &Value, b: &Value) -> VmResult<Value> {
    if let (Value::Fixnum(x), Value::Fixnum(y)) = (a, b) {
        return Ok(match x.checked_mul(*y) {
            Some(n) => Value::Fixnum(n),
            None => normalize(BigInt::from(*x) * BigInt::from(*y)),
        });
    }
    match (numeric("*", a)?, numeric("*", b)?) {
        (Num::Exact(x), Num::Exact(y)) => Ok(normalize(x * y)),
        (Num::Exact(x), Num::Inexact(y)) => Ok(Value::Flonum(big_to_f64(&x) * y)),
        (Num::Inexact(x), Num::Exact(y)) => Ok(Value::Flonum(x * big_to_f64(&y))),
        (Num::Inexact(x), Num::Inexact(y)) => Ok(Value::Flonum(x * y)),
    }
}

/// Divides `a` by `b`. An exact division that does not come out even
/// produces a flonum; the full rational tower lives outside the VM core.
pub fn div2(a: &Value, b: &Value) -> VmResult<Value> {
    match (numeric("/", a)?, numeric("/", b)?) {
        (Num::Exact(x), Num::Exact(y)) => {
            if y.is_zero() {
                return Err(VmError::DivisionByZero {
                    primitive: "/".into(),
                });
            }
            if (&x % &y).is_zero() {
                Ok(normalize(x / y))
            } else {
                Ok(Value::Flonum(big_to_f64(&x) / big_to_f64(&y)))
            }
        }
        (Num::Exact(x), Num::Inexact(y)) => Ok(Value::Flonum(big_to_f64(&x) / y)),
        (Num::Inexact(x), Num::Exact(y)) => Ok(Value::Flonum(x / big_to_f64(&y))),
        (Num::Inexact(x), Num::Inexact(y)) => Ok(Value::Flonum(x / y)),
    }
}

fn compare(op: &'static str, a: &Value, b: &Value) -> VmResult<Ordering> {
    if let (Value::Fixnum(x), Value::Fixnum(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    let ord = match (numeric(op, a)?, numeric(op, b)?) {
        (Num::Exact(x), Num::Exact(y)) => x.cmp(&y),
        (Num::Exact(x), Num::Inexact(y)) => big_to_f64(&x)
            .partial_cmp(&y)
            .ok_or_else(|| bad_number(op, b))?,
        (Num::Inexact(x), Num::Exact(y)) => x
            .partial_cmp(&big_to_f64(&y))
            .ok_or_else(|| bad_number(op, a))?,
        (Num::Inexact(x), Num::Inexact(y)) => x
            .partial_cmp(&y)
            .ok_or_else(|| bad_number(op, if x.is_nan() { a } else { b }))?,
    };
    Ok(ord)
}

/// Numeric `=`.
pub fn numeq2(a: &Value, b: &Value) -> VmResult<bool> {
    Ok(compare("=", a, b)? == Ordering::Equal)
}

/// Numeric `<`.
pub fn numlt2(a: &Value, b: &Value) -> VmResult<bool> {
    Ok(compare("<", a, b)? == Ordering::Less)
}

/// Numeric `<=`.
pub fn numle2(a: &Value, b: &Value) -> VmResult<bool> {
    Ok(compare("<=", a, b)? != Ordering::Greater)
}

/// Numeric `>`.
pub fn numgt2(a: &Value, b: &Value) -> VmResult<bool> {
    Ok(compare(">", a, b)? == Ordering::Greater)
}

/// Numeric `>=`.
pub fn numge2(a: &Value, b: &Value) -> VmResult<bool> {
    Ok(compare(">=", a, b)? != Ordering::Less)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixnum_arithmetic() {
        let v = add2(&Value::Fixnum(3), &Value::Fixnum(4)).unwrap();
        assert_eq!(v.as_fixnum().unwrap(), 7);
        let v = sub2(&Value::Fixnum(3), &Value::Fixnum(4)).unwrap();
        assert_eq!(v.as_fixnum().unwrap(), -1);
        let v = mul2(&Value::Fixnum(6), &Value::Fixnum(7)).unwrap();
        assert_eq!(v.as_fixnum().unwrap(), 42);
    }

    #[test]
    fn test_overflow_promotes_to_bignum() {
        let v = add2(&Value::Fixnum(i64::MAX), &Value::Fixnum(1)).unwrap();
        match &v {
            Value::Bignum(n) => assert_eq!(**n, BigInt::from(i64::MAX) + 1),
            other => panic!("expected bignum, got {other}"),
        }
        // And the reverse direction normalizes back down.
        let back = sub2(&v, &Value::Fixnum(1)).unwrap();
        assert_eq!(back.as_fixnum().unwrap(), i64::MAX);
    }

    #[test]
    fn test_division() {
        assert_eq!(
            div2(&Value::Fixnum(12), &Value::Fixnum(4))
                .unwrap()
                .as_fixnum()
                .unwrap(),
            3
        );
        match div2(&Value::Fixnum(1), &Value::Fixnum(2)).unwrap() {
            Value::Flonum(x) => assert_eq!(x, 0.5),
            other => panic!("expected flonum, got {other}"),
        }
        assert!(matches!(
            div2(&Value::Fixnum(1), &Value::Fixnum(0)),
            Err(VmError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn test_flonum_contagion() {
        match add2(&Value::Fixnum(1), &Value::Flonum(0.5)).unwrap() {
            Value::Flonum(x) => assert_eq!(x, 1.5),
            other => panic!("expected flonum, got {other}"),
        }
    }

    #[test]
    fn test_comparisons() {
        assert!(numeq2(&Value::Fixnum(4), &Value::Flonum(4.0)).unwrap());
        assert!(numlt2(&Value::Fixnum(3), &Value::Fixnum(4)).unwrap());
        assert!(numge2(&Value::Fixnum(4), &Value::Fixnum(4)).unwrap());
        assert!(!numgt2(&Value::Fixnum(4), &Value::Fixnum(4)).unwrap());
    }

    #[test]
    fn test_type_errors_name_the_operation() {
        let err = add2(&Value::string("x"), &Value::Fixnum(1)).unwrap_err();
        assert!(matches!(err, VmError::BadOperandType { primitive, .. } if primitive == "+"));
    }
}
