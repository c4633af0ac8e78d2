//! Arithmetic operators for `Op::BinaryOp`.
//!
//! Failures are script exceptions (`TypeError`, `ZeroDivisionError`) so that
//! exceptional jumps can catch them.

use crate::bytecode::BinOp;
use crate::exception::{ExcType, Exception};
use crate::value::Value;

/// Apply a binary operator to two values.
pub fn apply_binop(op: BinOp, left: &Value, right: &Value) -> Result<Value, Exception> {
    match op {
        BinOp::Add => match (left, right) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut result = a.clone();
                result.extend(b.iter().cloned());
                Ok(Value::List(result))
            }
            _ => numeric_binop(op, left, right, i64::checked_add, |a, b| a + b),
        },
        BinOp::Sub => numeric_binop(op, left, right, i64::checked_sub, |a, b| a - b),
        BinOp::Mult => numeric_binop(op, left, right, i64::checked_mul, |a, b| a * b),
        BinOp::FloorDiv => {
            check_divisor(right)?;
            numeric_binop(op, left, right, floor_div, |a, b| (a / b).floor())
        }
        BinOp::Mod => {
            check_divisor(right)?;
            numeric_binop(op, left, right, floor_mod, |a, b| a - b * (a / b).floor())
        }
    }
}

fn numeric_binop(
    op: BinOp,
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, Exception> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b).map(Value::Int).ok_or_else(|| {
            Exception::raised(ExcType::ValueError, format!("integer overflow in {:?}", op))
        }),
        _ => match (left.as_float(), right.as_float()) {
            (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
            _ => Err(Exception::raised(
                ExcType::TypeError,
                format!(
                    "unsupported operand type(s) for {}: '{}' and '{}'",
                    symbol(op),
                    left.type_name(),
                    right.type_name()
                ),
            )),
        },
    }
}

/// Integer division rounding toward negative infinity.
fn floor_div(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

/// Remainder taking the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> Option<i64> {
    // `i64::MIN % -1` overflows in Rust but is exactly 0.
    if b == -1 {
        return Some(0);
    }
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn check_divisor(right: &Value) -> Result<(), Exception> {
    if right.as_float() == Some(0.0) {
        return Err(Exception::raised(
            ExcType::ZeroDivisionError,
            "division by zero",
        ));
    }
    Ok(())
}

fn symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mult => "*",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_and_float_arithmetic() {
        assert_eq!(
            apply_binop(BinOp::Add, &Value::Int(2), &Value::Int(3)).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            apply_binop(BinOp::Mult, &Value::Int(2), &Value::Float(1.5)).unwrap(),
            Value::Float(3.0)
        );
        assert_eq!(
            apply_binop(BinOp::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap(),
            Value::Int(-4)
        );
        assert_eq!(
            apply_binop(BinOp::Mod, &Value::Int(-7), &Value::Int(2)).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            apply_binop(BinOp::FloorDiv, &Value::Int(7), &Value::Int(-2)).unwrap(),
            Value::Int(-4)
        );
        assert_eq!(
            apply_binop(BinOp::Mod, &Value::Int(7), &Value::Int(-2)).unwrap(),
            Value::Int(-1)
        );
    }

    #[test]
    fn test_modulo_by_minus_one_never_overflows() {
        assert_eq!(
            apply_binop(BinOp::Mod, &Value::Int(i64::MIN), &Value::Int(-1)).unwrap(),
            Value::Int(0)
        );
        assert_eq!(
            apply_binop(BinOp::Mod, &Value::Int(7), &Value::Int(-1)).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn test_concatenation() {
        assert_eq!(
            apply_binop(BinOp::Add, &Value::from("ab"), &Value::from("cd")).unwrap(),
            Value::from("abcd")
        );
    }

    #[test]
    fn test_division_by_zero_raises() {
        let err = apply_binop(BinOp::FloorDiv, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind(), ExcType::ZeroDivisionError);
        let err = apply_binop(BinOp::Mod, &Value::Float(1.0), &Value::Float(0.0)).unwrap_err();
        assert_eq!(err.kind(), ExcType::ZeroDivisionError);
    }

    #[test]
    fn test_mismatched_types_raise_type_error() {
        let err = apply_binop(BinOp::Sub, &Value::from("a"), &Value::Int(1)).unwrap_err();
        assert_eq!(err.kind(), ExcType::TypeError);
        assert_eq!(
            err.message(),
            "unsupported operand type(s) for -: 'str' and 'int'"
        );
    }
}
