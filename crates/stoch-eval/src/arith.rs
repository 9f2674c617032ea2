//! Arithmetic, comparison and logic on [`Value`]s.
//!
//! Special values propagate: `Null` dominates, then `OutOfBounds`, then
//! `Unknown`. Infinities follow the usual extended-real rules; the
//! indeterminate forms (`∞ - ∞`, `0 · ∞`, `∞ / ∞`) are faults.

use std::cmp::Ordering;

use stoch_types::{ErrorCode, Payload, Sign, Type, Value};

use crate::expr::BinaryOp;

/// An arithmetic operation that has no result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fault {
    pub code: ErrorCode,
    pub message: String,
}

impl Fault {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn undefined(what: &str) -> Self {
        Self::new(ErrorCode::UNDEFINED_OPERATION, format!("undefined operation: {what}"))
    }

    fn overflow(op: &str) -> Self {
        Self::new(ErrorCode::OVERFLOW, format!("integer overflow in {op}"))
    }

    fn operands(op: &str, a: &Value, b: &Value) -> Self {
        Self::new(
            ErrorCode::TYPE_MISMATCH,
            format!("cannot apply {op} to {} and {}", a.case_name(), b.case_name()),
        )
    }
}

pub(crate) type ArithResult = Result<Value, Fault>;

/// The special value two operands propagate, if any.
pub(crate) fn propagate(a: &Value, b: &Value) -> Option<Value> {
    for v in [a, b] {
        if v.is_null() {
            return Some(Value::Null);
        }
    }
    for v in [a, b] {
        if v.is_out_of_bounds() {
            return Some(v.clone());
        }
    }
    if a.is_unknown() || b.is_unknown() {
        return Some(Value::Unknown);
    }
    None
}

fn sign_of(v: &Value) -> Option<Sign> {
    match v {
        Value::Infinity(s) => Some(*s),
        Value::Normal(Payload::Int(i)) if *i < 0 => Some(Sign::Negative),
        Value::Normal(Payload::Real(r)) if *r < 0.0 => Some(Sign::Negative),
        _ => Some(Sign::Positive),
    }
}

fn is_zero(v: &Value) -> bool {
    match v {
        Value::Normal(Payload::Int(i)) => *i == 0,
        Value::Normal(Payload::Real(r)) => *r == 0.0,
        _ => false,
    }
}

fn times(a: Sign, b: Sign) -> Sign {
    if a == b {
        Sign::Positive
    } else {
        Sign::Negative
    }
}

pub(crate) fn neg(a: &Value) -> ArithResult {
    match a {
        Value::Normal(Payload::Int(i)) => i.checked_neg().map(Value::int).ok_or_else(|| Fault::overflow("negation")),
        Value::Normal(Payload::Real(r)) => Ok(Value::real(-r)),
        Value::Infinity(s) => Ok(Value::Infinity(s.flip())),
        Value::Normal(_) => Err(Fault::operands("negation", a, a)),
        special => Ok(special.clone()),
    }
}

pub(crate) fn not(a: &Value) -> ArithResult {
    match a {
        Value::Normal(Payload::Bool(b)) => Ok(Value::bool(!b)),
        Value::Normal(_) | Value::Infinity(_) => Err(Fault::operands("!", a, a)),
        special => Ok(special.clone()),
    }
}

pub(crate) fn add(a: &Value, b: &Value) -> ArithResult {
    if let Some(v) = propagate(a, b) {
        return Ok(v);
    }
    match (a, b) {
        (Value::Infinity(x), Value::Infinity(y)) if x != y => Err(Fault::undefined("infinity - infinity")),
        (Value::Infinity(x), _) | (_, Value::Infinity(x)) => Ok(Value::Infinity(*x)),
        (Value::Normal(Payload::Int(x)), Value::Normal(Payload::Int(y))) => {
            x.checked_add(*y).map(Value::int).ok_or_else(|| Fault::overflow("addition"))
        }
        _ => match (a.as_number(), b.as_number()) {
            (Ok(x), Ok(y)) => Ok(Value::real(x + y)),
            _ => Err(Fault::operands("+", a, b)),
        },
    }
}

pub(crate) fn sub(a: &Value, b: &Value) -> ArithResult {
    if let Some(v) = propagate(a, b) {
        return Ok(v);
    }
    if let (Value::Normal(Payload::Int(x)), Value::Normal(Payload::Int(y))) = (a, b) {
        return x.checked_sub(*y).map(Value::int).ok_or_else(|| Fault::overflow("subtraction"));
    }
    add(a, &neg(b)?)
}

pub(crate) fn mul(a: &Value, b: &Value) -> ArithResult {
    if let Some(v) = propagate(a, b) {
        return Ok(v);
    }
    match (a, b) {
        (Value::Infinity(_), other) | (other, Value::Infinity(_)) => {
            if is_zero(other) {
                return Err(Fault::undefined("zero times infinity"));
            }
            if !other.is_infinity() && other.as_number().is_err() {
                return Err(Fault::operands("*", a, b));
            }
            match (sign_of(a), sign_of(b)) {
                (Some(x), Some(y)) => Ok(Value::Infinity(times(x, y))),
                _ => Err(Fault::operands("*", a, b)),
            }
        }
        (Value::Normal(Payload::Int(x)), Value::Normal(Payload::Int(y))) => {
            x.checked_mul(*y).map(Value::int).ok_or_else(|| Fault::overflow("multiplication"))
        }
        _ => match (a.as_number(), b.as_number()) {
            (Ok(x), Ok(y)) => Ok(Value::real(x * y)),
            _ => Err(Fault::operands("*", a, b)),
        },
    }
}

/// Real division.
pub(crate) fn div(a: &Value, b: &Value) -> ArithResult {
    if let Some(v) = propagate(a, b) {
        return Ok(v);
    }
    if is_zero(b) {
        return Err(Fault::new(ErrorCode::DIVISION_BY_ZERO, "division by zero"));
    }
    match (a, b) {
        (Value::Infinity(_), Value::Infinity(_)) => Err(Fault::undefined("infinity / infinity")),
        (Value::Infinity(_), _) => match (sign_of(a), sign_of(b)) {
            (Some(x), Some(y)) => Ok(Value::Infinity(times(x, y))),
            _ => Err(Fault::operands("/", a, b)),
        },
        (_, Value::Infinity(_)) => Ok(Value::real(0.0)),
        _ => match (a.as_number(), b.as_number()) {
            (Ok(x), Ok(y)) => Ok(Value::real(x / y)),
            _ => Err(Fault::operands("/", a, b)),
        },
    }
}

pub(crate) fn rem(a: &Value, b: &Value) -> ArithResult {
    if let Some(v) = propagate(a, b) {
        return Ok(v);
    }
    match (a, b) {
        (Value::Normal(Payload::Int(_)), Value::Normal(Payload::Int(0))) => {
            Err(Fault::new(ErrorCode::DIVISION_BY_ZERO, "modulo by zero"))
        }
        (Value::Normal(Payload::Int(x)), Value::Normal(Payload::Int(y))) => {
            x.checked_rem(*y).map(Value::int).ok_or_else(|| Fault::overflow("modulo"))
        }
        (Value::Infinity(_), _) | (_, Value::Infinity(_)) => Err(Fault::undefined("modulo with infinity")),
        _ => Err(Fault::operands("%", a, b)),
    }
}

/// Comparison of two values of type `ty`.
pub(crate) fn compare(op: BinaryOp, ty: Type, a: &Value, b: &Value) -> ArithResult {
    if let Some(v) = propagate(a, b) {
        return Ok(v);
    }
    let result = match op {
        BinaryOp::Eq => ty.equals(a, b),
        BinaryOp::Ne => !ty.equals(a, b),
        _ => {
            let Some(ord) = ty.compare(a, b) else {
                return Err(Fault::operands(op.symbol(), a, b));
            };
            match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::Ge => ord != Ordering::Less,
                _ => return Err(Fault::operands(op.symbol(), a, b)),
            }
        }
    };
    Ok(Value::bool(result))
}

/// Dispatch a non-logical binary operator.
pub(crate) fn apply(op: BinaryOp, ty: Type, a: &Value, b: &Value) -> ArithResult {
    match op {
        BinaryOp::Add => add(a, b),
        BinaryOp::Sub => sub(a, b),
        BinaryOp::Mul => mul(a, b),
        BinaryOp::Div => div(a, b),
        BinaryOp::Mod => rem(a, b),
        BinaryOp::And | BinaryOp::Or => Err(Fault::operands(op.symbol(), a, b)),
        _ => compare(op, ty, a, b),
    }
}

/// Smaller of two numeric values, treating anything incomparable as unknown.
pub(crate) fn min(a: &Value, b: &Value) -> Value {
    match Type::REAL.compare(a, b) {
        Some(Ordering::Greater) => b.clone(),
        Some(_) => a.clone(),
        None => Value::Unknown,
    }
}

pub(crate) fn max(a: &Value, b: &Value) -> Value {
    match Type::REAL.compare(a, b) {
        Some(Ordering::Less) => b.clone(),
        Some(_) => a.clone(),
        None => Value::Unknown,
    }
}

/// Conversion of a value to the base of `target`: int↔real, real→int truncates.
pub(crate) fn convert(value: Value, target: Type) -> ArithResult {
    use stoch_types::SimpleType;
    match (&value, target.base()) {
        (Value::Normal(Payload::Int(i)), SimpleType::Real) => Ok(Value::real(*i as f64)),
        (Value::Normal(Payload::Real(r)), SimpleType::Int) => {
            let t = r.trunc();
            if t.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64 {
                Ok(Value::int(t as i64))
            } else {
                Err(Fault::overflow("conversion to int"))
            }
        }
        _ => Ok(value),
    }
}
