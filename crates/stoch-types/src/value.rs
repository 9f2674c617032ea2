//! Runtime values produced by evaluating expressions.
//!
//! [`Value`] is deliberately not `PartialEq`/`PartialOrd`: whether two values
//! are equal depends on the type that produced them (two string objects are
//! equal by content, `Null` equals `Null` only for bookkeeping purposes, ...).
//! Use [`crate::Type::equals`] and [`crate::Type::compare`].

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

// ══════════════════════════════════════════════════════════════════════════════
// Shared objects
// ══════════════════════════════════════════════════════════════════════════════

/// A reference-counted payload that only its producing type knows how to compare.
pub trait SharedObject: fmt::Debug + fmt::Display {
    /// Short kind name used in messages ("string", "set", "model", ...).
    fn kind(&self) -> &'static str;

    /// Semantic equality with another object.
    fn equals(&self, other: &dyn SharedObject) -> bool;

    /// Semantic order, if the two objects are comparable.
    fn compare(&self, _other: &dyn SharedObject) -> Option<Ordering> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// String payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringObject(pub String);

impl fmt::Display for StringObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl SharedObject for StringObject {
    fn kind(&self) -> &'static str {
        "string"
    }

    fn equals(&self, other: &dyn SharedObject) -> bool {
        other
            .as_any()
            .downcast_ref::<StringObject>()
            .is_some_and(|o| o.0 == self.0)
    }

    fn compare(&self, other: &dyn SharedObject) -> Option<Ordering> {
        let o = other.as_any().downcast_ref::<StringObject>()?;
        Some(self.0.cmp(&o.0))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A finite set of normal values, kept sorted and free of duplicates.
#[derive(Debug, Clone)]
pub struct SetObject {
    elems: Vec<Value>,
}

impl SetObject {
    /// Build a set from arbitrary values.
    ///
    /// Returns `None` if any element is not a normal value or two elements
    /// cannot be ordered against each other.
    pub fn new(values: impl IntoIterator<Item = Value>) -> Option<Self> {
        let mut elems: Vec<Value> = values.into_iter().collect();
        if elems.iter().any(|v| !v.is_normal()) {
            return None;
        }
        for pair in elems.windows(2) {
            normal_cmp(&pair[0], &pair[1])?;
        }
        elems.sort_by(|a, b| normal_cmp(a, b).unwrap_or(Ordering::Equal));
        elems.dedup_by(|a, b| normal_cmp(a, b) == Some(Ordering::Equal));
        Some(Self { elems })
    }

    /// The integer range `lo..=hi` as a set.
    pub fn int_range(lo: i64, hi: i64) -> Self {
        Self {
            elems: (lo..=hi).map(Value::int).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.elems.iter()
    }

    /// Position of `value` in the sorted element list.
    pub fn index_of(&self, value: &Value) -> Option<usize> {
        self.elems
            .binary_search_by(|e| normal_cmp(e, value).unwrap_or(Ordering::Less))
            .ok()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.index_of(value).is_some()
    }
}

impl fmt::Display for SetObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, e) in self.elems.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, "}}")
    }
}

impl SharedObject for SetObject {
    fn kind(&self) -> &'static str {
        "set"
    }

    fn equals(&self, other: &dyn SharedObject) -> bool {
        let Some(o) = other.as_any().downcast_ref::<SetObject>() else {
            return false;
        };
        self.elems.len() == o.elems.len()
            && self
                .elems
                .iter()
                .zip(o.elems.iter())
                .all(|(a, b)| normal_cmp(a, b) == Some(Ordering::Equal))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Value
// ══════════════════════════════════════════════════════════════════════════════

/// Sign of an infinite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Positive,
    Negative,
}

impl Sign {
    pub fn flip(self) -> Self {
        match self {
            Sign::Positive => Sign::Negative,
            Sign::Negative => Sign::Positive,
        }
    }
}

/// Payload of a normal value.
#[derive(Debug, Clone)]
pub enum Payload {
    Bool(bool),
    Int(i64),
    Real(f64),
    Object(Rc<dyn SharedObject>),
}

/// Kind tag of a [`Payload`], without the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Bool,
    Int,
    Real,
    Object,
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Bool(_) => PayloadKind::Bool,
            Payload::Int(_) => PayloadKind::Int,
            Payload::Real(_) => PayloadKind::Real,
            Payload::Object(_) => PayloadKind::Object,
        }
    }
}

/// The result of evaluating an expression.
#[derive(Debug, Clone)]
pub enum Value {
    Normal(Payload),
    Infinity(Sign),
    /// Undefined: uninitialized, or the result of an error.
    Null,
    /// Defined but not (yet) known, e.g. a value depending on an unfinished solve.
    Unknown,
    /// `bad` was rejected by `owner` (a state variable, array, ...) as out of range.
    OutOfBounds { owner: String, bad: Box<Value> },
}

/// Reading a payload through the wrong accessor.
///
/// This is a programming error in the caller, reported rather than papered
/// over with a default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot read {expected} payload from {found} value")]
pub struct AccessError {
    pub expected: &'static str,
    pub found: String,
}

impl Value {
    pub fn bool(b: bool) -> Self {
        Value::Normal(Payload::Bool(b))
    }

    pub fn int(i: i64) -> Self {
        Value::Normal(Payload::Int(i))
    }

    pub fn real(r: f64) -> Self {
        Value::Normal(Payload::Real(r))
    }

    pub fn object(obj: Rc<dyn SharedObject>) -> Self {
        Value::Normal(Payload::Object(obj))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::object(Rc::new(StringObject(s.into())))
    }

    pub fn set(set: SetObject) -> Self {
        Value::object(Rc::new(set))
    }

    pub fn infinity(sign: Sign) -> Self {
        Value::Infinity(sign)
    }

    pub fn out_of_bounds(owner: impl Into<String>, bad: Value) -> Self {
        Value::OutOfBounds {
            owner: owner.into(),
            bad: Box::new(bad),
        }
    }

    // ── Case predicates ──

    pub fn is_normal(&self) -> bool {
        matches!(self, Value::Normal(_))
    }

    pub fn is_infinity(&self) -> bool {
        matches!(self, Value::Infinity(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Unknown)
    }

    pub fn is_out_of_bounds(&self) -> bool {
        matches!(self, Value::OutOfBounds { .. })
    }

    // ── Checked accessors ──

    pub fn as_bool(&self) -> Result<bool, AccessError> {
        match self {
            Value::Normal(Payload::Bool(b)) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_int(&self) -> Result<i64, AccessError> {
        match self {
            Value::Normal(Payload::Int(i)) => Ok(*i),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn as_real(&self) -> Result<f64, AccessError> {
        match self {
            Value::Normal(Payload::Real(r)) => Ok(*r),
            other => Err(other.mismatch("real")),
        }
    }

    /// Int or real payload widened to `f64`.
    pub fn as_number(&self) -> Result<f64, AccessError> {
        match self {
            Value::Normal(Payload::Int(i)) => Ok(*i as f64),
            Value::Normal(Payload::Real(r)) => Ok(*r),
            other => Err(other.mismatch("numeric")),
        }
    }

    pub fn as_object(&self) -> Result<&Rc<dyn SharedObject>, AccessError> {
        match self {
            Value::Normal(Payload::Object(o)) => Ok(o),
            other => Err(other.mismatch("object")),
        }
    }

    pub fn as_str(&self) -> Result<&str, AccessError> {
        self.as_object()?
            .as_any()
            .downcast_ref::<StringObject>()
            .map(|s| s.0.as_str())
            .ok_or_else(|| self.mismatch("string"))
    }

    pub fn as_set(&self) -> Result<&SetObject, AccessError> {
        self.as_object()?
            .as_any()
            .downcast_ref::<SetObject>()
            .ok_or_else(|| self.mismatch("set"))
    }

    /// Name of the active case, for messages.
    pub fn case_name(&self) -> String {
        match self {
            Value::Normal(Payload::Bool(_)) => "bool".into(),
            Value::Normal(Payload::Int(_)) => "int".into(),
            Value::Normal(Payload::Real(_)) => "real".into(),
            Value::Normal(Payload::Object(o)) => o.kind().into(),
            Value::Infinity(_) => "infinity".into(),
            Value::Null => "null".into(),
            Value::Unknown => "unknown".into(),
            Value::OutOfBounds { .. } => "out-of-bounds".into(),
        }
    }

    fn mismatch(&self, expected: &'static str) -> AccessError {
        AccessError {
            expected,
            found: self.case_name(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int(i)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::real(r)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Normal(Payload::Bool(b)) => write!(f, "{b}"),
            Value::Normal(Payload::Int(i)) => write!(f, "{i}"),
            Value::Normal(Payload::Real(r)) => write!(f, "{r}"),
            Value::Normal(Payload::Object(o)) => write!(f, "{o}"),
            Value::Infinity(Sign::Positive) => write!(f, "infinity"),
            Value::Infinity(Sign::Negative) => write!(f, "-infinity"),
            Value::Null => write!(f, "null"),
            Value::Unknown => write!(f, "?"),
            Value::OutOfBounds { owner, bad } => write!(f, "{bad} (out of bounds for {owner})"),
        }
    }
}

/// Order two normal values of compatible payloads.
///
/// Int and real compare numerically; objects delegate to [`SharedObject::compare`].
pub(crate) fn normal_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Normal(Payload::Bool(x)), Value::Normal(Payload::Bool(y))) => Some(x.cmp(y)),
        (Value::Normal(Payload::Int(x)), Value::Normal(Payload::Int(y))) => Some(x.cmp(y)),
        (Value::Normal(Payload::Object(x)), Value::Normal(Payload::Object(y))) => {
            if x.equals(y.as_ref()) {
                Some(Ordering::Equal)
            } else {
                x.compare(y.as_ref())
            }
        }
        (Value::Normal(_), Value::Normal(_)) => {
            let x = a.as_number().ok()?;
            let y = b.as_number().ok()?;
            x.partial_cmp(&y)
        }
        _ => None,
    }
}
