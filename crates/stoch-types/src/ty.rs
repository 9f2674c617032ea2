//! The type lattice.
//!
//! A [`Type`] is the tuple `(base, modifier, proc, set)`. Every legal tuple
//! is registered exactly once in the process-wide [`TypeRegistry`]; a
//! `Type` is a `Copy` handle into it and is compared by identity.
//!
//! Implicit promotion moves up the lattice one step at a time:
//!
//! ```text
//! base:      int → real
//! modifier:  deterministic → phase → random
//! process:   T → proc T
//! sets:      {int} → {real}
//! ```
//!
//! with two restrictions: a phase target never changes the base, and only
//! `int` becomes a phase type from a deterministic one.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::OnceLock;

use crate::value::{normal_cmp, Payload, Sign, Value};

// ══════════════════════════════════════════════════════════════════════════════
// Components
// ══════════════════════════════════════════════════════════════════════════════

/// Base type a registered type derives from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SimpleType {
    Void,
    Bool,
    Int,
    Real,
    String,
    StateSet,
    Model,
}

/// Stochastic modifier. Ordered by promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modifier {
    Deterministic,
    Phase,
    Random,
}

impl Modifier {
    fn steps(self) -> i32 {
        match self {
            Modifier::Deterministic => 0,
            Modifier::Phase => 1,
            Modifier::Random => 2,
        }
    }
}

/// Full identity of a type.
type Identity = (SimpleType, Modifier, bool, bool);

/// Registry entry.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub name: &'static str,
    pub base: SimpleType,
    pub modifier: Modifier,
    pub proc: bool,
    pub set: bool,
    /// Values of this type can be printed.
    pub printable: bool,
    /// User code can declare symbols of this type.
    pub declarable: bool,
}

use Modifier::{Deterministic as Det, Phase, Random};
use SimpleType as S;

/// Registration order fixes the indices behind the `Type` constants.
const BUILTIN: &[(&str, SimpleType, Modifier, bool, bool, bool, bool)] = &[
    ("void", S::Void, Det, false, false, false, false),
    ("bool", S::Bool, Det, false, false, true, true),
    ("rand bool", S::Bool, Random, false, false, true, true),
    ("proc bool", S::Bool, Det, true, false, true, true),
    ("proc rand bool", S::Bool, Random, true, false, true, true),
    ("int", S::Int, Det, false, false, true, true),
    ("ph int", S::Int, Phase, false, false, true, true),
    ("rand int", S::Int, Random, false, false, true, true),
    ("proc int", S::Int, Det, true, false, true, true),
    ("proc rand int", S::Int, Random, true, false, true, true),
    ("real", S::Real, Det, false, false, true, true),
    ("ph real", S::Real, Phase, false, false, true, true),
    ("rand real", S::Real, Random, false, false, true, true),
    ("proc real", S::Real, Det, true, false, true, true),
    ("proc rand real", S::Real, Random, true, false, true, true),
    ("string", S::String, Det, false, false, true, true),
    ("stateset", S::StateSet, Det, false, false, true, true),
    ("model", S::Model, Det, false, false, false, false),
    ("{bool}", S::Bool, Det, false, true, true, true),
    ("{int}", S::Int, Det, false, true, true, true),
    ("{real}", S::Real, Det, false, true, true, true),
    ("{string}", S::String, Det, false, true, true, true),
];

// ══════════════════════════════════════════════════════════════════════════════
// Registry
// ══════════════════════════════════════════════════════════════════════════════

/// Write-once table of every legal type.
#[derive(Debug)]
pub struct TypeRegistry {
    infos: Vec<TypeInfo>,
    by_identity: HashMap<Identity, Type>,
    by_name: HashMap<&'static str, Type>,
}

static REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();

impl TypeRegistry {
    /// The process-wide registry, built on first use.
    pub fn global() -> &'static TypeRegistry {
        REGISTRY.get_or_init(TypeRegistry::build)
    }

    fn build() -> Self {
        let mut reg = Self {
            infos: Vec::with_capacity(BUILTIN.len()),
            by_identity: HashMap::new(),
            by_name: HashMap::new(),
        };
        for &(name, base, modifier, proc, set, printable, declarable) in BUILTIN {
            let ty = Type(reg.infos.len() as u16);
            reg.infos.push(TypeInfo {
                name,
                base,
                modifier,
                proc,
                set,
                printable,
                declarable,
            });
            reg.by_identity.insert((base, modifier, proc, set), ty);
            reg.by_name.insert(name, ty);
        }
        tracing::trace!(types = reg.infos.len(), "type registry initialised");
        reg
    }

    /// Look a type up by its full identity.
    pub fn lookup(&self, base: SimpleType, modifier: Modifier, proc: bool, set: bool) -> Option<Type> {
        self.by_identity.get(&(base, modifier, proc, set)).copied()
    }

    /// Look a type up by its printed name (`"proc rand int"`, `"{real}"`).
    pub fn by_name(&self, name: &str) -> Option<Type> {
        self.by_name.get(name).copied()
    }

    /// Every registered type, in registration order.
    pub fn all(&self) -> impl Iterator<Item = Type> + '_ {
        (0..self.infos.len()).map(|i| Type(i as u16))
    }

    fn info(&self, ty: Type) -> &TypeInfo {
        &self.infos[ty.0 as usize]
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Type
// ══════════════════════════════════════════════════════════════════════════════

/// Handle to a registered type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Type(u16);

impl Type {
    pub const VOID: Type = Type(0);
    pub const BOOL: Type = Type(1);
    pub const RAND_BOOL: Type = Type(2);
    pub const PROC_BOOL: Type = Type(3);
    pub const PROC_RAND_BOOL: Type = Type(4);
    pub const INT: Type = Type(5);
    pub const PH_INT: Type = Type(6);
    pub const RAND_INT: Type = Type(7);
    pub const PROC_INT: Type = Type(8);
    pub const PROC_RAND_INT: Type = Type(9);
    pub const REAL: Type = Type(10);
    pub const PH_REAL: Type = Type(11);
    pub const RAND_REAL: Type = Type(12);
    pub const PROC_REAL: Type = Type(13);
    pub const PROC_RAND_REAL: Type = Type(14);
    pub const STRING: Type = Type(15);
    pub const STATESET: Type = Type(16);
    pub const MODEL: Type = Type(17);
    pub const BOOL_SET: Type = Type(18);
    pub const INT_SET: Type = Type(19);
    pub const REAL_SET: Type = Type(20);
    pub const STRING_SET: Type = Type(21);

    pub fn info(self) -> &'static TypeInfo {
        TypeRegistry::global().info(self)
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn base(self) -> SimpleType {
        self.info().base
    }

    pub fn modifier(self) -> Modifier {
        self.info().modifier
    }

    pub fn is_proc(self) -> bool {
        self.info().proc
    }

    pub fn is_set(self) -> bool {
        self.info().set
    }

    /// The type this one derives from: same base, deterministic, no wrappers.
    pub fn simple(self) -> Type {
        let info = self.info();
        TypeRegistry::global()
            .lookup(info.base, Det, false, false)
            .unwrap_or(self)
    }

    /// Int or real base, not a set.
    pub fn is_numeric(self) -> bool {
        matches!(self.base(), S::Int | S::Real) && !self.is_set()
    }

    pub fn is_deterministic(self) -> bool {
        self.modifier() == Det
    }

    /// The same type with another modifier, if registered.
    pub fn modify(self, modifier: Modifier) -> Option<Type> {
        let info = self.info();
        TypeRegistry::global().lookup(info.base, modifier, info.proc, info.set)
    }

    /// `proc T`, if registered.
    pub fn add_proc(self) -> Option<Type> {
        let info = self.info();
        TypeRegistry::global().lookup(info.base, info.modifier, true, info.set)
    }

    /// `{T}`, if registered.
    pub fn set_of(self) -> Option<Type> {
        let info = self.info();
        if info.set {
            return None;
        }
        TypeRegistry::global().lookup(info.base, info.modifier, info.proc, true)
    }

    /// Element type of a set type.
    pub fn element(self) -> Option<Type> {
        let info = self.info();
        if !info.set {
            return None;
        }
        TypeRegistry::global().lookup(info.base, info.modifier, info.proc, false)
    }

    /// The same type with another base, if registered.
    pub fn with_base(self, base: SimpleType) -> Option<Type> {
        let info = self.info();
        TypeRegistry::global().lookup(base, info.modifier, info.proc, info.set)
    }

    // ── Promotion ─────────────────────────────────────────────────────────

    /// Number of lattice steps from `self` to `target`; negative if impossible.
    pub fn promotion_distance(self, target: Type) -> i32 {
        if self == target {
            return 0;
        }
        component_distance(self.info(), target.info(), false)
    }

    /// True if a value of `self` may be used where `target` is expected.
    pub fn promotes_to(self, target: Type) -> bool {
        self.promotion_distance(target) >= 0
    }

    /// True if `self` can be explicitly cast to `target`.
    ///
    /// Every promotion is a cast; in addition a cast may narrow a real base to int.
    pub fn can_cast(self, target: Type) -> bool {
        self == target || component_distance(self.info(), target.info(), true) >= 0
    }

    /// The smallest type both `self` and `other` promote to.
    pub fn least_common_type(self, other: Type) -> Option<Type> {
        if self == other {
            return Some(self);
        }
        let (a, b) = (self.info(), other.info());
        if a.set != b.set {
            return None;
        }
        let base = base_join(a.base, b.base)?;
        let proc = a.proc || b.proc;
        let reg = TypeRegistry::global();
        [Det, Phase, Random]
            .into_iter()
            .filter(|m| *m >= a.modifier.max(b.modifier))
            .filter_map(|m| reg.lookup(base, m, proc, a.set))
            .find(|t| self.promotes_to(*t) && other.promotes_to(*t))
    }

    // ── Value comparison ─────────────────────────────────────────────────

    /// Equality of two values of this type.
    ///
    /// `Null == Null` and `Unknown == Unknown` hold so that "not yet set"
    /// parameters compare equal to themselves; infinities are equal when the
    /// signs agree; model instances are equal only when identical.
    pub fn equals(self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) | (Value::Unknown, Value::Unknown) => true,
            (Value::Infinity(x), Value::Infinity(y)) => x == y,
            (
                Value::OutOfBounds { owner: o1, bad: b1 },
                Value::OutOfBounds { owner: o2, bad: b2 },
            ) => o1 == o2 && self.equals(b1, b2),
            (Value::Normal(Payload::Object(x)), Value::Normal(Payload::Object(y)))
                if self.base() == S::Model =>
            {
                Rc::ptr_eq(x, y)
            }
            (Value::Normal(_), Value::Normal(_)) => normal_cmp(a, b) == Some(Ordering::Equal),
            _ => false,
        }
    }

    /// Order of two values of this type, `None` when not comparable.
    pub fn compare(self, a: &Value, b: &Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Infinity(x), Value::Infinity(y)) => Some(match (x, y) {
                (Sign::Positive, Sign::Negative) => Ordering::Greater,
                (Sign::Negative, Sign::Positive) => Ordering::Less,
                _ => Ordering::Equal,
            }),
            (Value::Infinity(s), Value::Normal(_)) if self.is_numeric() => Some(match s {
                Sign::Positive => Ordering::Greater,
                Sign::Negative => Ordering::Less,
            }),
            (Value::Normal(_), Value::Infinity(_)) => {
                self.compare(b, a).map(Ordering::reverse)
            }
            (Value::Normal(_), Value::Normal(_)) => normal_cmp(a, b),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({})", self.name())
    }
}

fn base_step(from: SimpleType, to: SimpleType) -> Option<i32> {
    match (from, to) {
        _ if from == to => Some(0),
        (S::Int, S::Real) => Some(1),
        _ => None,
    }
}

fn base_join(a: SimpleType, b: SimpleType) -> Option<SimpleType> {
    if base_step(a, b).is_some() {
        Some(b)
    } else if base_step(b, a).is_some() {
        Some(a)
    } else {
        None
    }
}

/// Sum of per-component steps, or -1. `narrowing` admits real→int (casts only).
fn component_distance(from: &TypeInfo, to: &TypeInfo, narrowing: bool) -> i32 {
    if from.set != to.set {
        return -1;
    }
    let base = match base_step(from.base, to.base) {
        Some(d) => d,
        None if narrowing && from.base == S::Real && to.base == S::Int => 1,
        None => return -1,
    };
    let modifier = to.modifier.steps() - from.modifier.steps();
    if modifier < 0 {
        return -1;
    }
    if to.modifier == Phase && base > 0 {
        return -1;
    }
    if from.modifier == Det && to.modifier == Phase && from.base != S::Int {
        return -1;
    }
    let proc = match (from.proc, to.proc) {
        (true, false) => return -1,
        (false, true) => 1,
        _ => 0,
    };
    base + modifier + proc
}

// ══════════════════════════════════════════════════════════════════════════════
// Aggregates
// ══════════════════════════════════════════════════════════════════════════════

/// Component-wise promotion distance of two aggregate type lists.
///
/// Fails (negative) if the lengths differ or any component fails.
pub fn aggregate_distance(from: &[Type], to: &[Type]) -> i32 {
    if from.len() != to.len() {
        return -1;
    }
    let mut total = 0;
    for (f, t) in from.iter().zip(to.iter()) {
        let d = f.promotion_distance(*t);
        if d < 0 {
            return -1;
        }
        total += d;
    }
    total
}
