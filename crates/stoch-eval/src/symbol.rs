//! Symbols: named, stateful leaves of the expression tree.
//!
//! A symbol moves monotonically through [`SymbolState`]. Constants and
//! measures may be defined in terms of symbols that are not defined yet; the
//! definition then registers on each missing dependency's wait-list and the
//! symbol stays `Blocked` until every dependency has notified it.
//!
//! Wait-list edges point from a dependency to its waiters and are held as
//! `Weak` references. Registration refuses any edge that would close a
//! cycle, so the wait-list graph is always acyclic.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

use stoch_types::{ErrorCode, Location, SetObject, Type, Value};

use crate::array::{cell_label, ArrayData};
use crate::converge::ConvergeCell;
use crate::ctx::{Context, Op};
use crate::error::{EvalError, EvalResult};
use crate::expr::{next_id, Expr, NodeId};
use crate::internal_error;

/// Lifecycle of a symbol. Ordered; transitions only move up, except into
/// the two construction-error states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum SymbolState {
    /// Definition rejected (cycle, failed construction).
    ConstructionError = -2,
    /// Definition evaluated to nothing usable.
    ConstructionNull = -1,
    Declared = 0,
    /// Converge variable seeded by a guess.
    Guessed = 1,
    Defined = 2,
    /// Defined, but waiting on undefined dependencies.
    Blocked = 3,
    Ready = 4,
    Computed = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Constant,
    /// A constant declared inside a model.
    Measure,
    /// A model parameter.
    Formal,
    /// Loop variable over a finite `{int}` set.
    Iterator,
    /// Variable solved by a converge block.
    Converge,
    Array,
}

enum Slot {
    Defined {
        def: RefCell<Option<Expr>>,
        memo: RefCell<Option<Value>>,
    },
    Formal(RefCell<Value>),
    Iterator {
        domain: SetObject,
        current: RefCell<Value>,
    },
    Converge(RefCell<ConvergeCell>),
    Array(ArrayData),
}

pub struct SymbolNode {
    id: NodeId,
    name: String,
    ty: Type,
    location: Location,
    kind: SymbolKind,
    slot: Slot,
    state: Cell<SymbolState>,
    waiters: RefCell<Vec<Weak<SymbolNode>>>,
    /// Names of the dependencies this symbol still waits on.
    pending: RefCell<Vec<String>>,
}

/// Shared handle to a symbol.
#[derive(Clone)]
pub struct Symbol(Rc<SymbolNode>);

impl Symbol {
    fn build(name: impl Into<String>, ty: Type, location: Location, kind: SymbolKind, slot: Slot, state: SymbolState) -> Self {
        Self(Rc::new(SymbolNode {
            id: next_id(),
            name: name.into(),
            ty,
            location,
            kind,
            slot,
            state: Cell::new(state),
            waiters: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
        }))
    }

    fn defined_slot() -> Slot {
        Slot::Defined {
            def: RefCell::new(None),
            memo: RefCell::new(None),
        }
    }

    pub fn constant(name: impl Into<String>, ty: Type, location: Location) -> Self {
        Self::build(name, ty, location, SymbolKind::Constant, Self::defined_slot(), SymbolState::Declared)
    }

    pub fn measure(name: impl Into<String>, ty: Type, location: Location) -> Self {
        Self::build(name, ty, location, SymbolKind::Measure, Self::defined_slot(), SymbolState::Declared)
    }

    /// Model parameter, `Null` until bound.
    pub fn formal(name: impl Into<String>, ty: Type, location: Location) -> Self {
        Self::build(
            name,
            ty,
            location,
            SymbolKind::Formal,
            Slot::Formal(RefCell::new(Value::Null)),
            SymbolState::Ready,
        )
    }

    pub fn iterator(name: impl Into<String>, domain: SetObject, location: Location) -> Self {
        Self::build(
            name,
            Type::INT,
            location,
            SymbolKind::Iterator,
            Slot::Iterator {
                domain,
                current: RefCell::new(Value::Null),
            },
            SymbolState::Ready,
        )
    }

    pub fn converge(name: impl Into<String>, ty: Type, location: Location) -> Self {
        Self::build(
            name,
            ty,
            location,
            SymbolKind::Converge,
            Slot::Converge(RefCell::new(ConvergeCell::default())),
            SymbolState::Declared,
        )
    }

    /// Array with one dimension per iterator.
    pub fn array(name: impl Into<String>, ty: Type, location: Location, iterators: &[Symbol]) -> EvalResult<Self> {
        Self::new_array(name, ty, location, iterators, false)
    }

    /// Array whose cells are converge variables.
    pub fn converge_array(
        name: impl Into<String>,
        ty: Type,
        location: Location,
        iterators: &[Symbol],
    ) -> EvalResult<Self> {
        Self::new_array(name, ty, location, iterators, true)
    }

    fn new_array(
        name: impl Into<String>,
        ty: Type,
        location: Location,
        iterators: &[Symbol],
        converge: bool,
    ) -> EvalResult<Self> {
        let name = name.into();
        let mut names = Vec::with_capacity(iterators.len());
        let mut domains = Vec::with_capacity(iterators.len());
        for i in iterators {
            let Some(domain) = i.domain() else {
                return Err(EvalError::NotAnIterator {
                    array: name,
                    symbol: i.name().to_string(),
                });
            };
            names.push(i.name().to_string());
            domains.push(domain.clone());
        }
        Ok(Self::build(
            name,
            ty,
            location,
            SymbolKind::Array,
            Slot::Array(ArrayData::new(names, domains, converge)),
            SymbolState::Ready,
        ))
    }

    // ── Accessors ──

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn ty(&self) -> Type {
        self.0.ty
    }

    pub fn location(&self) -> &Location {
        &self.0.location
    }

    pub fn kind(&self) -> SymbolKind {
        self.0.kind
    }

    pub fn state(&self) -> SymbolState {
        self.0.state.get()
    }

    pub fn ptr_eq(&self, other: &Symbol) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Other symbols may depend on this one without waiting.
    pub fn is_available(&self) -> bool {
        matches!(self.state(), SymbolState::Ready | SymbolState::Computed)
    }

    /// Scalar converge variable or converge array.
    pub fn is_converge(&self) -> bool {
        match &self.0.slot {
            Slot::Converge(_) => true,
            Slot::Array(a) => a.converge,
            _ => false,
        }
    }

    /// Number of dimensions of an array; `None` for other symbols.
    pub fn dimensions(&self) -> Option<usize> {
        self.array_data().map(ArrayData::dimensions)
    }

    pub fn domain(&self) -> Option<&SetObject> {
        match &self.0.slot {
            Slot::Iterator { domain, .. } => Some(domain),
            _ => None,
        }
    }

    /// The defining expression of a constant or measure.
    pub fn definition(&self) -> Option<Expr> {
        match &self.0.slot {
            Slot::Defined { def, .. } => def.borrow().clone(),
            _ => None,
        }
    }

    /// Names of the undefined symbols this one is blocked on.
    pub fn waiting_on(&self) -> Vec<String> {
        self.0.pending.borrow().clone()
    }

    /// Inlinable by substitution: computed constants, formals, iterators.
    pub fn is_inlinable(&self) -> bool {
        match self.kind() {
            SymbolKind::Constant | SymbolKind::Measure => self.is_available() && self.has_fixed_value(),
            SymbolKind::Formal | SymbolKind::Iterator => true,
            SymbolKind::Converge | SymbolKind::Array => false,
        }
    }

    /// Value does not change between samples of one evaluation session.
    pub(crate) fn is_stable(&self) -> bool {
        match self.kind() {
            SymbolKind::Constant | SymbolKind::Measure | SymbolKind::Array => {
                self.has_fixed_value() && !self.is_converge()
            }
            SymbolKind::Formal => true,
            SymbolKind::Iterator | SymbolKind::Converge => false,
        }
    }

    /// Neither random nor process-dependent, so one computed value serves
    /// every read.
    pub(crate) fn has_fixed_value(&self) -> bool {
        let ty = self.ty();
        ty.is_deterministic() && !ty.is_proc()
    }

    pub(crate) fn array_data(&self) -> Option<&ArrayData> {
        match &self.0.slot {
            Slot::Array(a) => Some(a),
            _ => None,
        }
    }

    // ── State ──

    /// Raise the state to `new`; lower targets are ignored.
    pub(crate) fn advance(&self, new: SymbolState) {
        if new > self.state() {
            self.0.state.set(new);
        }
    }

    /// Move to `new`, reporting a downward move as an internal error.
    pub(crate) fn set_state(&self, new: SymbolState, location: &Location, ctx: &mut Context) {
        let old = self.state();
        if new < old && new >= SymbolState::Declared {
            internal_error!(
                ctx,
                ErrorCode::STATE_VIOLATION,
                location,
                "symbol {} cannot move from {old:?} to {new:?}",
                self.name()
            );
            return;
        }
        self.0.state.set(new);
    }

    pub fn mark_construction_error(&self) {
        self.0.state.set(SymbolState::ConstructionError);
    }

    // ── Wait-lists ──

    fn waiters(&self) -> Vec<Symbol> {
        self.0
            .waiters
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .map(Symbol)
            .collect()
    }

    /// True if a notification from `self` can reach `target` through the
    /// wait-lists.
    pub fn could_notify(&self, target: &Symbol) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![self.clone()];
        while let Some(s) = stack.pop() {
            if !seen.insert(s.id()) {
                continue;
            }
            for w in s.waiters() {
                if w.ptr_eq(target) {
                    return true;
                }
                stack.push(w);
            }
        }
        false
    }

    /// Register `waiter` to be notified when `self` becomes available.
    pub fn add_waiter(&self, waiter: &Symbol) -> EvalResult<()> {
        if waiter.ptr_eq(self) || waiter.could_notify(self) {
            return Err(EvalError::Cycle {
                waiter: waiter.name().to_string(),
                target: self.name().to_string(),
            });
        }
        self.0.waiters.borrow_mut().push(Rc::downgrade(&waiter.0));
        Ok(())
    }

    /// Notify and drop every waiter.
    pub fn notify_list(&self) {
        let waiters = std::mem::take(&mut *self.0.waiters.borrow_mut());
        for w in waiters.iter().filter_map(Weak::upgrade) {
            Symbol(w).dependency_available(self);
        }
    }

    fn dependency_available(&self, dependency: &Symbol) {
        {
            let mut pending = self.0.pending.borrow_mut();
            if let Some(pos) = pending.iter().position(|n| n == dependency.name()) {
                pending.remove(pos);
            }
            if !pending.is_empty() {
                return;
            }
        }
        if self.state() == SymbolState::Blocked {
            tracing::debug!(symbol = self.name(), "symbol unblocked");
            self.0.state.set(SymbolState::Ready);
            self.notify_list();
        }
    }

    // ── Definition and values ──

    /// Attach `value` as the definition of a constant or measure.
    ///
    /// Dependencies that are not available yet get this symbol on their
    /// wait-list. Re-running the same definition is a no-op; a second,
    /// different definition is ignored with a warning.
    pub fn define(&self, value: &Expr, location: &Location, ctx: &mut Context) {
        let Slot::Defined { def, memo } = &self.0.slot else {
            internal_error!(
                ctx,
                ErrorCode::STATE_VIOLATION,
                location,
                "{} symbol {} cannot be defined by an expression",
                self.kind_name(),
                self.name()
            );
            return;
        };
        let state = self.state();
        if state < SymbolState::Declared {
            return;
        }
        if state >= SymbolState::Defined {
            let same = def.borrow().as_ref().is_some_and(|d| d.ptr_eq(value));
            if !same {
                ctx.warning(
                    ErrorCode::DUPLICATE_DEFINITION,
                    location,
                    format!("{} is already defined; this definition is ignored", self.name()),
                );
            }
            return;
        }

        *def.borrow_mut() = Some(value.clone());
        *memo.borrow_mut() = None;
        self.set_state(SymbolState::Defined, location, ctx);

        let deps = ctx.run(Op::GetSymbols, value).into_symbols();
        for dep in deps.iter().filter(|d| !d.is_available()) {
            if let Err(e) = dep.add_waiter(self) {
                ctx.user_error(e.code(), location, e.to_string());
                self.mark_construction_error();
                return;
            }
            self.0.pending.borrow_mut().push(dep.name().to_string());
        }

        if self.0.pending.borrow().is_empty() {
            self.set_state(SymbolState::Ready, location, ctx);
            self.notify_list();
        } else {
            tracing::debug!(symbol = self.name(), waiting_on = ?self.waiting_on(), "symbol blocked");
            self.set_state(SymbolState::Blocked, location, ctx);
        }
    }

    /// Current value of the symbol as read at `location`.
    pub fn compute(&self, ctx: &mut Context, location: &Location) -> Value {
        match &self.0.slot {
            Slot::Defined { def, memo } => {
                match self.state() {
                    SymbolState::ConstructionError | SymbolState::ConstructionNull => return Value::Null,
                    SymbolState::Declared | SymbolState::Guessed => {
                        ctx.user_error(
                            ErrorCode::UNDEFINED_SYMBOL,
                            location,
                            format!("{} is used before it is defined", self.name()),
                        );
                        return Value::Null;
                    }
                    SymbolState::Blocked => {
                        ctx.user_error(
                            ErrorCode::UNDEFINED_SYMBOL,
                            location,
                            format!(
                                "{} depends on undefined symbol(s): {}",
                                self.name(),
                                self.waiting_on().join(", ")
                            ),
                        );
                        return Value::Null;
                    }
                    SymbolState::Defined | SymbolState::Ready | SymbolState::Computed => {}
                }
                let fixed = self.has_fixed_value();
                if fixed {
                    if let Some(v) = memo.borrow().clone() {
                        return v;
                    }
                }
                let Some(expr) = def.borrow().clone() else {
                    internal_error!(
                        ctx,
                        ErrorCode::STATE_VIOLATION,
                        location,
                        "{} is {:?} but has no definition",
                        self.name(),
                        self.state()
                    );
                    return Value::Null;
                };
                let v = expr.compute(ctx);
                if !ctx.aborted() {
                    if fixed {
                        *memo.borrow_mut() = Some(v.clone());
                    }
                    self.advance(SymbolState::Computed);
                }
                v
            }
            Slot::Formal(value) => value.borrow().clone(),
            Slot::Iterator { current, .. } => current.borrow().clone(),
            Slot::Converge(cell) => cell.borrow().read(ctx.options.converge.use_current),
            Slot::Array(_) => {
                ctx.user_error(
                    ErrorCode::TYPE_MISMATCH,
                    location,
                    format!("array {} used without indices", self.name()),
                );
                Value::Null
            }
        }
    }

    /// Drop memoized values. The lifecycle state is left alone.
    pub fn clear_cache(&self) {
        match &self.0.slot {
            Slot::Defined { memo, .. } => *memo.borrow_mut() = None,
            Slot::Array(a) => a.clear_memos(),
            _ => {}
        }
    }

    /// Bind a model formal to its actual value.
    pub fn bind(&self, value: Value) {
        if let Slot::Formal(v) = &self.0.slot {
            *v.borrow_mut() = value;
        }
    }

    pub(crate) fn set_iterator(&self, value: Value) {
        if let Slot::Iterator { current, .. } = &self.0.slot {
            *current.borrow_mut() = value;
        }
    }

    /// Run `f` on the converge cell of a scalar variable (`cell == None`) or
    /// of an array cell.
    pub(crate) fn with_converge_cell<R>(&self, cell: Option<usize>, f: impl FnOnce(&mut ConvergeCell) -> R) -> Option<R> {
        match (&self.0.slot, cell) {
            (Slot::Converge(c), None) => Some(f(&mut c.borrow_mut())),
            (Slot::Array(a), Some(i)) if a.converge => {
                let mut cells = a.cells.borrow_mut();
                cells.get_mut(i).map(|slot| f(&mut slot.converge))
            }
            _ => None,
        }
    }

    /// Current value of a converge variable, outside any solve.
    pub fn current_value(&self) -> Option<Value> {
        self.with_converge_cell(None, |c| c.current.clone())
    }

    /// Store the definition of an array cell.
    pub(crate) fn define_cell(&self, cell: usize, value: Expr) {
        if let Some(a) = self.array_data() {
            if let Some(slot) = a.cells.borrow_mut().get_mut(cell) {
                slot.def = Some(value);
                slot.memo = None;
            }
        }
    }

    /// Value of an array cell as read at `location`.
    pub(crate) fn cell_value(&self, cell: usize, indices: &[Value], ctx: &mut Context, location: &Location) -> Value {
        let Some(a) = self.array_data() else {
            return Value::Null;
        };
        if a.converge {
            let use_current = ctx.options.converge.use_current;
            return self
                .with_converge_cell(Some(cell), |c| c.read(use_current))
                .unwrap_or(Value::Null);
        }
        let (def, memo) = match a.cells.borrow().get(cell) {
            Some(slot) => (slot.def.clone(), slot.memo.clone()),
            None => (None, None),
        };
        let fixed = self.has_fixed_value();
        if let Some(v) = memo.filter(|_| fixed) {
            return v;
        }
        let Some(def) = def else {
            ctx.user_error(
                ErrorCode::UNDEFINED_SYMBOL,
                location,
                format!("array cell {} is not defined", cell_label(self.name(), indices)),
            );
            return Value::Null;
        };
        let v = def.compute(ctx);
        if fixed && !ctx.aborted() {
            if let Some(slot) = a.cells.borrow_mut().get_mut(cell) {
                slot.memo = Some(v.clone());
            }
        }
        v
    }

    fn kind_name(&self) -> &'static str {
        match self.kind() {
            SymbolKind::Constant => "constant",
            SymbolKind::Measure => "measure",
            SymbolKind::Formal => "formal",
            SymbolKind::Iterator => "iterator",
            SymbolKind::Converge => "converge",
            SymbolKind::Array => "array",
        }
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("type", &self.ty())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ty(), self.name())
    }
}
