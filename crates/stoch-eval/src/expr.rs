//! Expression nodes.
//!
//! An [`Expr`] is a cheap-clone handle to an immutable node. Types are decided
//! when a node is built, through [`ExprBuilder`], which inserts implicit
//! promotions and reports type errors; a node that fails to type is replaced
//! by an `Error` node so that errors do not cascade.
//!
//! Statements share the representation: they are nodes of type `void` that
//! can be executed (`Op::Compute`) but not computed to a value.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use stoch_types::{Diagnostic, Diagnostics, ErrorCode, Location, Modifier, SimpleType, Type, TypeRegistry, Value};

use crate::model::ModelDef;
use crate::promote;
use crate::symbol::{Symbol, SymbolKind};

/// Unique, monotonically increasing node identity.
pub type NodeId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> NodeId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// ══════════════════════════════════════════════════════════════════════════════
// Node types and operators
// ══════════════════════════════════════════════════════════════════════════════

/// Static type of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprType {
    /// Statements.
    Void,
    /// A node that failed to type.
    Error,
    Simple(Type),
    Aggregate(Rc<[Type]>),
}

impl ExprType {
    pub fn simple(&self) -> Option<Type> {
        match self {
            ExprType::Simple(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExprType::Error)
    }
}

impl fmt::Display for ExprType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprType::Void => f.write_str("void"),
            ExprType::Error => f.write_str("<error>"),
            ExprType::Simple(t) => write!(f, "{t}"),
            ExprType::Aggregate(ts) => {
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{t}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Operators folded over an operand list (`Assoc` nodes).
    pub fn is_associative(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Mul | BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
        }
    }
}

/// Random leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distribution {
    /// `uniform(a, b)`: real on `[a, b)`.
    Uniform,
    /// `expo(rate)`
    Expo,
    /// `equilikely(a, b)`: integer on `a..=b`.
    Equilikely,
    /// `bernoulli(p)`
    Bernoulli,
}

impl Distribution {
    pub fn name(self) -> &'static str {
        match self {
            Distribution::Uniform => "uniform",
            Distribution::Expo => "expo",
            Distribution::Equilikely => "equilikely",
            Distribution::Bernoulli => "bernoulli",
        }
    }

    /// Parameter types, in order.
    pub fn params(self) -> &'static [Type] {
        match self {
            Distribution::Uniform => &[Type::REAL, Type::REAL],
            Distribution::Expo => &[Type::REAL],
            Distribution::Equilikely => &[Type::INT, Type::INT],
            Distribution::Bernoulli => &[Type::REAL],
        }
    }

    pub fn result_type(self) -> Type {
        match self {
            Distribution::Uniform => Type::RAND_REAL,
            Distribution::Expo => Type::PH_REAL,
            Distribution::Equilikely => Type::PH_INT,
            Distribution::Bernoulli => Type::RAND_BOOL,
        }
    }
}

/// A state variable of the process being modeled, bounded by `lo..=hi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVar {
    pub index: usize,
    pub name: String,
    pub lo: i64,
    pub hi: i64,
}

impl StateVar {
    pub fn new(index: usize, name: impl Into<String>, lo: i64, hi: i64) -> Rc<Self> {
        Rc::new(Self {
            index,
            name: name.into(),
            lo,
            hi,
        })
    }
}

/// Left-hand side of a definition or converge assignment: a symbol, or a
/// cell of an array symbol.
#[derive(Debug, Clone)]
pub struct Target {
    pub symbol: Symbol,
    pub indices: Vec<Expr>,
}

impl Target {
    pub fn new(symbol: &Symbol) -> Self {
        Self {
            symbol: symbol.clone(),
            indices: Vec::new(),
        }
    }

    pub fn cell(symbol: &Symbol, indices: Vec<Expr>) -> Self {
        Self {
            symbol: symbol.clone(),
            indices,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Nodes
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum ExprKind {
    Const(Value),
    Error,
    Symbol(Symbol),
    Unary { op: UnaryOp, operand: Expr },
    Binary { op: BinaryOp, left: Expr, right: Expr },
    Assoc { op: BinaryOp, operands: Vec<Expr> },
    Cond { cond: Expr, then: Expr, otherwise: Expr },
    /// Conversion to the node's own type.
    Typecast(Expr),
    Aggregate(Vec<Expr>),
    ArrayCell { array: Symbol, indices: Vec<Expr> },
    Random { dist: Distribution, params: Vec<Expr> },
    StateVar(Rc<StateVar>),
    MeasureCall { model: Rc<ModelDef>, params: Vec<Expr>, measure: String },

    // ── statements ──
    Block(Vec<Expr>),
    Define { target: Target, value: Expr },
    Guess { target: Target, value: Expr },
    Assign { target: Target, value: Expr },
    Converge(Vec<Expr>),
    ForEach { iterators: Vec<Symbol>, body: Vec<Expr> },
    SetNext { var: Rc<StateVar>, value: Expr },
    ModelCall { function: String, args: Vec<Expr> },
    Print(Vec<Expr>),
}

impl ExprKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Const(_) => "constant",
            ExprKind::Error => "error",
            ExprKind::Symbol(_) => "symbol",
            ExprKind::Unary { .. } => "unary",
            ExprKind::Binary { .. } => "binary",
            ExprKind::Assoc { .. } => "associative",
            ExprKind::Cond { .. } => "cond",
            ExprKind::Typecast(_) => "typecast",
            ExprKind::Aggregate(_) => "aggregate",
            ExprKind::ArrayCell { .. } => "array cell",
            ExprKind::Random { .. } => "random",
            ExprKind::StateVar(_) => "state variable",
            ExprKind::MeasureCall { .. } => "measure call",
            ExprKind::Block(_) => "block",
            ExprKind::Define { .. } => "definition",
            ExprKind::Guess { .. } => "guess",
            ExprKind::Assign { .. } => "assignment",
            ExprKind::Converge(_) => "converge",
            ExprKind::ForEach { .. } => "for",
            ExprKind::SetNext { .. } => "next-state assignment",
            ExprKind::ModelCall { .. } => "model call",
            ExprKind::Print(_) => "print",
        }
    }

    pub fn is_statement(&self) -> bool {
        matches!(
            self,
            ExprKind::Block(_)
                | ExprKind::Define { .. }
                | ExprKind::Guess { .. }
                | ExprKind::Assign { .. }
                | ExprKind::Converge(_)
                | ExprKind::ForEach { .. }
                | ExprKind::SetNext { .. }
                | ExprKind::ModelCall { .. }
                | ExprKind::Print(_)
        )
    }

    /// Child expressions in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            ExprKind::Const(_) | ExprKind::Error | ExprKind::Symbol(_) | ExprKind::StateVar(_) => {
                Vec::new()
            }
            ExprKind::Unary { operand, .. } => vec![operand],
            ExprKind::Binary { left, right, .. } => vec![left, right],
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            } => vec![cond, then, otherwise],
            ExprKind::Typecast(inner) => vec![inner],
            ExprKind::Assoc { operands: v, .. }
            | ExprKind::Aggregate(v)
            | ExprKind::ArrayCell { indices: v, .. }
            | ExprKind::Random { params: v, .. }
            | ExprKind::MeasureCall { params: v, .. }
            | ExprKind::Block(v)
            | ExprKind::Converge(v)
            | ExprKind::ForEach { body: v, .. }
            | ExprKind::ModelCall { args: v, .. }
            | ExprKind::Print(v) => v.iter().collect(),
            ExprKind::Define { target, value }
            | ExprKind::Guess { target, value }
            | ExprKind::Assign { target, value } => {
                target.indices.iter().chain(std::iter::once(value)).collect()
            }
            ExprKind::SetNext { value, .. } => vec![value],
        }
    }

    /// Rebuild this kind with every child passed through `f`.
    ///
    /// Returns `None` when `f` handed back every child unchanged (pointer
    /// equal), so callers can keep sharing the original node.
    pub(crate) fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Option<ExprKind> {
        let mut changed = false;
        let mut map = |e: &Expr| {
            let out = f(e);
            changed |= !out.ptr_eq(e);
            out
        };
        let mut map_all = |v: &[Expr]| v.iter().map(&mut map).collect::<Vec<_>>();
        let kind = match self {
            ExprKind::Const(_) | ExprKind::Error | ExprKind::Symbol(_) | ExprKind::StateVar(_) => {
                return None
            }
            ExprKind::Unary { op, operand } => ExprKind::Unary {
                op: *op,
                operand: map_all(std::slice::from_ref(operand)).remove(0),
            },
            ExprKind::Binary { op, left, right } => {
                let mut v = map_all(&[left.clone(), right.clone()]);
                let right = v.remove(1);
                ExprKind::Binary {
                    op: *op,
                    left: v.remove(0),
                    right,
                }
            }
            ExprKind::Assoc { op, operands } => ExprKind::Assoc {
                op: *op,
                operands: map_all(operands),
            },
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            } => {
                let mut v = map_all(&[cond.clone(), then.clone(), otherwise.clone()]);
                let otherwise = v.remove(2);
                let then = v.remove(1);
                ExprKind::Cond {
                    cond: v.remove(0),
                    then,
                    otherwise,
                }
            }
            ExprKind::Typecast(inner) => {
                ExprKind::Typecast(map_all(std::slice::from_ref(inner)).remove(0))
            }
            ExprKind::Aggregate(v) => ExprKind::Aggregate(map_all(v)),
            ExprKind::ArrayCell { array, indices } => ExprKind::ArrayCell {
                array: array.clone(),
                indices: map_all(indices),
            },
            ExprKind::Random { dist, params } => ExprKind::Random {
                dist: *dist,
                params: map_all(params),
            },
            ExprKind::MeasureCall {
                model,
                params,
                measure,
            } => ExprKind::MeasureCall {
                model: model.clone(),
                params: map_all(params),
                measure: measure.clone(),
            },
            ExprKind::Block(v) => ExprKind::Block(map_all(v)),
            ExprKind::Converge(v) => ExprKind::Converge(map_all(v)),
            ExprKind::ForEach { iterators, body } => ExprKind::ForEach {
                iterators: iterators.clone(),
                body: map_all(body),
            },
            ExprKind::ModelCall { function, args } => ExprKind::ModelCall {
                function: function.clone(),
                args: map_all(args),
            },
            ExprKind::Print(v) => ExprKind::Print(map_all(v)),
            ExprKind::Define { target, value } => {
                let (target, value) = map_target(target, value, &mut map_all);
                ExprKind::Define { target, value }
            }
            ExprKind::Guess { target, value } => {
                let (target, value) = map_target(target, value, &mut map_all);
                ExprKind::Guess { target, value }
            }
            ExprKind::Assign { target, value } => {
                let (target, value) = map_target(target, value, &mut map_all);
                ExprKind::Assign { target, value }
            }
            ExprKind::SetNext { var, value } => ExprKind::SetNext {
                var: var.clone(),
                value: map_all(std::slice::from_ref(value)).remove(0),
            },
        };
        changed.then_some(kind)
    }
}

fn map_target(
    target: &Target,
    value: &Expr,
    map_all: &mut impl FnMut(&[Expr]) -> Vec<Expr>,
) -> (Target, Expr) {
    let indices = map_all(&target.indices);
    let value = map_all(std::slice::from_ref(value)).remove(0);
    (Target::cell(&target.symbol, indices), value)
}

/// Node payload behind an [`Expr`] handle.
#[derive(Debug)]
pub struct ExprNode {
    id: NodeId,
    location: Location,
    name: Option<String>,
    ty: ExprType,
    kind: ExprKind,
    /// Value cached by a `PreCompute` traversal.
    cache: RefCell<Option<Value>>,
}

/// Shared handle to an expression node.
#[derive(Debug, Clone)]
pub struct Expr(Rc<ExprNode>);

impl Expr {
    pub(crate) fn new(location: Location, ty: ExprType, kind: ExprKind) -> Self {
        Self(Rc::new(ExprNode {
            id: next_id(),
            location,
            name: None,
            ty,
            kind,
            cache: RefCell::new(None),
        }))
    }

    /// A copy of this node under a new name, sharing its children.
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self(Rc::new(ExprNode {
            id: next_id(),
            location: self.location().clone(),
            name: Some(name.into()),
            ty: self.ty().clone(),
            kind: self.kind().clone(),
            cache: RefCell::new(None),
        }))
    }

    /// Same node kind and type with the children replaced; used by
    /// rewriting traversals.
    pub(crate) fn rebuilt(&self, kind: ExprKind) -> Self {
        Self(Rc::new(ExprNode {
            id: next_id(),
            location: self.location().clone(),
            name: self.name().map(str::to_string),
            ty: self.ty().clone(),
            kind,
            cache: RefCell::new(None),
        }))
    }

    // ── Leaves ──

    /// Constant of an explicit type.
    pub fn constant(location: Location, ty: Type, value: Value) -> Self {
        Self::new(location, ExprType::Simple(ty), ExprKind::Const(value))
    }

    pub fn int(location: Location, i: i64) -> Self {
        Self::constant(location, Type::INT, Value::int(i))
    }

    pub fn real(location: Location, r: f64) -> Self {
        Self::constant(location, Type::REAL, Value::real(r))
    }

    pub fn bool(location: Location, b: bool) -> Self {
        Self::constant(location, Type::BOOL, Value::bool(b))
    }

    pub fn string(location: Location, s: impl Into<String>) -> Self {
        Self::constant(location, Type::STRING, Value::string(s))
    }

    /// Placeholder for a construct that failed to type.
    pub fn error(location: Location) -> Self {
        Self::new(location, ExprType::Error, ExprKind::Error)
    }

    /// Reference to a symbol.
    pub fn symbol(location: Location, symbol: &Symbol) -> Self {
        Self::new(
            location,
            ExprType::Simple(symbol.ty()),
            ExprKind::Symbol(symbol.clone()),
        )
    }

    /// Read of a state variable in the current state.
    pub fn state_var(location: Location, var: &Rc<StateVar>) -> Self {
        Self::new(
            location,
            ExprType::Simple(Type::PROC_INT),
            ExprKind::StateVar(var.clone()),
        )
    }

    // ── Statements that need no typing ──

    pub fn block(location: Location, stmts: Vec<Expr>) -> Self {
        Self::new(location, ExprType::Void, ExprKind::Block(stmts))
    }

    pub fn converge(location: Location, stmts: Vec<Expr>) -> Self {
        Self::new(location, ExprType::Void, ExprKind::Converge(stmts))
    }

    /// `for (i in I, j in J) { body }`.
    pub fn for_each(location: Location, iterators: Vec<Symbol>, body: Vec<Expr>) -> Self {
        Self::new(location, ExprType::Void, ExprKind::ForEach { iterators, body })
    }

    /// Formalism-specific statement of a model body.
    pub fn model_call(location: Location, function: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::new(
            location,
            ExprType::Void,
            ExprKind::ModelCall {
                function: function.into(),
                args,
            },
        )
    }

    pub fn print(location: Location, args: Vec<Expr>) -> Self {
        Self::new(location, ExprType::Void, ExprKind::Print(args))
    }

    // ── Accessors ──

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn location(&self) -> &Location {
        &self.0.location
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn ty(&self) -> &ExprType {
        &self.0.ty
    }

    pub fn simple_type(&self) -> Option<Type> {
        self.0.ty.simple()
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn is_statement(&self) -> bool {
        self.0.kind.is_statement()
    }

    pub fn is_error(&self) -> bool {
        matches!(self.0.kind, ExprKind::Error)
    }

    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Same name (or both unnamed) and same type: aggregates structurally,
    /// simple types by identity.
    pub fn matches(&self, other: &Expr) -> bool {
        self.name() == other.name() && self.ty() == other.ty()
    }

    pub(crate) fn cached(&self) -> Option<Value> {
        self.0.cache.borrow().clone()
    }

    pub(crate) fn set_cache(&self, value: Option<Value>) {
        *self.0.cache.borrow_mut() = value;
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::Const(v) => write!(f, "{v}"),
            ExprKind::Error => f.write_str("<error>"),
            ExprKind::Symbol(s) => f.write_str(s.name()),
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Neg => write!(f, "-{operand}"),
                UnaryOp::Not => write!(f, "!{operand}"),
            },
            ExprKind::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            ExprKind::Assoc { op, operands } => {
                f.write_str("(")?;
                for (i, e) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op.symbol())?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str(")")
            }
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            } => write!(f, "cond({cond}, {then}, {otherwise})"),
            ExprKind::Typecast(inner) => write!(f, "{}({inner})", self.ty()),
            ExprKind::Aggregate(v) => write_list(f, "", v, ":", ""),
            ExprKind::ArrayCell { array, indices } => {
                f.write_str(array.name())?;
                for i in indices {
                    write!(f, "[{i}]")?;
                }
                Ok(())
            }
            ExprKind::Random { dist, params } => write_list(f, dist.name(), params, ", ", ")"),
            ExprKind::StateVar(v) => f.write_str(&v.name),
            ExprKind::MeasureCall {
                model,
                params,
                measure,
            } => {
                write_list(f, model.name(), params, ", ", ")")?;
                write!(f, ".{measure}")
            }
            ExprKind::ModelCall { function, args } => write_list(f, function, args, ", ", ");"),
            ExprKind::Print(args) => write_list(f, "print", args, ", ", ");"),
            other => write!(f, "<{} statement>", other.name()),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, head: &str, items: &[Expr], sep: &str, tail: &str) -> fmt::Result {
    f.write_str(head)?;
    if !tail.is_empty() {
        f.write_str("(")?;
    }
    for (i, e) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{e}")?;
    }
    f.write_str(tail)
}

// ══════════════════════════════════════════════════════════════════════════════
// Builder
// ══════════════════════════════════════════════════════════════════════════════

/// Typed constructors for every node kind that needs type resolution.
///
/// Operands are promoted to the operator's type as needed; type errors are
/// reported to the diagnostics sink and produce an `Error` node. An `Error`
/// operand yields an `Error` node without a second report.
pub struct ExprBuilder<'d> {
    diagnostics: &'d mut Diagnostics,
    warn_on_promotion: bool,
}

impl<'d> ExprBuilder<'d> {
    pub fn new(diagnostics: &'d mut Diagnostics) -> Self {
        Self {
            diagnostics,
            warn_on_promotion: false,
        }
    }

    pub fn with_promotion_warnings(mut self, warn: bool) -> Self {
        self.warn_on_promotion = warn;
        self
    }

    fn type_error(&mut self, location: &Location, message: impl Into<String>) -> Expr {
        self.diagnostics.push_error(Diagnostic::error(
            ErrorCode::TYPE_MISMATCH,
            location.clone(),
            message,
        ));
        Expr::error(location.clone())
    }

    fn error(&mut self, code: ErrorCode, location: &Location, message: impl Into<String>) -> Expr {
        self.diagnostics
            .push_error(Diagnostic::error(code, location.clone(), message));
        Expr::error(location.clone())
    }

    /// Promote `expr` to `target`, reporting failures; `None` on failure.
    pub fn promote(&mut self, expr: &Expr, target: Type) -> Option<Expr> {
        let out = promote::promote_expr(
            expr,
            &ExprType::Simple(target),
            self.diagnostics,
            self.warn_on_promotion,
        );
        if out.is_none() {
            self.diagnostics.push_error(Diagnostic::error(
                ErrorCode::TYPE_MISMATCH,
                expr.location().clone(),
                format!("expression of type {} cannot be used as {target}", expr.ty()),
            ));
        }
        out
    }

    fn promote_all(&mut self, exprs: &[Expr], target: Type) -> Option<Vec<Expr>> {
        exprs.iter().map(|e| self.promote(e, target)).collect()
    }

    fn lct_all(exprs: &[Expr]) -> Option<Type> {
        let mut types = exprs.iter().map(Expr::simple_type);
        let mut acc = types.next()??;
        for t in types {
            acc = acc.least_common_type(t?)?;
        }
        Some(acc)
    }

    pub fn unary(&mut self, location: Location, op: UnaryOp, operand: Expr) -> Expr {
        if operand.is_error() {
            return Expr::error(location);
        }
        let Some(t) = operand.simple_type() else {
            return self.type_error(&location, format!("operand of {op:?} must be a simple type"));
        };
        let ok = match op {
            UnaryOp::Neg => t.is_numeric(),
            UnaryOp::Not => t.base() == SimpleType::Bool && !t.is_set(),
        };
        if !ok {
            return self.type_error(&location, format!("operator {op:?} is not defined on {t}"));
        }
        Expr::new(location, ExprType::Simple(t), ExprKind::Unary { op, operand })
    }

    /// Binary operator; associative operators produce an `Assoc` node,
    /// flattening operands that are themselves unnamed nodes of the same operator.
    pub fn binary(&mut self, location: Location, op: BinaryOp, left: Expr, right: Expr) -> Expr {
        if op.is_associative() {
            let mut operands = Vec::new();
            for e in [left, right] {
                let flat = match e.kind() {
                    ExprKind::Assoc { op: inner, operands: v } if *inner == op && e.name().is_none() => {
                        Some(v.clone())
                    }
                    _ => None,
                };
                match flat {
                    Some(v) => operands.extend(v),
                    None => operands.push(e),
                }
            }
            return self.assoc(location, op, operands);
        }
        if left.is_error() || right.is_error() {
            return Expr::error(location);
        }
        let (Some(lt), Some(rt)) = (left.simple_type(), right.simple_type()) else {
            return self.type_error(&location, format!("operands of {} must be simple types", op.symbol()));
        };
        let Some(joined) = lt.least_common_type(rt) else {
            return self.type_error(
                &location,
                format!("operator {} cannot combine {lt} and {rt}", op.symbol()),
            );
        };
        let (operand_ty, result_ty) = match op {
            BinaryOp::Sub if joined.is_numeric() => (joined, joined),
            BinaryOp::Div if joined.is_numeric() => match joined.least_common_type(Type::REAL) {
                Some(t) => (t, t),
                None => return self.type_error(&location, format!("cannot divide {joined} values")),
            },
            BinaryOp::Mod if joined.base() == SimpleType::Int && !joined.is_set() => (joined, joined),
            BinaryOp::Eq | BinaryOp::Ne if !joined.is_set() => match bool_like(joined) {
                Some(b) => (joined, b),
                None => return self.type_error(&location, format!("cannot compare {joined} values")),
            },
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
                if joined.is_numeric() || joined == Type::STRING =>
            {
                match bool_like(joined) {
                    Some(b) => (joined, b),
                    None => return self.type_error(&location, format!("cannot order {joined} values")),
                }
            }
            _ => {
                return self.type_error(
                    &location,
                    format!("operator {} is not defined on {joined}", op.symbol()),
                )
            }
        };
        let (Some(left), Some(right)) = (self.promote(&left, operand_ty), self.promote(&right, operand_ty)) else {
            return Expr::error(location);
        };
        Expr::new(
            location,
            ExprType::Simple(result_ty),
            ExprKind::Binary { op, left, right },
        )
    }

    /// N-ary `+ * & |`.
    pub fn assoc(&mut self, location: Location, op: BinaryOp, operands: Vec<Expr>) -> Expr {
        if !op.is_associative() {
            return self.error(
                ErrorCode::INTERNAL,
                &location,
                format!("operator {} is not associative", op.symbol()),
            );
        }
        if operands.iter().any(Expr::is_error) {
            return Expr::error(location);
        }
        if operands.len() < 2 {
            return self.type_error(&location, format!("operator {} needs two operands", op.symbol()));
        }
        let Some(joined) = Self::lct_all(&operands) else {
            return self.type_error(&location, format!("operands of {} have no common type", op.symbol()));
        };
        let ok = if op.is_logical() {
            joined.base() == SimpleType::Bool && !joined.is_set()
        } else {
            joined.is_numeric()
        };
        if !ok {
            return self.type_error(
                &location,
                format!("operator {} is not defined on {joined}", op.symbol()),
            );
        }
        let Some(operands) = self.promote_all(&operands, joined) else {
            return Expr::error(location);
        };
        Expr::new(location, ExprType::Simple(joined), ExprKind::Assoc { op, operands })
    }

    /// `cond(c, a, b)`.
    pub fn cond(&mut self, location: Location, cond: Expr, then: Expr, otherwise: Expr) -> Expr {
        if cond.is_error() || then.is_error() || otherwise.is_error() {
            return Expr::error(location);
        }
        let Some(ct) = cond.simple_type().filter(|t| t.base() == SimpleType::Bool && !t.is_set()) else {
            return self.type_error(&location, "condition must be boolean");
        };
        let joined = match (then.simple_type(), otherwise.simple_type()) {
            (Some(a), Some(b)) => a.least_common_type(b),
            _ => None,
        };
        let Some(joined) = joined else {
            return self.type_error(&location, "branches of cond have no common type");
        };
        let Some(result) = wrap(
            joined.base(),
            joined.modifier().max(ct.modifier()),
            joined.is_proc() || ct.is_proc(),
        ) else {
            return self.type_error(&location, format!("cond on {ct} cannot produce {joined}"));
        };
        let (Some(then), Some(otherwise)) = (self.promote(&then, result), self.promote(&otherwise, result)) else {
            return Expr::error(location);
        };
        Expr::new(
            location,
            ExprType::Simple(result),
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            },
        )
    }

    /// Explicit cast.
    pub fn typecast(&mut self, location: Location, expr: Expr, target: Type) -> Expr {
        if expr.is_error() {
            return Expr::error(location);
        }
        match promote::cast_expr(&expr, target) {
            Some(e) => e,
            None => self.error(
                ErrorCode::BAD_CAST,
                &location,
                format!("cannot cast {} to {target}", expr.ty()),
            ),
        }
    }

    /// `a:b:c`.
    pub fn aggregate(&mut self, location: Location, components: Vec<Expr>) -> Expr {
        if components.iter().any(Expr::is_error) {
            return Expr::error(location);
        }
        let Some(types) = components.iter().map(Expr::simple_type).collect::<Option<Vec<_>>>() else {
            return self.type_error(&location, "aggregate components must be simple types");
        };
        Expr::new(
            location,
            ExprType::Aggregate(types.into()),
            ExprKind::Aggregate(components),
        )
    }

    /// `A[i][j]`.
    pub fn array_cell(&mut self, location: Location, array: &Symbol, indices: Vec<Expr>) -> Expr {
        if indices.iter().any(Expr::is_error) {
            return Expr::error(location);
        }
        let Some(dims) = array.dimensions() else {
            return self.type_error(&location, format!("{} is not an array", array.name()));
        };
        if dims != indices.len() {
            return self.error(
                ErrorCode::WRONG_COMPONENT_COUNT,
                &location,
                format!("array {} has {dims} dimension(s), got {} index(es)", array.name(), indices.len()),
            );
        }
        let Some(indices) = self.promote_all(&indices, Type::INT) else {
            return Expr::error(location);
        };
        Expr::new(
            location,
            ExprType::Simple(array.ty()),
            ExprKind::ArrayCell {
                array: array.clone(),
                indices,
            },
        )
    }

    pub fn random(&mut self, location: Location, dist: Distribution, params: Vec<Expr>) -> Expr {
        if params.iter().any(Expr::is_error) {
            return Expr::error(location);
        }
        let expected = dist.params();
        if params.len() != expected.len() {
            return self.error(
                ErrorCode::WRONG_COMPONENT_COUNT,
                &location,
                format!("{} expects {} parameter(s)", dist.name(), expected.len()),
            );
        }
        let promoted: Option<Vec<Expr>> = params
            .iter()
            .zip(expected)
            .map(|(p, t)| self.promote(p, *t))
            .collect();
        let Some(params) = promoted else {
            return Expr::error(location);
        };
        Expr::new(
            location,
            ExprType::Simple(dist.result_type()),
            ExprKind::Random { dist, params },
        )
    }

    /// `M(p1, p2).measure`.
    pub fn measure_call(
        &mut self,
        location: Location,
        model: &Rc<ModelDef>,
        params: Vec<Expr>,
        measure: &str,
    ) -> Expr {
        if params.iter().any(Expr::is_error) {
            return Expr::error(location);
        }
        if params.len() != model.formals().len() {
            return self.error(
                ErrorCode::WRONG_PARAM_COUNT,
                &location,
                format!(
                    "model {} expects {} parameter(s), got {}",
                    model.name(),
                    model.formals().len(),
                    params.len()
                ),
            );
        }
        let Some(ty) = model.measure(measure).map(Symbol::ty) else {
            return self.error(
                ErrorCode::UNDECLARED_MEASURE,
                &location,
                format!("model {} has no measure {measure}", model.name()),
            );
        };
        let formal_types: Vec<Type> = model.formals().iter().map(Symbol::ty).collect();
        let promoted: Option<Vec<Expr>> = params
            .iter()
            .zip(formal_types)
            .map(|(p, t)| self.promote(p, t))
            .collect();
        let Some(params) = promoted else {
            return Expr::error(location);
        };
        Expr::new(
            location,
            ExprType::Simple(ty),
            ExprKind::MeasureCall {
                model: model.clone(),
                params,
                measure: measure.to_string(),
            },
        )
    }

    // ── Statements ──

    /// `T x := value;` for constants and measures.
    pub fn define(&mut self, location: Location, symbol: &Symbol, value: Expr) -> Expr {
        if !matches!(symbol.kind(), SymbolKind::Constant | SymbolKind::Measure) {
            return self.error(
                ErrorCode::REDECLARATION,
                &location,
                format!("{} cannot be defined by an expression", symbol.name()),
            );
        }
        self.target_statement(location, Target::new(symbol), value, TargetUse::Define)
    }

    /// `A[i][j] := value;` inside a `for` loop.
    pub fn define_cell(&mut self, location: Location, array: &Symbol, indices: Vec<Expr>, value: Expr) -> Expr {
        if array.dimensions().is_none() {
            return self.type_error(&location, format!("{} is not an array", array.name()));
        }
        self.target_statement(location, Target::cell(array, indices), value, TargetUse::Define)
    }

    /// `x guess value;`
    pub fn guess(&mut self, location: Location, target: Target, value: Expr) -> Expr {
        self.target_statement(location, target, value, TargetUse::Guess)
    }

    /// `x := value;` inside a converge block.
    pub fn assign(&mut self, location: Location, target: Target, value: Expr) -> Expr {
        self.target_statement(location, target, value, TargetUse::Assign)
    }

    fn target_statement(&mut self, location: Location, target: Target, value: Expr, usage: TargetUse) -> Expr {
        if value.is_error() || target.indices.iter().any(Expr::is_error) {
            return Expr::error(location);
        }
        let symbol = &target.symbol;
        if usage != TargetUse::Define && !symbol.is_converge() {
            return self.error(
                ErrorCode::IGNORED_ASSIGNMENT,
                &location,
                format!("{} is not a converge variable", symbol.name()),
            );
        }
        let dims = symbol.dimensions().unwrap_or(0);
        if dims != target.indices.len() {
            return self.error(
                ErrorCode::WRONG_COMPONENT_COUNT,
                &location,
                format!("{} has {dims} dimension(s), got {} index(es)", symbol.name(), target.indices.len()),
            );
        }
        let Some(indices) = self.promote_all(&target.indices, Type::INT) else {
            return Expr::error(location);
        };
        let Some(value) = self.promote(&value, symbol.ty()) else {
            return Expr::error(location);
        };
        let target = Target::cell(symbol, indices);
        let kind = match usage {
            TargetUse::Define => ExprKind::Define { target, value },
            TargetUse::Guess => ExprKind::Guess { target, value },
            TargetUse::Assign => ExprKind::Assign { target, value },
        };
        Expr::new(location, ExprType::Void, kind)
    }

    /// `x' := value;`
    pub fn set_next(&mut self, location: Location, var: &Rc<StateVar>, value: Expr) -> Expr {
        if value.is_error() {
            return Expr::error(location);
        }
        let Some(value) = self.promote(&value, Type::PROC_INT) else {
            return Expr::error(location);
        };
        Expr::new(
            location,
            ExprType::Void,
            ExprKind::SetNext {
                var: var.clone(),
                value,
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetUse {
    Define,
    Guess,
    Assign,
}

/// Registered type with the given components, bumping `Phase` to `Random`
/// when no phase type exists for `base`.
pub(crate) fn wrap(base: SimpleType, modifier: Modifier, proc: bool) -> Option<Type> {
    let reg = TypeRegistry::global();
    reg.lookup(base, modifier, proc, false).or_else(|| {
        (modifier == Modifier::Phase)
            .then(|| reg.lookup(base, Modifier::Random, proc, false))
            .flatten()
    })
}

/// Boolean result type of comparing two values of `t`.
fn bool_like(t: Type) -> Option<Type> {
    wrap(SimpleType::Bool, t.modifier(), t.is_proc())
}
