//! Traversal context.
//!
//! A [`Context`] is the single argument threaded through every traversal of
//! an expression tree. It names the operation being performed ([`Op`]),
//! receives the result ([`Output`]), and lends the traversal the
//! collaborators it may need: random stream, process state, diagram builder,
//! output stream, diagnostics sink, cancellation token.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::RngCore;
use stoch_types::{Diagnostic, Diagnostics, ErrorCode, Location, Value};

use crate::backend::{DdEdge, DiagramBuilder, OutputStream};
use crate::converge::ConvergeOutcome;
use crate::expr::{Expr, ExprType, NodeId};
use crate::model::BuildTarget;
use crate::options::{EngineOptions, InternalPolicy};
use crate::symbol::Symbol;

/// Report an internal error with the detection site attached.
///
/// ```ignore
/// internal_error!(ctx, ErrorCode::NOT_COMPUTABLE, expr.location(), "cannot compute {}", kind);
/// ```
#[macro_export]
macro_rules! internal_error {
    ($ctx:expr, $code:expr, $loc:expr, $($arg:tt)+) => {
        $ctx.internal($code, $loc, format!($($arg)+), file!(), line!())
    };
}

// ══════════════════════════════════════════════════════════════════════════════
// Operations and results
// ══════════════════════════════════════════════════════════════════════════════

/// Traversal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Compute,
    PreCompute,
    ClearCache,
    Substitute,
    GetSymbols,
    GetVariableDependencies,
    GetMeasures,
    Guess,
    Update,
    Block,
    Affix,
    FindRange,
    BuildDiagram,
    Typecheck,
    Promote,
    GetType,
}

/// Conservative interval of the values an expression can take.
#[derive(Debug, Clone)]
pub struct Range {
    pub lo: Value,
    pub hi: Value,
}

impl Range {
    pub fn new(lo: Value, hi: Value) -> Self {
        Self { lo, hi }
    }

    pub fn point(v: Value) -> Self {
        Self { lo: v.clone(), hi: v }
    }

    pub fn unknown() -> Self {
        Self {
            lo: Value::Unknown,
            hi: Value::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !self.lo.is_unknown() && !self.hi.is_unknown()
    }
}

/// Result slot of a traversal.
#[derive(Debug, Clone, Default)]
pub enum Output {
    #[default]
    None,
    Value(Value),
    Expr(Expr),
    Symbols(BTreeMap<NodeId, Symbol>),
    /// State variable index → name.
    StateVars(BTreeMap<usize, String>),
    Range(Range),
    Type(ExprType),
    Diagram(DdEdge),
    Converged(ConvergeOutcome),
}

impl Output {
    /// The value produced by a `Compute`; anything else is `Null`.
    pub fn into_value(self) -> Value {
        match self {
            Output::Value(v) => v,
            _ => Value::Null,
        }
    }

    pub fn into_expr(self) -> Option<Expr> {
        match self {
            Output::Expr(e) => Some(e),
            _ => None,
        }
    }

    /// Collected symbols in id order.
    pub fn into_symbols(self) -> Vec<Symbol> {
        match self {
            Output::Symbols(map) => map.into_values().collect(),
            _ => Vec::new(),
        }
    }

    pub fn into_state_vars(self) -> BTreeMap<usize, String> {
        match self {
            Output::StateVars(map) => map,
            _ => BTreeMap::new(),
        }
    }

    pub fn into_range(self) -> Range {
        match self {
            Output::Range(r) => r,
            _ => Range::unknown(),
        }
    }

    pub fn into_type(self) -> Option<ExprType> {
        match self {
            Output::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_diagram(self) -> Option<DdEdge> {
        match self {
            Output::Diagram(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_outcome(self) -> Option<ConvergeOutcome> {
        match self {
            Output::Converged(o) => Some(o),
            _ => None,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Cancellation
// ══════════════════════════════════════════════════════════════════════════════

/// Shared flag a host (or a timer thread) sets to abort long computations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Context
// ══════════════════════════════════════════════════════════════════════════════

/// Everything a traversal needs besides the tree itself.
pub struct Context<'a> {
    pub op: Op,
    pub output: Output,
    pub options: EngineOptions,
    pub diagnostics: &'a mut Diagnostics,

    rng: Option<&'a mut dyn RngCore>,
    current_state: Option<&'a [i64]>,
    next_state: Option<&'a mut [i64]>,
    current_state_index: Option<u64>,
    pub(crate) diagram: Option<&'a mut dyn DiagramBuilder>,
    stream: Option<OutputStream<'a>>,
    cancel: CancelToken,

    /// Location of the enclosing construct, used to attribute errors.
    pub parent: Option<Location>,
    /// Set by converge assignments whose value moved more than the precision.
    pub repeat: bool,
    /// Target of a `Promote` traversal.
    pub promote_target: Option<ExprType>,
    /// Component selected when computing an aggregate.
    pub component: usize,

    pub(crate) converge_depth: usize,
    pub(crate) building: Option<BuildTarget>,
    aborted: bool,
}

impl<'a> Context<'a> {
    pub fn new(diagnostics: &'a mut Diagnostics) -> Self {
        Self {
            op: Op::Compute,
            output: Output::None,
            options: EngineOptions::default(),
            diagnostics,
            rng: None,
            current_state: None,
            next_state: None,
            current_state_index: None,
            diagram: None,
            stream: None,
            cancel: CancelToken::new(),
            parent: None,
            repeat: false,
            promote_target: None,
            component: 0,
            converge_depth: 0,
            building: None,
            aborted: false,
        }
    }

    // ── Builder ──

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_rng(mut self, rng: &'a mut dyn RngCore) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn with_state(mut self, current: &'a [i64]) -> Self {
        self.current_state = Some(current);
        self
    }

    pub fn with_next_state(mut self, next: &'a mut [i64]) -> Self {
        self.next_state = Some(next);
        self
    }

    pub fn with_state_index(mut self, index: u64) -> Self {
        self.current_state_index = Some(index);
        self
    }

    pub fn with_diagram(mut self, builder: &'a mut dyn DiagramBuilder) -> Self {
        self.diagram = Some(builder);
        self
    }

    pub fn with_output(mut self, sink: &'a mut dyn std::fmt::Write, active: bool) -> Self {
        self.stream = Some(OutputStream::new(sink, active));
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    // ── Running traversals ──

    /// Run `op` over `expr` as a fresh traversal and return its output.
    ///
    /// The op and output slot of an enclosing traversal are restored
    /// afterwards, so this is safe to call from inside another traversal.
    pub fn run(&mut self, op: Op, expr: &Expr) -> Output {
        let saved_op = std::mem::replace(&mut self.op, op);
        let fresh = match op {
            Op::GetSymbols | Op::GetMeasures => Output::Symbols(BTreeMap::new()),
            Op::GetVariableDependencies => Output::StateVars(BTreeMap::new()),
            _ => Output::None,
        };
        let saved_output = std::mem::replace(&mut self.output, fresh);
        expr.traverse(self);
        let out = std::mem::replace(&mut self.output, saved_output);
        self.op = saved_op;
        out
    }

    /// Compute `expr` and return its value.
    pub fn compute(&mut self, expr: &Expr) -> Value {
        self.run(Op::Compute, expr).into_value()
    }

    /// Promote `expr` to `target` through a `Promote` traversal.
    pub fn promote(&mut self, expr: &Expr, target: ExprType) -> Option<Expr> {
        let saved = self.promote_target.replace(target);
        let out = self.run(Op::Promote, expr).into_expr();
        self.promote_target = saved;
        out
    }

    // ── Accumulators ──

    pub(crate) fn collect_symbol(&mut self, symbol: &Symbol) {
        if !matches!(self.output, Output::Symbols(_)) {
            self.output = Output::Symbols(BTreeMap::new());
        }
        if let Output::Symbols(map) = &mut self.output {
            map.entry(symbol.id()).or_insert_with(|| symbol.clone());
        }
    }

    pub(crate) fn collect_state_var(&mut self, index: usize, name: &str) {
        if !matches!(self.output, Output::StateVars(_)) {
            self.output = Output::StateVars(BTreeMap::new());
        }
        if let Output::StateVars(map) = &mut self.output {
            map.entry(index).or_insert_with(|| name.to_string());
        }
    }

    // ── Diagnostics ──

    /// Report a user error, attributed to the enclosing construct if any.
    pub fn user_error(&mut self, code: ErrorCode, location: &Location, message: impl Into<String>) {
        let mut message = message.into();
        if let Some(parent) = &self.parent {
            if parent != location {
                message = format!("{message} (within {parent})");
            }
        }
        self.diagnostics
            .push_error(Diagnostic::error(code, location.clone(), message));
    }

    pub fn warning(&mut self, code: ErrorCode, location: &Location, message: impl Into<String>) {
        self.diagnostics
            .push_warning(Diagnostic::warning(code, location.clone(), message));
    }

    /// Report an internal error detected at `file:line`. Prefer the
    /// [`internal_error!`] macro, which fills the site in.
    ///
    /// Panics under [`InternalPolicy::Panic`].
    pub fn internal(
        &mut self,
        code: ErrorCode,
        location: &Location,
        message: String,
        file: &str,
        line: u32,
    ) {
        let diagnostic = Diagnostic::internal(code, location.clone(), message, file, line);
        if self.options.internal_policy == InternalPolicy::Panic {
            panic!("internal error: {diagnostic}");
        }
        self.diagnostics.push_internal(diagnostic);
    }

    // ── Cancellation ──

    /// True once the computation has been aborted.
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Check the cancellation token; the first positive check records the
    /// abort and warns once.
    pub fn stop_execution(&mut self, location: &Location) -> bool {
        if self.aborted {
            return true;
        }
        if !self.cancel.is_cancelled() {
            return false;
        }
        self.aborted = true;
        tracing::info!(location = %location, "computation aborted");
        self.warning(ErrorCode::COMPUTATION_ABORTED, location, "computation aborted");
        true
    }

    // ── Collaborators ──

    pub fn rng(&mut self) -> Option<&mut (dyn RngCore + 'a)> {
        self.rng.as_deref_mut()
    }

    pub fn current_state(&self) -> Option<&'a [i64]> {
        self.current_state
    }

    pub fn current_state_index(&self) -> Option<u64> {
        self.current_state_index
    }

    /// Write `value` to slot `index` of the next state; false if there is
    /// no next state or the slot does not exist.
    pub(crate) fn set_next_state(&mut self, index: usize, value: i64) -> bool {
        match self.next_state.as_deref_mut().and_then(|s| s.get_mut(index)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_next_state(&self) -> bool {
        self.next_state.is_some()
    }

    /// Write to the caller's output stream. Inactive or missing streams
    /// swallow the text.
    pub(crate) fn write_output(&mut self, location: &Location, text: &str) {
        let Some(stream) = &mut self.stream else {
            return;
        };
        if stream.write(text).is_err() {
            self.user_error(ErrorCode::OUTPUT_FAILED, location, "could not write to output stream");
        }
    }

    pub fn set_output_active(&mut self, active: bool) {
        if let Some(stream) = &mut self.stream {
            stream.active = active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }

    #[test]
    fn test_stop_execution_warns_once() {
        let mut diags = Diagnostics::new();
        let token = CancelToken::new();
        token.cancel();
        let mut ctx = Context::new(&mut diags).with_cancel(token);
        let loc = Location::new("m.sm", 3);
        assert!(ctx.stop_execution(&loc));
        assert!(ctx.stop_execution(&loc));
        assert!(ctx.aborted());
        drop(ctx);
        assert_eq!(diags.total_warnings, 1);
        assert!(diags.has_warning_code(ErrorCode::COMPUTATION_ABORTED));
    }

    #[test]
    fn test_user_error_attributed_to_parent() {
        let mut diags = Diagnostics::new();
        let mut ctx = Context::new(&mut diags);
        ctx.parent = Some(Location::new("m.sm", 1));
        ctx.user_error(ErrorCode::BAD_VALUE, &Location::new("m.sm", 7), "bad");
        drop(ctx);
        assert_eq!(diags.errors[0].message, "bad (within m.sm:1)");
    }

    #[test]
    fn test_degrade_records_internal_error() {
        let mut diags = Diagnostics::new();
        let mut ctx = Context::new(&mut diags).with_options(EngineOptions::degrading());
        internal_error!(ctx, ErrorCode::INTERNAL, &Location::builtin(), "broken {}", 1);
        drop(ctx);
        assert_eq!(diags.internal.len(), 1);
        assert!(diags.internal[0].detected_at.as_deref().unwrap().contains("ctx.rs"));
    }

    #[test]
    #[should_panic(expected = "internal error")]
    fn test_panic_policy_panics() {
        let mut diags = Diagnostics::new();
        let opts = EngineOptions {
            internal_policy: InternalPolicy::Panic,
            ..EngineOptions::default()
        };
        let mut ctx = Context::new(&mut diags).with_options(opts);
        internal_error!(ctx, ErrorCode::INTERNAL, &Location::builtin(), "broken");
    }

    #[test]
    fn test_next_state_bounds() {
        let mut diags = Diagnostics::new();
        let mut next = [0i64; 2];
        let mut ctx = Context::new(&mut diags).with_next_state(&mut next);
        assert!(ctx.set_next_state(1, 4));
        assert!(!ctx.set_next_state(2, 4));
        drop(ctx);
        assert_eq!(next, [0, 4]);
    }
}
