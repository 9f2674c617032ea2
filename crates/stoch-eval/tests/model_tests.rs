//! Integration tests for model instantiation and decision-diagram building.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use stoch_eval::{
    BinaryOp, CancelToken, CompiledModel, Context, DdEdge, DiagramBuilder, DiagramError, EngineOptions, EvalError,
    EvalResult, Expr, ExprBuilder, Formalism, FormalismFactory, InstanceState, ModelDef, Op, StateVar, Symbol,
    UnaryOp,
};
use stoch_types::{Diagnostics, ErrorCode, Location, Type, Value};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn loc(line: u32) -> Location {
    Location::new("model.sm", line)
}

fn int(i: i64) -> Expr {
    Expr::int(loc(1), i)
}

fn sym(s: &Symbol) -> Expr {
    Expr::symbol(loc(1), s)
}

fn ctx(diags: &mut Diagnostics) -> Context<'_> {
    Context::new(diags).with_options(EngineOptions::degrading())
}

type Log = Rc<RefCell<Vec<String>>>;

#[derive(Debug)]
struct Compiled {
    states: u64,
    fixed: Option<(&'static str, i64)>,
}

impl CompiledModel for Compiled {
    fn num_states(&self) -> Option<u64> {
        Some(self.states)
    }

    fn query(&self, measure: &str) -> Option<Value> {
        self.fixed.filter(|(name, _)| *name == measure).map(|(_, v)| Value::int(v))
    }
}

#[derive(Clone, Default)]
struct Behavior {
    reject_call: Option<&'static str>,
    reject_finalize: bool,
    fixed: Option<(&'static str, i64)>,
}

/// Records every protocol step; `states(n)` sets the state count.
struct MockFormalism {
    log: Log,
    behavior: Behavior,
    states: u64,
}

impl Formalism for MockFormalism {
    fn init_model(&mut self, instance: &str) -> EvalResult<()> {
        self.log.borrow_mut().push(format!("init {instance}"));
        Ok(())
    }

    fn call(&mut self, function: &str, args: &[Value]) -> EvalResult<()> {
        self.log.borrow_mut().push(format!("call {function}"));
        if self.behavior.reject_call == Some(function) {
            return Err(EvalError::Formalism(format!("{function} rejected")));
        }
        if let Some(n) = args.first().and_then(|a| a.as_int().ok()) {
            self.states = n as u64;
        }
        Ok(())
    }

    fn finalize_model(&mut self) -> EvalResult<Box<dyn CompiledModel>> {
        self.log.borrow_mut().push("finalize".to_string());
        if self.behavior.reject_finalize {
            return Err(EvalError::Formalism("model has no initial state".into()));
        }
        Ok(Box::new(Compiled {
            states: self.states,
            fixed: self.behavior.fixed,
        }))
    }
}

fn factory(log: &Log, behavior: Behavior) -> FormalismFactory {
    let log = log.clone();
    Box::new(move || {
        Box::new(MockFormalism {
            log: log.clone(),
            behavior: behavior.clone(),
            states: 0,
        }) as Box<dyn Formalism>
    })
}

/// `model M(int n) { states(n); <call>(); measure m := n * 2; }`
fn chain_model(diags: &mut Diagnostics, log: &Log, behavior: Behavior, extra_call: Option<&str>) -> Rc<ModelDef> {
    let n = Symbol::formal("n", Type::INT, loc(1));
    let m = Symbol::measure("m", Type::INT, loc(4));
    let mut b = ExprBuilder::new(diags);
    let mut body = vec![Expr::model_call(loc(2), "states", vec![sym(&n)])];
    if let Some(f) = extra_call {
        body.push(Expr::model_call(loc(3), f, vec![]));
    }
    let twice = b.binary(loc(4), BinaryOp::Mul, sym(&n), int(2));
    body.push(b.define(loc(4), &m, twice));
    ModelDef::new("M", loc(1), vec![n], body, factory(log, behavior))
}

// ══════════════════════════════════════════════════════════════════════════════
// Memoization
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn same_parameters_reuse_instance() {
    let mut diags = Diagnostics::new();
    let log = Log::default();
    let model = chain_model(&mut diags, &log, Behavior::default(), None);
    let mut c = ctx(&mut diags);

    let first = model.instantiate_values(vec![Value::int(4)], &mut c).unwrap();
    let second = model.instantiate_values(vec![Value::int(4)], &mut c).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(model.builds(), 1);
    assert_eq!(first.label(), "M(4)");
    assert_eq!(first.state(), InstanceState::Ready);
    assert_eq!(first.num_states(), Some(4));
    assert_eq!(first.measure("m", &mut c).unwrap().as_int(), Ok(8));
    assert_eq!(*log.borrow(), vec!["init M(4)", "call states", "finalize"]);
}

#[test]
fn new_parameters_rebuild_and_deconstruct() {
    let mut diags = Diagnostics::new();
    let log = Log::default();
    let model = chain_model(&mut diags, &log, Behavior::default(), None);
    let mut c = ctx(&mut diags);

    let four = model.instantiate_values(vec![Value::int(4)], &mut c).unwrap();
    assert_eq!(four.measure("m", &mut c).unwrap().as_int(), Ok(8));

    let five = model.instantiate_values(vec![Value::int(5)], &mut c).unwrap();
    assert!(!Rc::ptr_eq(&four, &five));
    assert_eq!(model.builds(), 2);
    assert_eq!(four.state(), InstanceState::Deconstructed);
    assert!(matches!(four.measure("m", &mut c), Err(EvalError::Deconstructed(_))));
    assert_eq!(five.measure("m", &mut c).unwrap().as_int(), Ok(10));
    assert_eq!(model.current_params().len(), 1);
}

#[test]
fn measure_call_expression_instantiates() {
    let mut diags = Diagnostics::new();
    let log = Log::default();
    let model = chain_model(&mut diags, &log, Behavior::default(), None);
    let call = ExprBuilder::new(&mut diags).measure_call(loc(9), &model, vec![int(3)], "m");
    assert!(!call.is_error());

    let mut c = ctx(&mut diags);
    assert_eq!(c.compute(&call).as_int(), Ok(6));
    assert_eq!(c.compute(&call).as_int(), Ok(6));
    drop(c);
    assert_eq!(model.builds(), 1);
    assert!(!diags.has_errors());
}

#[test]
fn undeclared_measure_and_arity() {
    let mut diags = Diagnostics::new();
    let log = Log::default();
    let model = chain_model(&mut diags, &log, Behavior::default(), None);

    let bad = ExprBuilder::new(&mut diags).measure_call(loc(9), &model, vec![int(3)], "missing");
    assert!(bad.is_error());
    assert!(diags.has_error_code(ErrorCode::UNDECLARED_MEASURE));

    let mut c = ctx(&mut diags);
    let err = model.instantiate_values(vec![], &mut c).unwrap_err();
    assert!(matches!(err, EvalError::WrongParamCount { expected: 1, found: 0, .. }));
    assert_eq!(model.builds(), 0);

    let instance = model.instantiate_values(vec![Value::int(2)], &mut c).unwrap();
    assert!(matches!(instance.measure("missing", &mut c), Err(EvalError::UndeclaredMeasure { .. })));
}

#[test]
fn compiled_model_answers_query() {
    let mut diags = Diagnostics::new();
    let log = Log::default();
    let behavior = Behavior {
        fixed: Some(("m", 99)),
        ..Behavior::default()
    };
    let model = chain_model(&mut diags, &log, behavior, None);
    let mut c = ctx(&mut diags);
    let instance = model.instantiate_values(vec![Value::int(4)], &mut c).unwrap();
    assert_eq!(instance.measure("m", &mut c).unwrap().as_int(), Ok(99));
}

// ══════════════════════════════════════════════════════════════════════════════
// Construction failures
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn finalize_failure_marks_instance_failed() {
    let mut diags = Diagnostics::new();
    let log = Log::default();
    let behavior = Behavior {
        reject_finalize: true,
        ..Behavior::default()
    };
    let model = chain_model(&mut diags, &log, behavior, None);
    let mut c = ctx(&mut diags);
    let instance = model.instantiate_values(vec![Value::int(4)], &mut c).unwrap();
    assert_eq!(instance.state(), InstanceState::Error);
    assert!(matches!(instance.measure("m", &mut c), Err(EvalError::ConstructionFailed(_))));

    // the failed instance stays memoized
    let again = model.instantiate_values(vec![Value::int(4)], &mut c).unwrap();
    assert!(Rc::ptr_eq(&instance, &again));
    drop(c);
    assert!(diags.has_error_code(ErrorCode::FORMALISM_ERROR));
}

#[test]
fn rejected_model_call_skips_finalize() {
    let mut diags = Diagnostics::new();
    let log = Log::default();
    let behavior = Behavior {
        reject_call: Some("arcs"),
        ..Behavior::default()
    };
    let model = chain_model(&mut diags, &log, behavior, Some("arcs"));
    let mut c = ctx(&mut diags);
    let instance = model.instantiate_values(vec![Value::int(4)], &mut c).unwrap();
    drop(c);
    assert_eq!(instance.state(), InstanceState::Error);
    assert!(!log.borrow().iter().any(|s| s == "finalize"));
    assert!(diags.has_error_code(ErrorCode::FORMALISM_ERROR));
}

#[test]
fn model_call_outside_model_is_rejected() {
    let mut diags = Diagnostics::new();
    let stmt = Expr::model_call(loc(7), "arcs", vec![int(1)]);
    ctx(&mut diags).run(Op::Compute, &stmt);
    assert!(diags.has_error_code(ErrorCode::FORMALISM_ERROR));
    assert_eq!(diags.errors[0].location.line, 7);
}

#[test]
fn aborted_build_is_forgotten() {
    let mut diags = Diagnostics::new();
    let log = Log::default();
    let model = chain_model(&mut diags, &log, Behavior::default(), None);
    let token = CancelToken::new();
    token.cancel();
    let mut c = ctx(&mut diags).with_cancel(token);
    let result = model.instantiate_values(vec![Value::int(4)], &mut c);
    assert!(matches!(result, Err(EvalError::Aborted)));
    assert!(model.last_build().is_none());
    drop(c);
    assert!(diags.has_warning_code(ErrorCode::COMPUTATION_ABORTED));
}

// ══════════════════════════════════════════════════════════════════════════════
// Decision diagrams
// ══════════════════════════════════════════════════════════════════════════════

/// Hands out numbered edges and tracks which are still owned by the caller.
#[derive(Default)]
struct CountingBuilder {
    next: u64,
    live: HashSet<u64>,
    bad_releases: usize,
    reject: Option<BinaryOp>,
}

impl CountingBuilder {
    fn fresh(&mut self) -> DdEdge {
        self.next += 1;
        self.live.insert(self.next);
        DdEdge(self.next)
    }
}

impl DiagramBuilder for CountingBuilder {
    fn constant(&mut self, _value: &Value) -> Result<DdEdge, DiagramError> {
        Ok(self.fresh())
    }

    fn variable(&mut self, _index: usize, _name: &str) -> Result<DdEdge, DiagramError> {
        Ok(self.fresh())
    }

    fn apply(&mut self, op: BinaryOp, _a: DdEdge, _b: DdEdge) -> Result<DdEdge, DiagramError> {
        if self.reject == Some(op) {
            return Err(DiagramError::Unsupported(op.symbol().to_string()));
        }
        Ok(self.fresh())
    }

    fn unary(&mut self, _op: UnaryOp, _a: DdEdge) -> Result<DdEdge, DiagramError> {
        Ok(self.fresh())
    }

    fn release(&mut self, edge: DdEdge) {
        if !self.live.remove(&edge.0) {
            self.bad_releases += 1;
        }
    }
}

fn state_expr(diags: &mut Diagnostics, build: impl FnOnce(&mut ExprBuilder, Expr) -> Expr) -> Expr {
    let x = StateVar::new(0, "x", 0, 5);
    let mut b = ExprBuilder::new(diags);
    build(&mut b, Expr::state_var(loc(1), &x))
}

#[test]
fn diagram_keeps_only_result_edge() {
    let mut diags = Diagnostics::new();
    let e = state_expr(&mut diags, |b, x| {
        let neg = b.unary(loc(1), UnaryOp::Neg, x);
        let sum = b.binary(loc(1), BinaryOp::Add, neg, int(1));
        b.binary(loc(1), BinaryOp::Mul, sum, int(2))
    });
    let mut builder = CountingBuilder::default();
    let edge = ctx(&mut diags)
        .with_diagram(&mut builder)
        .run(Op::BuildDiagram, &e)
        .into_diagram()
        .unwrap();
    assert_eq!(builder.live, HashSet::from([edge.0]));
    assert_eq!(builder.bad_releases, 0);
    assert!(!diags.has_errors());
}

#[test]
fn diagram_failure_releases_everything() {
    let mut diags = Diagnostics::new();
    let e = state_expr(&mut diags, |b, x| {
        let sum = b.binary(loc(1), BinaryOp::Add, x, int(1));
        b.binary(loc(1), BinaryOp::Div, sum, int(2))
    });
    let mut builder = CountingBuilder {
        reject: Some(BinaryOp::Div),
        ..CountingBuilder::default()
    };
    let out = ctx(&mut diags).with_diagram(&mut builder).run(Op::BuildDiagram, &e);
    assert!(out.into_diagram().is_none());
    assert!(builder.live.is_empty());
    assert_eq!(builder.bad_releases, 0);
    assert!(diags.has_error_code(ErrorCode::DIAGRAM_BUILD_FAILED));
}

#[test]
fn unsupported_subtree_releases_partial_result() {
    let mut diags = Diagnostics::new();
    let e = state_expr(&mut diags, |b, x| {
        let test = b.binary(loc(1), BinaryOp::Lt, x.clone(), int(3));
        let pick = b.cond(loc(1), test, int(1), int(2));
        b.binary(loc(1), BinaryOp::Add, x, pick)
    });
    let mut builder = CountingBuilder::default();
    let out = ctx(&mut diags).with_diagram(&mut builder).run(Op::BuildDiagram, &e);
    assert!(out.into_value().is_null());
    assert!(builder.live.is_empty());
    assert!(builder.next > 0);
    assert!(diags.has_error_code(ErrorCode::DIAGRAM_BUILD_FAILED));
}

#[test]
fn diagram_without_builder_is_reported() {
    let mut diags = Diagnostics::new();
    let e = state_expr(&mut diags, |_, x| x);
    let out = ctx(&mut diags).run(Op::BuildDiagram, &e);
    assert!(out.into_value().is_null());
    assert!(diags.has_error_code(ErrorCode::DIAGRAM_BUILD_FAILED));
}
