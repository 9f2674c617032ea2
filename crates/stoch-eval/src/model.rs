//! Model definitions and the instance memoizer.
//!
//! A [`ModelDef`] is a parameterized model: formal parameters, a body of
//! statements, and the measures the body defines. Instantiating it with
//! actual parameter values builds a [`ModelInstance`] through a
//! [`Formalism`]. The most recent build is memoized and handed out again as
//! long as the parameter values do not change; a rebuild deconstructs the
//! instance it replaces.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use stoch_types::{Location, SharedObject, Value};

use crate::backend::{CompiledModel, Formalism};
use crate::ctx::{Context, Op};
use crate::error::{EvalError, EvalResult};
use crate::expr::{next_id, Expr, ExprKind, NodeId};
use crate::symbol::{Symbol, SymbolKind};

/// Creates a fresh formalism object for each build.
pub type FormalismFactory = Box<dyn Fn() -> Box<dyn Formalism>>;

// ══════════════════════════════════════════════════════════════════════════════
// Instances
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Constructing,
    Ready,
    /// Construction failed; permanent.
    Error,
    Deconstructed,
}

/// One built model.
pub struct ModelInstance {
    id: NodeId,
    model: String,
    label: String,
    params: Vec<Value>,
    state: Cell<InstanceState>,
    compiled: RefCell<Option<Box<dyn CompiledModel>>>,
    measures: Vec<Symbol>,
    measure_memo: RefCell<HashMap<String, Value>>,
}

impl ModelInstance {
    fn new(model: &str, params: Vec<Value>, measures: Vec<Symbol>) -> Self {
        let args: Vec<String> = params.iter().map(Value::to_string).collect();
        Self {
            id: next_id(),
            model: model.to_string(),
            label: format!("{model}({})", args.join(", ")),
            params,
            state: Cell::new(InstanceState::Constructing),
            compiled: RefCell::new(None),
            measures,
            measure_memo: RefCell::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// `Model(p1, p2)`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn state(&self) -> InstanceState {
        self.state.get()
    }

    /// Reachable state count reported by the formalism, if any.
    pub fn num_states(&self) -> Option<u64> {
        self.compiled.borrow().as_ref().and_then(|c| c.num_states())
    }

    fn construction_succeeded(&self, compiled: Box<dyn CompiledModel>) {
        if self.state() == InstanceState::Constructing {
            *self.compiled.borrow_mut() = Some(compiled);
            self.state.set(InstanceState::Ready);
        }
    }

    fn construction_failed(&self) {
        if self.state() == InstanceState::Constructing {
            self.state.set(InstanceState::Error);
        }
    }

    fn deconstruct(&self) {
        tracing::debug!(instance = %self.label, "deconstructing model instance");
        self.state.set(InstanceState::Deconstructed);
        self.compiled.borrow_mut().take();
        self.measure_memo.borrow_mut().clear();
    }

    /// Value of measure `name` of this instance.
    pub fn measure(&self, name: &str, ctx: &mut Context) -> EvalResult<Value> {
        match self.state() {
            InstanceState::Constructing => return Err(EvalError::UnderConstruction(self.label.clone())),
            InstanceState::Error => return Err(EvalError::ConstructionFailed(self.label.clone())),
            InstanceState::Deconstructed => return Err(EvalError::Deconstructed(self.label.clone())),
            InstanceState::Ready => {}
        }
        if let Some(v) = self.measure_memo.borrow().get(name) {
            return Ok(v.clone());
        }
        let Some(symbol) = self.measures.iter().find(|m| m.name() == name) else {
            return Err(EvalError::UndeclaredMeasure {
                model: self.model.clone(),
                measure: name.to_string(),
            });
        };
        let queried = self.compiled.borrow().as_ref().and_then(|c| c.query(name));
        let value = match queried {
            Some(v) => v,
            None => symbol.compute(ctx, symbol.location()),
        };
        if ctx.aborted() {
            return Err(EvalError::Aborted);
        }
        self.measure_memo
            .borrow_mut()
            .insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// This instance as a `model`-typed value.
    pub fn to_value(self: &Rc<Self>) -> Value {
        Value::object(self.clone())
    }
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl SharedObject for ModelInstance {
    fn kind(&self) -> &'static str {
        "model"
    }

    fn equals(&self, other: &dyn SharedObject) -> bool {
        other
            .as_any()
            .downcast_ref::<ModelInstance>()
            .is_some_and(|o| std::ptr::eq(o, self))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Formalism and status of the instance whose body is executing.
pub(crate) struct BuildTarget {
    pub label: String,
    pub formalism: Box<dyn Formalism>,
    pub failed: bool,
}

// ══════════════════════════════════════════════════════════════════════════════
// Definitions
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Memo {
    current_params: Vec<Value>,
    last_params: Vec<Value>,
    last_build: Option<Rc<ModelInstance>>,
}

/// A parameterized model.
pub struct ModelDef {
    name: String,
    location: Location,
    formals: Vec<Symbol>,
    body: Vec<Expr>,
    measures: Vec<Symbol>,
    formalism: FormalismFactory,
    memo: RefCell<Memo>,
    builds: Cell<usize>,
}

impl ModelDef {
    /// Measures are the measure symbols the body defines.
    pub fn new(
        name: impl Into<String>,
        location: Location,
        formals: Vec<Symbol>,
        body: Vec<Expr>,
        formalism: FormalismFactory,
    ) -> Rc<Self> {
        let mut measures = Vec::new();
        collect_measures(&body, &mut measures);
        Rc::new(Self {
            name: name.into(),
            location,
            formals,
            body,
            measures,
            formalism,
            memo: RefCell::new(Memo::default()),
            builds: Cell::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn formals(&self) -> &[Symbol] {
        &self.formals
    }

    pub fn body(&self) -> &[Expr] {
        &self.body
    }

    pub fn measures(&self) -> &[Symbol] {
        &self.measures
    }

    pub fn measure(&self, name: &str) -> Option<&Symbol> {
        self.measures.iter().find(|m| m.name() == name)
    }

    /// Number of instances built so far.
    pub fn builds(&self) -> usize {
        self.builds.get()
    }

    /// Parameter values of the most recent instantiation request.
    pub fn current_params(&self) -> Vec<Value> {
        self.memo.borrow().current_params.clone()
    }

    /// The memoized instance, if any.
    pub fn last_build(&self) -> Option<Rc<ModelInstance>> {
        self.memo.borrow().last_build.clone()
    }

    /// Compute `params` and instantiate with their values.
    pub fn instantiate(self: &Rc<Self>, params: &[Expr], ctx: &mut Context) -> EvalResult<Rc<ModelInstance>> {
        self.check_arity(params.len())?;
        let values: Vec<Value> = params.iter().map(|p| p.compute(ctx)).collect();
        if ctx.aborted() {
            return Err(EvalError::Aborted);
        }
        self.instantiate_values(values, ctx)
    }

    /// Instantiate with already computed parameter values.
    ///
    /// The memoized instance is returned unchanged when every value equals
    /// the one it was built for, under the formal's type.
    pub fn instantiate_values(self: &Rc<Self>, values: Vec<Value>, ctx: &mut Context) -> EvalResult<Rc<ModelInstance>> {
        self.check_arity(values.len())?;
        {
            let mut memo = self.memo.borrow_mut();
            memo.current_params = values.clone();
            if let Some(last) = &memo.last_build {
                if self.same_params(&memo.last_params, &values) {
                    tracing::trace!(instance = %last.label, "model instance reused");
                    return Ok(last.clone());
                }
            }
        }
        self.build(values, ctx)
    }

    fn check_arity(&self, found: usize) -> EvalResult<()> {
        if found != self.formals.len() {
            return Err(EvalError::WrongParamCount {
                model: self.name.clone(),
                expected: self.formals.len(),
                found,
            });
        }
        Ok(())
    }

    fn same_params(&self, last: &[Value], current: &[Value]) -> bool {
        last.len() == current.len()
            && self
                .formals
                .iter()
                .zip(last.iter().zip(current))
                .all(|(f, (a, b))| f.ty().equals(a, b))
    }

    fn build(self: &Rc<Self>, values: Vec<Value>, ctx: &mut Context) -> EvalResult<Rc<ModelInstance>> {
        self.builds.set(self.builds.get() + 1);
        for (formal, v) in self.formals.iter().zip(&values) {
            formal.bind(v.clone());
        }
        for stmt in &self.body {
            ctx.run(Op::ClearCache, stmt);
        }

        let instance = Rc::new(ModelInstance::new(&self.name, values.clone(), self.measures.clone()));
        tracing::debug!(instance = %instance.label, "building model instance");

        // the instance is memoized while under construction, so a request
        // for the same parameters from inside the body gets it back
        let replaced = {
            let mut memo = self.memo.borrow_mut();
            memo.last_params = values;
            memo.last_build.replace(instance.clone())
        };
        if let Some(old) = replaced {
            old.deconstruct();
        }

        let mut formalism = (self.formalism)();
        let built = match formalism.init_model(&instance.label) {
            Err(e) => {
                ctx.user_error(e.code(), &self.location, e.to_string());
                None
            }
            Ok(()) => self.run_body(&instance, formalism, ctx),
        };

        if ctx.aborted() {
            instance.construction_failed();
            let mut memo = self.memo.borrow_mut();
            memo.last_params.clear();
            memo.last_build = None;
            return Err(EvalError::Aborted);
        }
        match built {
            Some(compiled) => instance.construction_succeeded(compiled),
            None => {
                tracing::warn!(instance = %instance.label, "model construction failed");
                instance.construction_failed();
            }
        }
        Ok(instance)
    }

    /// Execute the body against `formalism`; the compiled model on success.
    fn run_body(
        &self,
        instance: &ModelInstance,
        formalism: Box<dyn Formalism>,
        ctx: &mut Context,
    ) -> Option<Box<dyn CompiledModel>> {
        let saved = ctx.building.replace(BuildTarget {
            label: instance.label.clone(),
            formalism,
            failed: false,
        });
        for stmt in &self.body {
            ctx.run(Op::Compute, stmt);
            if ctx.aborted() {
                break;
            }
        }
        let target = std::mem::replace(&mut ctx.building, saved);
        let mut target = target?;
        if target.failed || ctx.aborted() {
            return None;
        }
        match target.formalism.finalize_model() {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                ctx.user_error(e.code(), &self.location, e.to_string());
                None
            }
        }
    }
}

impl fmt::Debug for ModelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDef")
            .field("name", &self.name)
            .field("formals", &self.formals)
            .field("measures", &self.measures)
            .field("builds", &self.builds.get())
            .finish()
    }
}

fn collect_measures(stmts: &[Expr], out: &mut Vec<Symbol>) {
    for stmt in stmts {
        match stmt.kind() {
            ExprKind::Define { target, .. } if target.symbol.kind() == SymbolKind::Measure => {
                if !out.iter().any(|m| m.ptr_eq(&target.symbol)) {
                    out.push(target.symbol.clone());
                }
            }
            ExprKind::Block(inner) | ExprKind::Converge(inner) | ExprKind::ForEach { body: inner, .. } => {
                collect_measures(inner, out)
            }
            _ => {}
        }
    }
}
