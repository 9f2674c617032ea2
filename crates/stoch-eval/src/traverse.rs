//! `Expr::traverse`: one dispatch point for every tree-wide operation.
//!
//! `Compute` on an expression evaluates it; on a statement it executes it.
//! The converge passes (`Guess`, `Update`, `Affix`) and the registration
//! pass (`Block`) only act on statements and are no-ops on expressions. The
//! remaining operations inspect or rewrite the tree without running it.

use stoch_types::{ErrorCode, Location, SimpleType, Type, Value};

use crate::arith;
use crate::backend::{DdEdge, DiagramBuilder};
use crate::compute::compute_within;
use crate::converge;
use crate::ctx::{Context, Op, Output, Range};
use crate::error::DiagramError;
use crate::expr::{BinaryOp, Expr, ExprKind, ExprType, StateVar, Target, UnaryOp};
use crate::internal_error;
use crate::promote::promote_expr;
use crate::symbol::{Symbol, SymbolKind, SymbolState};

impl Expr {
    /// Perform `ctx.op` over this node, writing the result to `ctx.output`.
    ///
    /// Prefer [`Context::run`], which starts from a fresh output slot.
    pub fn traverse(&self, ctx: &mut Context) {
        match ctx.op {
            Op::Compute => self.execute(ctx),
            Op::Guess | Op::Update | Op::Affix | Op::Block => self.execute_pass(ctx),
            Op::PreCompute => {
                if self.pre_compute(ctx) {
                    cache(self, ctx);
                }
            }
            Op::ClearCache => self.clear_caches(),
            Op::Substitute => {
                let e = self.substitute(ctx);
                ctx.output = Output::Expr(e);
            }
            Op::GetSymbols => self.collect_symbols(ctx, false),
            Op::GetMeasures => self.collect_symbols(ctx, true),
            Op::GetVariableDependencies => self.collect_state_vars(ctx),
            Op::FindRange => {
                let r = self.find_range(ctx);
                ctx.output = Output::Range(r);
            }
            Op::BuildDiagram => self.build_diagram(ctx),
            Op::Typecheck => {
                self.typecheck(ctx);
                ctx.output = Output::Type(self.ty().clone());
            }
            Op::Promote => self.promote_to_target(ctx),
            Op::GetType => ctx.output = Output::Type(self.ty().clone()),
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Execution
    // ══════════════════════════════════════════════════════════════════════

    fn execute(&self, ctx: &mut Context) {
        if !self.is_statement() {
            let v = self.compute(ctx);
            ctx.output = Output::Value(v);
            return;
        }
        let loc = self.location();
        if ctx.stop_execution(loc) {
            ctx.output = Output::Value(Value::Null);
            return;
        }
        match self.kind() {
            ExprKind::Block(stmts) => run_all(stmts, ctx),
            ExprKind::Define { target, value } => self.execute_define(target, value, ctx),
            // guesses act in the `Guess` pass only
            ExprKind::Guess { .. } => {}
            ExprKind::Assign { target, value } => self.execute_assign(target, value, ctx),
            ExprKind::Converge(stmts) => {
                let outcome = converge::solve(stmts, loc, ctx);
                ctx.output = Output::Converged(outcome);
            }
            ExprKind::ForEach { iterators, body } => for_each(iterators, body, ctx),
            ExprKind::SetNext { var, value } => self.execute_set_next(var, value, ctx),
            ExprKind::ModelCall { function, args } => self.execute_model_call(function, args, ctx),
            ExprKind::Print(args) => {
                let mut text = String::new();
                for a in args {
                    text.push_str(&compute_within(a, loc, ctx).to_string());
                }
                if !ctx.aborted() {
                    ctx.write_output(loc, &text);
                }
            }
            _ => {}
        }
    }

    /// `Guess`, `Update`, `Affix` and `Block` passes.
    fn execute_pass(&self, ctx: &mut Context) {
        let loc = self.location();
        match self.kind() {
            ExprKind::Block(stmts) | ExprKind::Converge(stmts) => run_all(stmts, ctx),
            ExprKind::ForEach { iterators, body } => for_each(iterators, body, ctx),
            ExprKind::Define { target, value } if ctx.op == Op::Block => {
                self.execute_define(target, value, ctx)
            }
            ExprKind::Guess { target, value } if ctx.op == Op::Guess => {
                let Some(cell) = resolve_cell(target, loc, ctx) else {
                    return;
                };
                let v = compute_within(value, loc, ctx);
                if target.symbol.with_converge_cell(cell, |c| c.guess(v)).is_some() {
                    target.symbol.advance(SymbolState::Guessed);
                }
            }
            ExprKind::Assign { target, .. } => {
                let Some(cell) = resolve_cell(target, loc, ctx) else {
                    return;
                };
                let symbol = &target.symbol;
                match ctx.op {
                    Op::Guess => {
                        let ty = symbol.ty();
                        symbol.with_converge_cell(cell, |c| c.seed(ty));
                    }
                    Op::Update => {
                        symbol.with_converge_cell(cell, |c| c.update());
                    }
                    Op::Affix => {
                        symbol.advance(SymbolState::Computed);
                        symbol.notify_list();
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn execute_define(&self, target: &Target, value: &Expr, ctx: &mut Context) {
        let loc = self.location();
        let symbol = &target.symbol;
        if target.indices.is_empty() {
            symbol.define(value, loc, ctx);
            // constants are evaluated where they are defined; measures on demand
            if ctx.op == Op::Compute
                && symbol.kind() == SymbolKind::Constant
                && symbol.has_fixed_value()
                && symbol.is_available()
            {
                symbol.compute(ctx, loc);
            }
            return;
        }
        let Some(Some(cell)) = resolve_cell(target, loc, ctx) else {
            return;
        };
        // freeze the loop iterators into the cell's definition
        let bound = ctx.run(Op::Substitute, value).into_expr().unwrap_or_else(|| value.clone());
        symbol.define_cell(cell, bound);
    }

    fn execute_assign(&self, target: &Target, value: &Expr, ctx: &mut Context) {
        let loc = self.location();
        let Some(cell) = resolve_cell(target, loc, ctx) else {
            return;
        };
        let v = compute_within(value, loc, ctx);
        if ctx.aborted() {
            return;
        }
        let symbol = &target.symbol;
        let ty = symbol.ty();
        let options = ctx.options.converge.clone();
        let outside_solve = ctx.converge_depth == 0;
        let moved = symbol.with_converge_cell(cell, |c| {
            let moved = c.assign(v, ty, &options);
            if outside_solve {
                c.update();
            }
            moved
        });
        match moved {
            Some(moved) => {
                ctx.repeat |= moved;
                symbol.advance(SymbolState::Defined);
            }
            None => internal_error!(
                ctx,
                ErrorCode::STATE_VIOLATION,
                loc,
                "{} has no converge slot",
                symbol.name()
            ),
        }
    }

    fn execute_set_next(&self, var: &StateVar, value: &Expr, ctx: &mut Context) {
        let loc = self.location();
        let v = compute_within(value, loc, ctx);
        if !ctx.has_next_state() {
            ctx.user_error(
                ErrorCode::MISSING_PROCESS_STATE,
                loc,
                format!("{}' assigned without a next state", var.name),
            );
            ctx.output = Output::Value(Value::Null);
            return;
        }
        let Ok(i) = v.as_int() else {
            // special values are not written
            ctx.output = Output::Value(v);
            return;
        };
        if !(var.lo..=var.hi).contains(&i) {
            ctx.user_error(
                ErrorCode::OUT_OF_BOUNDS,
                loc,
                format!("{i} is outside the range {}..{} of {}", var.lo, var.hi, var.name),
            );
            ctx.output = Output::Value(Value::out_of_bounds(var.name.clone(), v));
            return;
        }
        if !ctx.set_next_state(var.index, i) {
            ctx.user_error(
                ErrorCode::MISSING_PROCESS_STATE,
                loc,
                format!("next state has no slot for {}", var.name),
            );
        }
    }

    fn execute_model_call(&self, function: &str, args: &[Expr], ctx: &mut Context) {
        let loc = self.location();
        let values: Vec<Value> = args.iter().map(|a| compute_within(a, loc, ctx)).collect();
        if ctx.aborted() {
            return;
        }
        let result = ctx.building.as_mut().map(|target| {
            tracing::trace!(instance = %target.label, function, "formalism call");
            target.formalism.call(function, &values).inspect_err(|_| target.failed = true)
        });
        match result {
            None => ctx.user_error(
                ErrorCode::FORMALISM_ERROR,
                loc,
                format!("{function}(...) is only allowed inside a model"),
            ),
            Some(Err(e)) => ctx.user_error(e.code(), loc, e.to_string()),
            Some(Ok(())) => {}
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Caches
    // ══════════════════════════════════════════════════════════════════════

    /// Visit the subtree; true if this node's value can be cached.
    fn pre_compute(&self, ctx: &mut Context) -> bool {
        let children = self.kind().children();
        let flags: Vec<bool> = children.iter().map(|c| c.pre_compute(ctx)).collect();
        let own = match self.kind() {
            ExprKind::Symbol(s) => s.is_stable() && s.is_available(),
            ExprKind::ArrayCell { array, .. } => array.is_stable(),
            ExprKind::Error
            | ExprKind::Random { .. }
            | ExprKind::StateVar(_)
            | ExprKind::MeasureCall { .. } => false,
            k => !k.is_statement(),
        };
        let stable = own && flags.iter().all(|f| *f);
        if !stable {
            for (child, flag) in children.into_iter().zip(flags) {
                if flag {
                    cache(child, ctx);
                }
            }
        }
        stable
    }

    fn clear_caches(&self) {
        self.set_cache(None);
        if let ExprKind::Define { target, .. } = self.kind() {
            target.symbol.clear_cache();
        }
        for c in self.kind().children() {
            c.clear_caches();
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Rewriting and queries
    // ══════════════════════════════════════════════════════════════════════

    /// Inline the current value of every inlinable symbol. Subtrees with
    /// nothing to inline come back shared.
    fn substitute(&self, ctx: &mut Context) -> Expr {
        if let ExprKind::Symbol(s) = self.kind() {
            if s.is_inlinable() {
                let v = s.compute(ctx, self.location());
                return self.rebuilt(ExprKind::Const(v));
            }
            return self.clone();
        }
        match self.kind().map_children(|c| c.substitute(ctx)) {
            Some(kind) => self.rebuilt(kind),
            None => self.clone(),
        }
    }

    fn collect_symbols(&self, ctx: &mut Context, measures_only: bool) {
        let wanted = |s: &Symbol| !measures_only || s.kind() == SymbolKind::Measure;
        match self.kind() {
            ExprKind::Symbol(s) if wanted(s) => ctx.collect_symbol(s),
            ExprKind::ArrayCell { array, .. } if wanted(array) => ctx.collect_symbol(array),
            ExprKind::Define { target, .. } | ExprKind::Guess { target, .. } | ExprKind::Assign { target, .. }
                if wanted(&target.symbol) =>
            {
                ctx.collect_symbol(&target.symbol)
            }
            ExprKind::MeasureCall { model, measure, .. } if measures_only => {
                if let Some(m) = model.measure(measure) {
                    ctx.collect_symbol(m);
                }
            }
            _ => {}
        }
        for c in self.kind().children() {
            c.collect_symbols(ctx, measures_only);
        }
    }

    fn collect_state_vars(&self, ctx: &mut Context) {
        if let ExprKind::StateVar(v) = self.kind() {
            ctx.collect_state_var(v.index, &v.name);
        }
        for c in self.kind().children() {
            c.collect_state_vars(ctx);
        }
    }

    /// Conservative interval of the values this expression can take.
    fn find_range(&self, ctx: &mut Context) -> Range {
        match self.kind() {
            ExprKind::Const(v) => Range::point(v.clone()),
            ExprKind::StateVar(v) => Range::new(Value::int(v.lo), Value::int(v.hi)),
            ExprKind::Symbol(s) if s.is_inlinable() => Range::point(s.compute(ctx, self.location())),
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => {
                let r = operand.find_range(ctx);
                match (arith::neg(&r.hi), arith::neg(&r.lo)) {
                    (Ok(lo), Ok(hi)) if r.is_known() => Range::new(lo, hi),
                    _ => Range::unknown(),
                }
            }
            ExprKind::Binary {
                op: BinaryOp::Sub,
                left,
                right,
            } => {
                let a = left.find_range(ctx);
                let b = right.find_range(ctx);
                match (arith::sub(&a.lo, &b.hi), arith::sub(&a.hi, &b.lo)) {
                    (Ok(lo), Ok(hi)) if a.is_known() && b.is_known() => Range::new(lo, hi),
                    _ => Range::unknown(),
                }
            }
            ExprKind::Assoc {
                op: op @ (BinaryOp::Add | BinaryOp::Mul),
                operands,
            } => {
                let mut ranges = operands.iter().map(|o| o.find_range(ctx)).collect::<Vec<_>>().into_iter();
                let Some(first) = ranges.next() else {
                    return Range::unknown();
                };
                ranges.try_fold(first, |acc, r| match op {
                    BinaryOp::Add => range_add(&acc, &r),
                    _ => range_mul(&acc, &r),
                })
                .unwrap_or_else(Range::unknown)
            }
            ExprKind::Cond { then, otherwise, .. } => {
                let a = then.find_range(ctx);
                let b = otherwise.find_range(ctx);
                if !(a.is_known() && b.is_known()) {
                    return Range::unknown();
                }
                Range::new(arith::min(&a.lo, &b.lo), arith::max(&a.hi, &b.hi))
            }
            ExprKind::Typecast(inner) => {
                let r = inner.find_range(ctx);
                let Some(t) = self.simple_type() else {
                    return Range::unknown();
                };
                match (arith::convert(r.lo.clone(), t), arith::convert(r.hi.clone(), t)) {
                    (Ok(lo), Ok(hi)) if r.is_known() => Range::new(lo, hi),
                    _ => Range::unknown(),
                }
            }
            _ => Range::unknown(),
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Decision diagrams
    // ══════════════════════════════════════════════════════════════════════

    fn build_diagram(&self, ctx: &mut Context) {
        let loc = self.location();
        let Some(builder) = ctx.diagram.take() else {
            ctx.user_error(
                ErrorCode::DIAGRAM_BUILD_FAILED,
                loc,
                "no decision-diagram builder available",
            );
            ctx.output = Output::Value(Value::Null);
            return;
        };
        let result = self.diagram(&mut *builder, ctx);
        ctx.diagram = Some(builder);
        match result {
            Ok(edge) => ctx.output = Output::Diagram(edge),
            Err(e) => {
                tracing::debug!(location = %loc, error = %e, "diagram build failed");
                ctx.user_error(
                    ErrorCode::DIAGRAM_BUILD_FAILED,
                    loc,
                    format!("cannot build a decision diagram for {self}: {e}"),
                );
                ctx.output = Output::Value(Value::Null);
            }
        }
    }

    /// Every edge this returns is owned by the caller; intermediate edges
    /// are released as soon as they are combined or on failure.
    fn diagram(&self, b: &mut dyn DiagramBuilder, ctx: &mut Context) -> Result<DdEdge, DiagramError> {
        match self.kind() {
            ExprKind::Const(v) => b.constant(v),
            ExprKind::StateVar(v) => b.variable(v.index, &v.name),
            ExprKind::Symbol(s) if s.is_inlinable() => {
                let v = s.compute(ctx, self.location());
                b.constant(&v)
            }
            ExprKind::Typecast(inner) => inner.diagram(b, ctx),
            ExprKind::Unary { op, operand } => {
                let a = operand.diagram(b, ctx)?;
                let out = b.unary(*op, a);
                b.release(a);
                out
            }
            ExprKind::Binary { op, left, right } => {
                let a = left.diagram(b, ctx)?;
                combine(b, *op, a, right, ctx)
            }
            ExprKind::Assoc { op, operands } => {
                let Some((first, rest)) = operands.split_first() else {
                    return Err(DiagramError::Unsupported("empty operand list".into()));
                };
                let mut acc = first.diagram(b, ctx)?;
                for e in rest {
                    acc = combine(b, *op, acc, e, ctx)?;
                }
                Ok(acc)
            }
            other => Err(DiagramError::Unsupported(format!("{} node", other.name()))),
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Typing
    // ══════════════════════════════════════════════════════════════════════

    fn typecheck(&self, ctx: &mut Context) {
        let children = self.kind().children();
        for c in &children {
            c.typecheck(ctx);
        }
        if self.is_error() || children.iter().any(|c| c.is_error()) {
            return;
        }
        if let Err(msg) = self.check_node() {
            ctx.user_error(ErrorCode::TYPE_MISMATCH, self.location(), msg);
        }
    }

    /// Typing rules of this node alone.
    fn check_node(&self) -> Result<(), String> {
        let simple = |e: &Expr| e.simple_type().ok_or_else(|| format!("{e} is not of a simple type"));
        let promotes = |e: &Expr, to: Type| -> Result<(), String> {
            let from = simple(e)?;
            if from.promotes_to(to) {
                Ok(())
            } else {
                Err(format!("{e} of type {from} does not promote to {to}"))
            }
        };
        match self.kind() {
            ExprKind::Unary { op, operand } => {
                let t = simple(operand)?;
                let ok = match op {
                    UnaryOp::Neg => t.is_numeric(),
                    UnaryOp::Not => t.base() == SimpleType::Bool,
                };
                ok.then_some(()).ok_or_else(|| format!("cannot apply {op:?} to {t}"))
            }
            ExprKind::Binary { left, right, .. } => {
                let (a, b) = (simple(left)?, simple(right)?);
                a.least_common_type(b)
                    .map(|_| ())
                    .ok_or_else(|| format!("no common type for {a} and {b}"))
            }
            ExprKind::Assoc { operands, .. } => {
                let t = simple(self)?;
                operands.iter().try_for_each(|o| promotes(o, t))
            }
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            } => {
                if simple(cond)?.base() != SimpleType::Bool {
                    return Err(format!("condition {cond} is not boolean"));
                }
                let t = simple(self)?;
                promotes(then, t)?;
                promotes(otherwise, t)
            }
            ExprKind::Typecast(inner) => {
                let (from, to) = (simple(inner)?, simple(self)?);
                from.can_cast(to)
                    .then_some(())
                    .ok_or_else(|| format!("cannot cast {from} to {to}"))
            }
            ExprKind::Aggregate(components) => match self.ty() {
                ExprType::Aggregate(types) if types.len() == components.len() => components
                    .iter()
                    .zip(types.iter())
                    .try_for_each(|(c, t)| promotes(c, *t)),
                _ => Err(format!("aggregate {self} does not match its type {}", self.ty())),
            },
            ExprKind::ArrayCell { array, indices } => check_indices(array, indices),
            ExprKind::Random { dist, params } => {
                let types = dist.params();
                if types.len() != params.len() {
                    return Err(format!(
                        "{} expects {} parameter(s), got {}",
                        dist.name(),
                        types.len(),
                        params.len()
                    ));
                }
                params.iter().zip(types).try_for_each(|(p, t)| promotes(p, *t))
            }
            ExprKind::Define { target, value }
            | ExprKind::Guess { target, value }
            | ExprKind::Assign { target, value } => {
                if !target.indices.is_empty() || target.symbol.dimensions().is_some() {
                    check_indices(&target.symbol, &target.indices)?;
                }
                promotes(value, target.symbol.ty())
            }
            ExprKind::SetNext { value, .. } => promotes(value, Type::PROC_INT),
            _ => Ok(()),
        }
    }

    fn promote_to_target(&self, ctx: &mut Context) {
        let loc = self.location();
        let Some(target) = ctx.promote_target.clone() else {
            internal_error!(
                ctx,
                ErrorCode::UNHANDLED_TRAVERSAL,
                loc,
                "promote traversal without a target type"
            );
            return;
        };
        let warn = ctx.options.warn_on_promotion;
        match promote_expr(self, &target, ctx.diagnostics, warn) {
            Some(e) => ctx.output = Output::Expr(e),
            None => {
                ctx.user_error(
                    ErrorCode::TYPE_MISMATCH,
                    loc,
                    format!("cannot promote {} to {target}", self.ty()),
                );
                ctx.output = Output::Expr(Expr::error(loc.clone()));
            }
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn run_all(stmts: &[Expr], ctx: &mut Context) {
    for s in stmts {
        s.traverse(ctx);
        if ctx.aborted() {
            break;
        }
    }
}

/// Run `body` once per point of the iterators' cartesian product, last
/// iterator fastest.
fn for_each(iterators: &[Symbol], body: &[Expr], ctx: &mut Context) {
    let domains: Vec<Vec<Value>> = iterators
        .iter()
        .map(|i| i.domain().map(|d| d.iter().cloned().collect()).unwrap_or_default())
        .collect();
    if domains.iter().any(Vec::is_empty) {
        return;
    }
    let mut pos = vec![0usize; domains.len()];
    'points: loop {
        for (it, (domain, p)) in iterators.iter().zip(domains.iter().zip(&pos)) {
            it.set_iterator(domain[*p].clone());
        }
        run_all(body, ctx);
        if ctx.aborted() {
            break;
        }
        let mut k = pos.len();
        loop {
            if k == 0 {
                break 'points;
            }
            k -= 1;
            pos[k] += 1;
            if pos[k] < domains[k].len() {
                break;
            }
            pos[k] = 0;
        }
    }
    for it in iterators {
        it.set_iterator(Value::Null);
    }
}

/// Cell addressed by a statement target: `Some(None)` for a scalar symbol,
/// `Some(Some(i))` for an array cell, `None` after reporting a bad index.
fn resolve_cell(target: &Target, loc: &Location, ctx: &mut Context) -> Option<Option<usize>> {
    if target.indices.is_empty() {
        return Some(None);
    }
    let symbol = &target.symbol;
    let Some(data) = symbol.array_data() else {
        internal_error!(ctx, ErrorCode::INTERNAL, loc, "{} is not an array", symbol.name());
        return None;
    };
    let mut values = Vec::with_capacity(target.indices.len());
    for i in &target.indices {
        let v = compute_within(i, loc, ctx);
        if !v.is_normal() {
            return None;
        }
        values.push(v);
    }
    match data.flat_index(&values) {
        Ok(cell) => Some(Some(cell)),
        Err(bad) => {
            let iterator = data.iterator_names.get(bad.dimension).map(String::as_str).unwrap_or("?");
            ctx.user_error(
                ErrorCode::BAD_VALUE,
                loc,
                format!(
                    "index {} is outside the range of iterator {iterator} of array {}",
                    bad.value,
                    symbol.name()
                ),
            );
            None
        }
    }
}

/// Cache the value of a stable subtree. Constants need no cache.
fn cache(expr: &Expr, ctx: &mut Context) {
    if expr.is_statement() || matches!(expr.kind(), ExprKind::Const(_)) {
        return;
    }
    let v = expr.compute(ctx);
    if !ctx.aborted() {
        expr.set_cache(Some(v));
    }
}

fn check_indices(array: &Symbol, indices: &[Expr]) -> Result<(), String> {
    let dims = array.dimensions().unwrap_or(0);
    if dims != indices.len() {
        return Err(format!("{} has {dims} dimension(s), got {} index(es)", array.name(), indices.len()));
    }
    for i in indices {
        match i.simple_type() {
            Some(t) if t.base() == SimpleType::Int => {}
            _ => return Err(format!("index {i} is not an integer")),
        }
    }
    Ok(())
}

fn combine(
    b: &mut dyn DiagramBuilder,
    op: BinaryOp,
    acc: DdEdge,
    next: &Expr,
    ctx: &mut Context,
) -> Result<DdEdge, DiagramError> {
    let e = match next.diagram(b, ctx) {
        Ok(e) => e,
        Err(err) => {
            b.release(acc);
            return Err(err);
        }
    };
    let out = b.apply(op, acc, e);
    b.release(acc);
    b.release(e);
    out
}

fn range_add(a: &Range, b: &Range) -> Option<Range> {
    if !(a.is_known() && b.is_known()) {
        return None;
    }
    let lo = arith::add(&a.lo, &b.lo).ok()?;
    let hi = arith::add(&a.hi, &b.hi).ok()?;
    Some(Range::new(lo, hi))
}

fn range_mul(a: &Range, b: &Range) -> Option<Range> {
    if !(a.is_known() && b.is_known()) {
        return None;
    }
    let corners = [
        arith::mul(&a.lo, &b.lo).ok()?,
        arith::mul(&a.lo, &b.hi).ok()?,
        arith::mul(&a.hi, &b.lo).ok()?,
        arith::mul(&a.hi, &b.hi).ok()?,
    ];
    let lo = corners.iter().skip(1).fold(corners[0].clone(), |m, c| arith::min(&m, c));
    let hi = corners.iter().skip(1).fold(corners[0].clone(), |m, c| arith::max(&m, c));
    Some(Range::new(lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprBuilder;
    use crate::options::EngineOptions;
    use stoch_types::{Diagnostics, SetObject};

    fn loc() -> Location {
        Location::new("t.sm", 9)
    }

    #[test]
    fn test_for_each_visits_row_major() {
        let mut diags = Diagnostics::new();
        let i = Symbol::iterator("i", SetObject::int_range(1, 2), loc());
        let j = Symbol::iterator("j", SetObject::int_range(1, 3), loc());
        let a = Symbol::array("a", Type::INT, loc(), &[i.clone(), j.clone()]).unwrap();
        let def = {
            let mut b = ExprBuilder::new(&mut diags);
            let ten_i = b.binary(loc(), BinaryOp::Mul, Expr::int(loc(), 10), Expr::symbol(loc(), &i));
            let value = b.binary(loc(), BinaryOp::Add, ten_i, Expr::symbol(loc(), &j));
            b.define_cell(
                loc(),
                &a,
                vec![Expr::symbol(loc(), &i), Expr::symbol(loc(), &j)],
                value,
            )
        };
        let looped = Expr::for_each(loc(), vec![i, j], vec![def]);
        let read = ExprBuilder::new(&mut diags).array_cell(loc(), &a, vec![Expr::int(loc(), 2), Expr::int(loc(), 3)]);
        let mut ctx = Context::new(&mut diags).with_options(EngineOptions::degrading());
        ctx.run(Op::Compute, &looped);
        assert_eq!(ctx.compute(&read).as_int(), Ok(23));
    }

    #[test]
    fn test_find_range_of_linear_expression() {
        let mut diags = Diagnostics::new();
        let x = StateVar::new(0, "x", 0, 4);
        let e = {
            let mut b = ExprBuilder::new(&mut diags);
            let twice = b.binary(loc(), BinaryOp::Mul, Expr::int(loc(), 2), Expr::state_var(loc(), &x));
            b.binary(loc(), BinaryOp::Sub, twice, Expr::int(loc(), 1))
        };
        let mut ctx = Context::new(&mut diags);
        let r = ctx.run(Op::FindRange, &e).into_range();
        assert_eq!(r.lo.as_int(), Ok(-1));
        assert_eq!(r.hi.as_int(), Ok(7));
    }

    #[test]
    fn test_get_variable_dependencies() {
        let mut diags = Diagnostics::new();
        let x = StateVar::new(3, "x", 0, 4);
        let y = StateVar::new(1, "y", 0, 4);
        let e = ExprBuilder::new(&mut diags).binary(
            loc(),
            BinaryOp::Add,
            Expr::state_var(loc(), &x),
            Expr::state_var(loc(), &y),
        );
        let mut ctx = Context::new(&mut diags);
        let vars = ctx.run(Op::GetVariableDependencies, &e).into_state_vars();
        assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec![(1, "y".to_string()), (3, "x".to_string())]);
    }

    #[test]
    fn test_pre_compute_caches_stable_operand() {
        let mut diags = Diagnostics::new();
        let c = Symbol::constant("c", Type::INT, loc());
        let x = StateVar::new(0, "x", 0, 9);
        let sum = {
            let mut b = ExprBuilder::new(&mut diags);
            let stable = b.binary(loc(), BinaryOp::Mul, Expr::symbol(loc(), &c), Expr::int(loc(), 3));
            b.binary(loc(), BinaryOp::Sub, Expr::state_var(loc(), &x), stable)
        };
        // the stable operand arrives wrapped in its promotion to proc int
        let ExprKind::Binary { left, right, .. } = sum.kind() else {
            panic!("expected binary node");
        };
        let mut ctx = Context::new(&mut diags);
        c.define(&Expr::int(loc(), 2), &loc(), &mut ctx);
        ctx.run(Op::PreCompute, &sum);
        assert_eq!(right.cached().and_then(|v| v.as_int().ok()), Some(6));
        assert!(left.cached().is_none());
        assert!(sum.cached().is_none());
        ctx.run(Op::ClearCache, &sum);
        assert!(right.cached().is_none());
    }

    #[test]
    fn test_promote_without_target_is_internal_error() {
        let mut diags = Diagnostics::new();
        let mut ctx = Context::new(&mut diags).with_options(EngineOptions::degrading());
        ctx.run(Op::Promote, &Expr::int(loc(), 1));
        drop(ctx);
        assert!(diags.has_internal());
    }
}
