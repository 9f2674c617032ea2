//! `Compute`: evaluating expressions to values.
//!
//! Errors never abort evaluation. A construct that cannot produce a value
//! reports a user error (or an internal error, for engine invariants) and
//! yields `Null`; special operand values propagate without a report.

use rand::Rng;
use stoch_types::{ErrorCode, Location, Payload, Type, Value};

use crate::arith::{self, Fault};
use crate::ctx::Context;
use crate::expr::{BinaryOp, Distribution, Expr, ExprKind, UnaryOp};
use crate::internal_error;

impl Expr {
    /// Evaluate this expression.
    ///
    /// Statements are not computable: computing one is an internal error
    /// and yields `Null`.
    pub fn compute(&self, ctx: &mut Context) -> Value {
        if let Some(v) = self.cached() {
            return v;
        }
        let loc = self.location();
        match self.kind() {
            ExprKind::Const(v) => v.clone(),
            ExprKind::Error => Value::Null,
            ExprKind::Symbol(s) => s.compute(ctx, loc),
            ExprKind::Unary { op, operand } => {
                let v = operand.compute(ctx);
                let r = match op {
                    UnaryOp::Neg => arith::neg(&v),
                    UnaryOp::Not => arith::not(&v),
                };
                fault_to_null(r, ctx, loc)
            }
            ExprKind::Binary { op, left, right } => {
                let a = left.compute(ctx);
                let b = right.compute(ctx);
                let operand_ty = left.simple_type().unwrap_or(Type::REAL);
                fault_to_null(arith::apply(*op, operand_ty, &a, &b), ctx, loc)
            }
            ExprKind::Assoc { op, operands } => match op {
                BinaryOp::And => logical(operands, false, ctx),
                BinaryOp::Or => logical(operands, true, ctx),
                _ => {
                    let ty = self.simple_type().unwrap_or(Type::REAL);
                    let mut acc = operands.first().map(|e| e.compute(ctx)).unwrap_or(Value::Null);
                    for e in operands.iter().skip(1) {
                        if acc.is_null() {
                            break;
                        }
                        let v = e.compute(ctx);
                        acc = match arith::apply(*op, ty, &acc, &v) {
                            Ok(r) => r,
                            Err(fault) => return report_fault(fault, ctx, loc),
                        };
                    }
                    acc
                }
            },
            ExprKind::Cond {
                cond,
                then,
                otherwise,
            } => match cond.compute(ctx) {
                Value::Normal(Payload::Bool(true)) => then.compute(ctx),
                Value::Normal(Payload::Bool(false)) => otherwise.compute(ctx),
                Value::Normal(_) | Value::Infinity(_) => {
                    internal_error!(ctx, ErrorCode::PAYLOAD_MISMATCH, loc, "condition is not boolean");
                    Value::Null
                }
                special => special,
            },
            ExprKind::Typecast(inner) => {
                let v = inner.compute(ctx);
                match self.simple_type() {
                    Some(t) => fault_to_null(arith::convert(v, t), ctx, loc),
                    None => v,
                }
            }
            ExprKind::Aggregate(components) => match components.get(ctx.component) {
                Some(c) => c.compute(ctx),
                None => {
                    internal_error!(
                        ctx,
                        ErrorCode::INTERNAL,
                        loc,
                        "aggregate has no component {}",
                        ctx.component
                    );
                    Value::Null
                }
            },
            ExprKind::ArrayCell { array, indices } => {
                let mut values = Vec::with_capacity(indices.len());
                for i in indices {
                    let v = i.compute(ctx);
                    if !v.is_normal() {
                        return v;
                    }
                    values.push(v);
                }
                let Some(data) = array.array_data() else {
                    internal_error!(ctx, ErrorCode::INTERNAL, loc, "{} is not an array", array.name());
                    return Value::Null;
                };
                match data.flat_index(&values) {
                    Ok(cell) => array.cell_value(cell, &values, ctx, loc),
                    Err(bad) => {
                        let iterator = data
                            .iterator_names
                            .get(bad.dimension)
                            .map(String::as_str)
                            .unwrap_or("?");
                        ctx.user_error(
                            ErrorCode::BAD_VALUE,
                            loc,
                            format!(
                                "index {} is outside the range of iterator {iterator} of array {}",
                                bad.value,
                                array.name()
                            ),
                        );
                        Value::Null
                    }
                }
            }
            ExprKind::Random { dist, params } => {
                let values: Vec<Value> = params.iter().map(|p| p.compute(ctx)).collect();
                sample(*dist, &values, ctx, loc)
            }
            ExprKind::StateVar(var) => match ctx.current_state() {
                Some(state) => match state.get(var.index) {
                    Some(v) => Value::int(*v),
                    None => {
                        ctx.user_error(
                            ErrorCode::MISSING_PROCESS_STATE,
                            loc,
                            format!("state has no slot for variable {}", var.name),
                        );
                        Value::Null
                    }
                },
                None => {
                    ctx.user_error(
                        ErrorCode::MISSING_PROCESS_STATE,
                        loc,
                        format!("state variable {} read without a current state", var.name),
                    );
                    Value::Null
                }
            },
            ExprKind::MeasureCall {
                model,
                params,
                measure,
            } => {
                let instance = match model.instantiate(params, ctx) {
                    Ok(instance) => instance,
                    Err(e) => {
                        ctx.user_error(e.code(), loc, e.to_string());
                        return Value::Null;
                    }
                };
                match instance.measure(measure, ctx) {
                    Ok(v) => v,
                    Err(e) => {
                        ctx.user_error(e.code(), loc, e.to_string());
                        Value::Null
                    }
                }
            }
            statement => {
                internal_error!(
                    ctx,
                    ErrorCode::NOT_COMPUTABLE,
                    loc,
                    "{} statement cannot be computed",
                    statement.name()
                );
                Value::Null
            }
        }
    }
}

fn report_fault(fault: Fault, ctx: &mut Context, loc: &Location) -> Value {
    ctx.user_error(fault.code, loc, fault.message);
    Value::Null
}

fn fault_to_null(result: Result<Value, Fault>, ctx: &mut Context, loc: &Location) -> Value {
    result.unwrap_or_else(|fault| report_fault(fault, ctx, loc))
}

/// Three-valued `&` / `|` with short circuit: `absorbing` is the value that
/// decides the result on its own (`false` for and, `true` for or).
fn logical(operands: &[Expr], absorbing: bool, ctx: &mut Context) -> Value {
    let mut special: Option<Value> = None;
    for e in operands {
        match e.compute(ctx) {
            Value::Normal(Payload::Bool(b)) if b == absorbing => return Value::bool(absorbing),
            Value::Normal(Payload::Bool(_)) => {}
            Value::Null => special = Some(Value::Null),
            other => {
                if !matches!(special, Some(Value::Null)) {
                    special = Some(if other.is_out_of_bounds() { other } else { Value::Unknown });
                }
            }
        }
    }
    special.unwrap_or(Value::bool(!absorbing))
}

fn sample(dist: Distribution, params: &[Value], ctx: &mut Context, loc: &Location) -> Value {
    for p in params {
        if !p.is_normal() {
            return p.clone();
        }
    }
    let check = match dist {
        Distribution::Uniform => match (params[0].as_number(), params[1].as_number()) {
            (Ok(a), Ok(b)) if a < b => Ok(()),
            _ => Err(format!("uniform({}, {}) needs a < b", params[0], params[1])),
        },
        Distribution::Expo => match params[0].as_number() {
            Ok(rate) if rate > 0.0 && rate.is_finite() => Ok(()),
            _ => Err(format!("expo({}) needs a positive rate", params[0])),
        },
        Distribution::Equilikely => match (params[0].as_int(), params[1].as_int()) {
            (Ok(a), Ok(b)) if a <= b => Ok(()),
            _ => Err(format!("equilikely({}, {}) needs a <= b", params[0], params[1])),
        },
        Distribution::Bernoulli => match params[0].as_number() {
            Ok(p) if (0.0..=1.0).contains(&p) => Ok(()),
            _ => Err(format!("bernoulli({}) needs 0 <= p <= 1", params[0])),
        },
    };
    if let Err(msg) = check {
        ctx.user_error(ErrorCode::BAD_VALUE, loc, msg);
        return Value::Null;
    }
    let Some(rng) = ctx.rng() else {
        ctx.user_error(
            ErrorCode::MISSING_RANDOM_STREAM,
            loc,
            format!("{} needs a random stream", dist.name()),
        );
        return Value::Null;
    };
    let number = |v: &Value| v.as_number().unwrap_or(0.0);
    match dist {
        Distribution::Uniform => {
            let (a, b) = (number(&params[0]), number(&params[1]));
            Value::real(a + (b - a) * rng.gen::<f64>())
        }
        Distribution::Expo => {
            let u: f64 = rng.gen();
            Value::real(-(1.0 - u).ln() / number(&params[0]))
        }
        Distribution::Equilikely => {
            let (a, b) = (params[0].as_int().unwrap_or(0), params[1].as_int().unwrap_or(0));
            Value::int(rng.gen_range(a..=b))
        }
        Distribution::Bernoulli => Value::bool(rng.gen::<f64>() < number(&params[0])),
    }
}

/// Shortcut used by statements: compute and keep `loc` as error parent.
pub(crate) fn compute_within(expr: &Expr, parent: &Location, ctx: &mut Context) -> Value {
    let saved = ctx.parent.replace(parent.clone());
    let v = expr.compute(ctx);
    ctx.parent = saved;
    v
}
