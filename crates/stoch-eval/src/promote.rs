//! Implicit promotion and explicit casting of expressions.

use stoch_types::{aggregate_distance, Diagnostic, Diagnostics, ErrorCode, Type};

use crate::expr::{Expr, ExprKind, ExprType};

/// Promote `expr` to `target`, inserting a `Typecast` node when the type
/// changes. Aggregates promote component-wise.
///
/// Returns `None` when the promotion is impossible; the caller reports.
/// Error nodes promote to anything.
pub(crate) fn promote_expr(
    expr: &Expr,
    target: &ExprType,
    diagnostics: &mut Diagnostics,
    warn: bool,
) -> Option<Expr> {
    match (expr.ty(), target) {
        (ExprType::Error, _) => Some(expr.clone()),
        (ExprType::Simple(from), ExprType::Simple(to)) => {
            let distance = from.promotion_distance(*to);
            if distance < 0 {
                return None;
            }
            if distance == 0 {
                return Some(expr.clone());
            }
            if warn {
                diagnostics.push_warning(Diagnostic::warning(
                    ErrorCode::IMPLICIT_PROMOTION,
                    expr.location().clone(),
                    format!("promoting {from} to {to}"),
                ));
            }
            Some(typecast_node(expr, *to))
        }
        (ExprType::Aggregate(from), ExprType::Aggregate(to)) => {
            if aggregate_distance(from, to) < 0 {
                return None;
            }
            let ExprKind::Aggregate(components) = expr.kind() else {
                // An aggregate-typed node that is not an aggregate literal
                // can only be used at its own type.
                return (from == to).then(|| expr.clone());
            };
            let mut promoted = Vec::with_capacity(components.len());
            for (c, t) in components.iter().zip(to.iter()) {
                promoted.push(promote_expr(c, &ExprType::Simple(*t), diagnostics, warn)?);
            }
            if promoted.iter().zip(components).all(|(p, c)| p.ptr_eq(c)) {
                return Some(expr.clone());
            }
            Some(Expr::new(
                expr.location().clone(),
                target.clone(),
                ExprKind::Aggregate(promoted),
            ))
        }
        (ExprType::Void, ExprType::Void) => Some(expr.clone()),
        _ => None,
    }
}

/// Explicit cast; `None` if [`Type::can_cast`] refuses.
pub(crate) fn cast_expr(expr: &Expr, target: Type) -> Option<Expr> {
    let from = expr.simple_type()?;
    if from == target {
        return Some(expr.clone());
    }
    from.can_cast(target).then(|| typecast_node(expr, target))
}

fn typecast_node(expr: &Expr, target: Type) -> Expr {
    Expr::new(
        expr.location().clone(),
        ExprType::Simple(target),
        ExprKind::Typecast(expr.clone()),
    )
}
