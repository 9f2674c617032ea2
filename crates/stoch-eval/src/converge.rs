//! Fixpoint solver for `converge { ... }` blocks.
//!
//! A converge block is a list of `guess` and assignment statements over
//! converge variables. Solving runs a `Guess` pass to seed every variable,
//! then repeats `Compute` passes until no assignment moves its variable by
//! more than the configured precision. Between passes an `Update` traversal
//! copies each variable's update slot into its current slot.
//!
//! With `use_current` set, a variable assigned earlier in a pass is read
//! from its update slot by the statements after it (Gauss-Seidel style);
//! otherwise every read in a pass sees the previous pass (Jacobi).

use serde::{Deserialize, Serialize};
use stoch_types::{ErrorCode, Location, SimpleType, Type, Value};

use crate::ctx::{Context, Op};
use crate::expr::Expr;
use crate::options::{ConvergeOptions, PrecisionMode};

/// Result of solving one converge block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergeOutcome {
    /// Compute passes performed.
    pub iterations: usize,
    /// False when the iteration limit was hit or the solve was aborted.
    pub converged: bool,
}

/// Current/update value pair of one converge variable (or array cell).
#[derive(Debug, Clone)]
pub(crate) struct ConvergeCell {
    pub current: Value,
    pub update: Value,
    /// Assigned during the pass in progress.
    pub assigned: bool,
    pub guessed: bool,
}

impl Default for ConvergeCell {
    fn default() -> Self {
        Self {
            current: Value::Null,
            update: Value::Null,
            assigned: false,
            guessed: false,
        }
    }
}

impl ConvergeCell {
    pub fn read(&self, use_current: bool) -> Value {
        if use_current && self.assigned {
            self.update.clone()
        } else {
            self.current.clone()
        }
    }

    pub fn guess(&mut self, value: Value) {
        self.current = value;
        self.guessed = true;
    }

    /// Start from zero when no guess was given.
    pub fn seed(&mut self, ty: Type) {
        if self.guessed {
            return;
        }
        self.current = match ty.base() {
            SimpleType::Int => Value::int(0),
            SimpleType::Real => Value::real(0.0),
            SimpleType::Bool => Value::bool(false),
            _ => Value::Null,
        };
        self.guessed = true;
    }

    /// Record a new value; true if it moved beyond the precision.
    pub fn assign(&mut self, value: Value, ty: Type, options: &ConvergeOptions) -> bool {
        let moved = moved(ty, &self.current, &value, options);
        self.update = value;
        self.assigned = true;
        moved
    }

    pub fn update(&mut self) {
        if self.assigned {
            self.current = self.update.clone();
            self.assigned = false;
        }
    }
}

/// True if `update` differs from `current` by more than the precision.
///
/// Non-numeric values (and special values) move whenever they differ under
/// the type's equality.
pub(crate) fn moved(ty: Type, current: &Value, update: &Value, options: &ConvergeOptions) -> bool {
    match (current.as_number(), update.as_number()) {
        (Ok(c), Ok(u)) => {
            let diff = (u - c).abs();
            let scaled = match options.precision_mode {
                PrecisionMode::Relative if c != 0.0 => diff / c.abs(),
                _ => diff,
            };
            scaled > options.precision
        }
        _ => !ty.equals(current, update),
    }
}

/// Solve the converge block made of `stmts`.
///
/// Only the topmost block of a nest seeds with `Guess` and freezes its
/// variables with `Affix`; nested blocks iterate inside each pass of the
/// enclosing one.
pub(crate) fn solve(stmts: &[Expr], location: &Location, ctx: &mut Context) -> ConvergeOutcome {
    let topmost = ctx.converge_depth == 0;
    ctx.converge_depth += 1;
    let saved_repeat = ctx.repeat;

    if topmost {
        for s in stmts {
            ctx.run(Op::Guess, s);
        }
    }

    let max = ctx.options.converge.max_iterations;
    let mut outcome = ConvergeOutcome {
        iterations: 0,
        converged: false,
    };
    let mut moved_any = false;
    while outcome.iterations < max {
        if ctx.stop_execution(location) {
            break;
        }
        outcome.iterations += 1;
        ctx.repeat = false;
        for s in stmts {
            ctx.run(Op::Compute, s);
        }
        for s in stmts {
            ctx.run(Op::Update, s);
        }
        tracing::trace!(
            location = %location,
            iteration = outcome.iterations,
            repeat = ctx.repeat,
            "converge pass"
        );
        if !ctx.repeat {
            outcome.converged = true;
            break;
        }
        moved_any = true;
    }

    // a nested block that moved forces another pass of the enclosing one
    ctx.repeat = saved_repeat || (!topmost && moved_any);
    ctx.converge_depth -= 1;

    if ctx.aborted() {
        return outcome;
    }
    if !outcome.converged {
        ctx.warning(
            ErrorCode::NOT_CONVERGED,
            location,
            format!("converge block did not converge in {} iterations", outcome.iterations),
        );
    }
    if topmost {
        for s in stmts {
            ctx.run(Op::Affix, s);
        }
    }
    tracing::debug!(
        location = %location,
        iterations = outcome.iterations,
        converged = outcome.converged,
        "converge block solved"
    );
    outcome
}
