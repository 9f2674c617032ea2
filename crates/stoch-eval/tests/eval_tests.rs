//! Integration tests for expression evaluation and traversals.
//!
//! Covers:
//! - arithmetic and special-value propagation
//! - arrays and `for` loops
//! - forward references between constants
//! - substitution, pre-computation and cache clearing
//! - random leaves and process-state statements
//! - printing, cancellation and internal-error handling

use rand::rngs::StdRng;
use rand::SeedableRng;
use stoch_eval::{
    BinaryOp, CancelToken, Context, Distribution, EngineOptions, Expr, ExprBuilder, ExprKind, ExprType, Op, StateVar,
    Symbol, SymbolState, UnaryOp,
};
use stoch_types::{Diagnostics, ErrorCode, Location, SetObject, Type, Value};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn loc(line: u32) -> Location {
    Location::new("test.sm", line)
}

fn int(i: i64) -> Expr {
    Expr::int(loc(1), i)
}

fn real(r: f64) -> Expr {
    Expr::real(loc(1), r)
}

fn sym(s: &Symbol) -> Expr {
    Expr::symbol(loc(1), s)
}

/// Context that records internal errors instead of panicking.
fn ctx(diags: &mut Diagnostics) -> Context<'_> {
    Context::new(diags).with_options(EngineOptions::degrading())
}

// ══════════════════════════════════════════════════════════════════════════════
// Arithmetic
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn int_addition() {
    let mut diags = Diagnostics::new();
    let e = ExprBuilder::new(&mut diags).binary(loc(1), BinaryOp::Add, int(3), int(5));
    assert_eq!(e.simple_type(), Some(Type::INT));
    let v = ctx(&mut diags).compute(&e);
    assert_eq!(v.as_int(), Ok(8));
    assert!(!diags.has_errors());
}

#[test]
fn mixed_arithmetic_promotes_to_real() {
    let mut diags = Diagnostics::new();
    let e = {
        let mut b = ExprBuilder::new(&mut diags);
        let prod = b.binary(loc(1), BinaryOp::Mul, int(2), real(1.25));
        b.unary(loc(1), UnaryOp::Neg, prod)
    };
    assert_eq!(e.simple_type(), Some(Type::REAL));
    assert_eq!(ctx(&mut diags).compute(&e).as_real(), Ok(-2.5));
}

#[test]
fn null_propagates_through_division() {
    let mut diags = Diagnostics::new();
    let null = Expr::constant(loc(1), Type::REAL, Value::Null);
    let e = ExprBuilder::new(&mut diags).binary(loc(1), BinaryOp::Div, real(1.0), null);
    let v = ctx(&mut diags).compute(&e);
    assert!(v.is_null());
    assert!(!diags.has_errors());
}

#[test]
fn division_by_zero_is_user_error() {
    let mut diags = Diagnostics::new();
    let e = ExprBuilder::new(&mut diags).binary(loc(2), BinaryOp::Div, int(1), int(0));
    let v = ctx(&mut diags).compute(&e);
    assert!(v.is_null());
    assert!(diags.has_error_code(ErrorCode::DIVISION_BY_ZERO));
    assert_eq!(diags.errors[0].location, loc(2));
}

#[test]
fn comparison_and_condition() {
    let mut diags = Diagnostics::new();
    let e = {
        let mut b = ExprBuilder::new(&mut diags);
        let test = b.binary(loc(1), BinaryOp::Lt, int(2), real(2.5));
        b.cond(loc(1), test, int(10), int(20))
    };
    assert_eq!(ctx(&mut diags).compute(&e).as_int(), Ok(10));
}

#[test]
fn unknown_condition_propagates() {
    let mut diags = Diagnostics::new();
    let unknown = Expr::constant(loc(1), Type::BOOL, Value::Unknown);
    let e = ExprBuilder::new(&mut diags).cond(loc(1), unknown, int(1), int(2));
    assert!(ctx(&mut diags).compute(&e).is_unknown());
}

#[test]
fn logical_short_circuit_absorbs_null() {
    let mut diags = Diagnostics::new();
    let null = Expr::constant(loc(1), Type::BOOL, Value::Null);
    let (and, or) = {
        let mut b = ExprBuilder::new(&mut diags);
        let and = b.binary(loc(1), BinaryOp::And, Expr::bool(loc(1), false), null.clone());
        let or = b.binary(loc(1), BinaryOp::Or, null, Expr::bool(loc(1), false));
        (and, or)
    };
    let mut c = ctx(&mut diags);
    assert_eq!(c.compute(&and).as_bool(), Ok(false));
    assert!(c.compute(&or).is_null());
}

#[test]
fn type_error_reported_once() {
    let mut diags = Diagnostics::new();
    let mut b = ExprBuilder::new(&mut diags);
    let bad = b.binary(loc(3), BinaryOp::Add, int(1), Expr::string(loc(3), "x"));
    assert!(bad.is_error());
    let outer = b.binary(loc(3), BinaryOp::Mul, bad, int(2));
    assert!(outer.is_error());
    drop(b);
    assert_eq!(diags.total_errors, 1);
}

// ══════════════════════════════════════════════════════════════════════════════
// Arrays
// ══════════════════════════════════════════════════════════════════════════════

/// `int a[i][j]` over `i in {1..2}`, `j in {1..3}`, with `a[i][j] := 10*i + j`.
fn filled_array(diags: &mut Diagnostics) -> (Symbol, Expr) {
    let i = Symbol::iterator("i", SetObject::int_range(1, 2), loc(1));
    let j = Symbol::iterator("j", SetObject::int_range(1, 3), loc(1));
    let a = Symbol::array("a", Type::INT, loc(1), &[i.clone(), j.clone()]).unwrap();
    let mut b = ExprBuilder::new(diags);
    let ten_i = b.binary(loc(2), BinaryOp::Mul, int(10), sym(&i));
    let value = b.binary(loc(2), BinaryOp::Add, ten_i, sym(&j));
    let def = b.define_cell(loc(2), &a, vec![sym(&i), sym(&j)], value);
    (a, Expr::for_each(loc(2), vec![i, j], vec![def]))
}

#[test]
fn array_cells_defined_in_loop() {
    let mut diags = Diagnostics::new();
    let (a, fill) = filled_array(&mut diags);
    let read = ExprBuilder::new(&mut diags).array_cell(loc(3), &a, vec![int(1), int(2)]);
    let mut c = ctx(&mut diags);
    c.run(Op::Compute, &fill);
    assert_eq!(c.compute(&read).as_int(), Ok(12));
    drop(c);
    assert!(!diags.has_errors());
}

#[test]
fn array_index_out_of_range() {
    let mut diags = Diagnostics::new();
    let (a, fill) = filled_array(&mut diags);
    let read = ExprBuilder::new(&mut diags).array_cell(loc(4), &a, vec![int(2), int(7)]);
    let mut c = ctx(&mut diags);
    c.run(Op::Compute, &fill);
    assert!(c.compute(&read).is_null());
    drop(c);
    assert!(diags.has_error_code(ErrorCode::BAD_VALUE));
    assert!(diags.errors[0].message.contains("iterator j"));
}

#[test]
fn array_with_wrong_index_count() {
    let mut diags = Diagnostics::new();
    let (a, _) = filled_array(&mut diags);
    let read = ExprBuilder::new(&mut diags).array_cell(loc(5), &a, vec![int(1)]);
    assert!(read.is_error());
    assert!(diags.has_error_code(ErrorCode::WRONG_COMPONENT_COUNT));
}

// ══════════════════════════════════════════════════════════════════════════════
// Symbols and forward references
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn forward_reference_resolves_in_block() {
    let mut diags = Diagnostics::new();
    let a = Symbol::constant("a", Type::INT, loc(1));
    let b = Symbol::constant("b", Type::INT, loc(2));
    let block = {
        let mut bld = ExprBuilder::new(&mut diags);
        let a_value = bld.binary(loc(1), BinaryOp::Mul, sym(&b), int(2));
        let da = bld.define(loc(1), &a, a_value);
        let db = bld.define(loc(2), &b, int(21));
        Expr::block(loc(1), vec![da, db])
    };
    let mut c = ctx(&mut diags);
    c.run(Op::Compute, &block);
    assert_eq!(a.state(), SymbolState::Ready);
    assert_eq!(b.state(), SymbolState::Computed);
    assert_eq!(c.compute(&sym(&a)).as_int(), Ok(42));
    drop(c);
    assert!(!diags.has_errors());
}

#[test]
fn circular_definition_is_rejected() {
    let mut diags = Diagnostics::new();
    let a = Symbol::constant("a", Type::INT, loc(1));
    let b = Symbol::constant("b", Type::INT, loc(2));
    let block = {
        let mut bld = ExprBuilder::new(&mut diags);
        let a_value = bld.binary(loc(1), BinaryOp::Add, sym(&b), int(1));
        let b_value = bld.binary(loc(2), BinaryOp::Add, sym(&a), int(1));
        let da = bld.define(loc(1), &a, a_value);
        let db = bld.define(loc(2), &b, b_value);
        Expr::block(loc(1), vec![da, db])
    };
    let mut c = ctx(&mut diags);
    c.run(Op::Compute, &block);
    assert_eq!(a.state(), SymbolState::Blocked);
    assert_eq!(b.state(), SymbolState::ConstructionError);
    assert!(c.compute(&sym(&b)).is_null());
    drop(c);
    assert!(diags.has_error_code(ErrorCode::CIRCULAR_DEFINITION));
}

#[test]
fn redefinition_is_ignored_with_warning() {
    let mut diags = Diagnostics::new();
    let x = Symbol::constant("x", Type::INT, loc(1));
    let block = {
        let mut bld = ExprBuilder::new(&mut diags);
        let first = bld.define(loc(1), &x, int(1));
        let second = bld.define(loc(2), &x, int(2));
        Expr::block(loc(1), vec![first, second])
    };
    let mut c = ctx(&mut diags);
    c.run(Op::Compute, &block);
    assert_eq!(c.compute(&sym(&x)).as_int(), Ok(1));
    drop(c);
    assert!(diags.has_warning_code(ErrorCode::DUPLICATE_DEFINITION));
    assert!(!diags.has_errors());
}

#[test]
fn get_symbols_is_deduplicated_and_ordered() {
    let mut diags = Diagnostics::new();
    let p = Symbol::constant("p", Type::INT, loc(1));
    let q = Symbol::constant("q", Type::INT, loc(1));
    let e = {
        let mut b = ExprBuilder::new(&mut diags);
        let pq = b.binary(loc(1), BinaryOp::Sub, sym(&q), sym(&p));
        b.binary(loc(1), BinaryOp::Mul, pq, sym(&q))
    };
    let symbols = ctx(&mut diags).run(Op::GetSymbols, &e).into_symbols();
    let names: Vec<&str> = symbols.iter().map(Symbol::name).collect();
    assert_eq!(names, vec!["p", "q"]);
}

// ══════════════════════════════════════════════════════════════════════════════
// Rewriting and caches
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn substitute_inlines_and_shares() {
    let mut diags = Diagnostics::new();
    let k = Symbol::constant("k", Type::INT, loc(1));
    let x = StateVar::new(0, "x", 0, 5);
    let (e, untouched) = {
        let mut b = ExprBuilder::new(&mut diags);
        let untouched = b.binary(loc(1), BinaryOp::Mul, Expr::state_var(loc(1), &x), int(2));
        let e = b.binary(loc(1), BinaryOp::Sub, untouched.clone(), sym(&k));
        (e, untouched)
    };
    let mut c = ctx(&mut diags);
    k.define(&int(4), &loc(1), &mut c);

    let once = c.run(Op::Substitute, &e).into_expr().unwrap();
    assert!(!once.ptr_eq(&e));
    let ExprKind::Binary { left, right, .. } = once.kind() else {
        panic!("expected binary node");
    };
    assert!(left.ptr_eq(&untouched));
    assert!(matches!(right.kind(), ExprKind::Typecast(_)) || matches!(right.kind(), ExprKind::Const(_)));

    let twice = c.run(Op::Substitute, &once).into_expr().unwrap();
    assert!(twice.ptr_eq(&once));

    let state = [3i64];
    drop(c);
    let mut c = ctx(&mut diags).with_state(&state);
    assert_eq!(c.compute(&once).as_int(), Ok(2));
}

#[test]
fn substitute_leaves_converge_variables() {
    let mut diags = Diagnostics::new();
    let v = Symbol::converge("v", Type::REAL, loc(1));
    let e = ExprBuilder::new(&mut diags).binary(loc(1), BinaryOp::Add, sym(&v), real(1.0));
    let out = ctx(&mut diags).run(Op::Substitute, &e).into_expr().unwrap();
    assert!(out.ptr_eq(&e));
}

#[test]
fn pre_compute_skips_random_subtrees() {
    let mut diags = Diagnostics::new();
    let e = {
        let mut b = ExprBuilder::new(&mut diags);
        let draw = b.random(loc(1), Distribution::Uniform, vec![real(0.0), real(1.0)]);
        b.binary(loc(1), BinaryOp::Add, draw, real(1.0))
    };
    let mut rng = StdRng::seed_from_u64(11);
    let mut c = ctx(&mut diags).with_rng(&mut rng);
    c.run(Op::PreCompute, &e);
    let first = c.compute(&e).as_real().unwrap();
    let second = c.compute(&e).as_real().unwrap();
    assert_ne!(first, second);
}

#[test]
fn process_constant_follows_current_state() {
    let mut diags = Diagnostics::new();
    let s = StateVar::new(0, "s", 0, 9);
    let c = Symbol::constant("c", Type::PROC_INT, loc(1));
    let (define, read) = {
        let mut b = ExprBuilder::new(&mut diags);
        let define = b.define(loc(1), &c, Expr::state_var(loc(1), &s));
        let read = b.binary(loc(2), BinaryOp::Add, sym(&c), int(1));
        (define, read)
    };
    // no state is available while defining, so nothing may be computed yet
    ctx(&mut diags).run(Op::Compute, &define);
    assert_eq!(c.state(), SymbolState::Ready);

    let mut c_ctx = ctx(&mut diags);
    c_ctx.run(Op::PreCompute, &read);
    let substituted = c_ctx.run(Op::Substitute, &read).into_expr().unwrap();
    assert!(substituted.ptr_eq(&read));
    let first = [1i64];
    let second = [7i64];
    drop(c_ctx);
    assert_eq!(ctx(&mut diags).with_state(&first).compute(&read).as_int(), Ok(2));
    assert_eq!(ctx(&mut diags).with_state(&second).compute(&read).as_int(), Ok(8));
    assert_eq!(ctx(&mut diags).with_state(&second).compute(&sym(&c)).as_int(), Ok(7));
    assert!(!diags.has_errors());
}

#[test]
fn random_constant_draws_on_every_read() {
    let mut diags = Diagnostics::new();
    let r = Symbol::constant("r", Type::RAND_REAL, loc(1));
    let (define, read) = {
        let mut b = ExprBuilder::new(&mut diags);
        let draw = b.random(loc(1), Distribution::Uniform, vec![real(0.0), real(1.0)]);
        let define = b.define(loc(1), &r, draw);
        let read = b.binary(loc(2), BinaryOp::Mul, sym(&r), real(2.0));
        (define, read)
    };
    ctx(&mut diags).run(Op::Compute, &define);

    let mut rng = StdRng::seed_from_u64(5);
    let mut c = ctx(&mut diags).with_rng(&mut rng);
    c.run(Op::PreCompute, &read);
    let draws: Vec<f64> = (0..4).map(|_| c.compute(&read).as_real().unwrap()).collect();
    drop(c);
    assert!(draws.iter().all(|d| (0.0..2.0).contains(d)));
    assert!(draws.windows(2).any(|w| w[0] != w[1]));
    assert!(!diags.has_errors());
}

#[test]
fn array_needs_iterator_dimensions() {
    let i = Symbol::iterator("i", SetObject::int_range(1, 2), loc(1));
    let k = Symbol::constant("k", Type::INT, loc(1));
    let err = Symbol::array("a", Type::INT, loc(1), &[i, k]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::TYPE_MISMATCH);
    assert!(err.to_string().contains("'k'"));
}

// ══════════════════════════════════════════════════════════════════════════════
// Random leaves and process state
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn seeded_random_leaves_are_reproducible() {
    let mut diags = Diagnostics::new();
    let (uniform, dice) = {
        let mut b = ExprBuilder::new(&mut diags);
        let uniform = b.random(loc(1), Distribution::Uniform, vec![real(2.0), real(3.0)]);
        let dice = b.random(loc(1), Distribution::Equilikely, vec![int(1), int(6)]);
        (uniform, dice)
    };
    let draw = |diags: &mut Diagnostics| {
        let mut rng = StdRng::seed_from_u64(42);
        let mut c = ctx(diags).with_rng(&mut rng);
        (c.compute(&uniform).as_real().unwrap(), c.compute(&dice).as_int().unwrap())
    };
    let (u1, d1) = draw(&mut diags);
    let (u2, d2) = draw(&mut diags);
    assert!((2.0..3.0).contains(&u1));
    assert!((1..=6).contains(&d1));
    assert_eq!((u1, d1), (u2, d2));
}

#[test]
fn random_without_stream_is_user_error() {
    let mut diags = Diagnostics::new();
    let e = ExprBuilder::new(&mut diags).random(loc(6), Distribution::Expo, vec![real(2.0)]);
    assert!(ctx(&mut diags).compute(&e).is_null());
    assert!(diags.has_error_code(ErrorCode::MISSING_RANDOM_STREAM));
}

#[test]
fn bad_distribution_parameters() {
    let mut diags = Diagnostics::new();
    let e = ExprBuilder::new(&mut diags).random(loc(7), Distribution::Uniform, vec![real(3.0), real(2.0)]);
    let mut rng = StdRng::seed_from_u64(1);
    assert!(ctx(&mut diags).with_rng(&mut rng).compute(&e).is_null());
    assert!(diags.has_error_code(ErrorCode::BAD_VALUE));
}

#[test]
fn state_variable_reads_current_state() {
    let mut diags = Diagnostics::new();
    let x = StateVar::new(1, "x", 0, 9);
    let e = ExprBuilder::new(&mut diags).binary(loc(1), BinaryOp::Add, Expr::state_var(loc(1), &x), int(1));
    let state = [7i64, 4];
    assert_eq!(ctx(&mut diags).with_state(&state).compute(&e).as_int(), Ok(5));
    assert!(ctx(&mut diags).compute(&e).is_null());
    assert!(diags.has_error_code(ErrorCode::MISSING_PROCESS_STATE));
}

#[test]
fn set_next_checks_bounds() {
    let mut diags = Diagnostics::new();
    let x = StateVar::new(0, "x", 0, 3);
    let (ok, bad) = {
        let mut b = ExprBuilder::new(&mut diags);
        (b.set_next(loc(1), &x, int(2)), b.set_next(loc(2), &x, int(5)))
    };
    let mut next = [0i64; 1];
    let mut c = ctx(&mut diags).with_next_state(&mut next);
    c.run(Op::Compute, &ok);
    let out = c.run(Op::Compute, &bad).into_value();
    assert!(out.is_out_of_bounds());
    drop(c);
    assert_eq!(next, [2]);
    assert!(diags.has_error_code(ErrorCode::OUT_OF_BOUNDS));
}

#[test]
fn find_range_over_state_variables() {
    let mut diags = Diagnostics::new();
    let x = StateVar::new(0, "x", 1, 4);
    let y = StateVar::new(1, "y", 0, 2);
    let e = {
        let mut b = ExprBuilder::new(&mut diags);
        let xy = b.binary(loc(1), BinaryOp::Mul, Expr::state_var(loc(1), &x), Expr::state_var(loc(1), &y));
        b.unary(loc(1), UnaryOp::Neg, xy)
    };
    let r = ctx(&mut diags).run(Op::FindRange, &e).into_range();
    assert_eq!(r.lo.as_int(), Ok(-8));
    assert_eq!(r.hi.as_int(), Ok(0));
}

// ══════════════════════════════════════════════════════════════════════════════
// Output, cancellation, internal errors
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn print_writes_to_output_stream() {
    let mut diags = Diagnostics::new();
    let stmt = Expr::print(loc(1), vec![Expr::string(loc(1), "n = "), int(3)]);
    let mut out = String::new();
    let mut c = ctx(&mut diags).with_output(&mut out, true);
    c.run(Op::Compute, &stmt);
    c.set_output_active(false);
    c.run(Op::Compute, &stmt);
    drop(c);
    assert_eq!(out, "n = 3");
}

#[test]
fn cancelled_computation_aborts_once() {
    let mut diags = Diagnostics::new();
    let token = CancelToken::new();
    token.cancel();
    let block = Expr::block(
        loc(1),
        vec![Expr::print(loc(2), vec![int(1)]), Expr::print(loc(3), vec![int(2)])],
    );
    let mut out = String::new();
    let mut c = ctx(&mut diags).with_output(&mut out, true).with_cancel(token);
    let v = c.run(Op::Compute, &block).into_value();
    assert!(v.is_null());
    assert!(c.aborted());
    c.run(Op::Compute, &block);
    drop(c);
    assert!(out.is_empty());
    assert_eq!(diags.total_warnings, 1);
    assert!(diags.has_warning_code(ErrorCode::COMPUTATION_ABORTED));
}

#[test]
fn computing_a_statement_degrades_to_null() {
    let mut diags = Diagnostics::new();
    let stmt = Expr::print(loc(8), vec![int(1)]);
    let v = stmt.compute(&mut ctx(&mut diags));
    assert!(v.is_null());
    assert!(diags.has_internal());
    assert_eq!(diags.internal[0].code, ErrorCode::NOT_COMPUTABLE);
}

#[test]
fn typecheck_reports_type() {
    let mut diags = Diagnostics::new();
    let e = ExprBuilder::new(&mut diags).binary(loc(1), BinaryOp::Div, int(1), int(2));
    let ty = ctx(&mut diags).run(Op::Typecheck, &e).into_type().unwrap();
    assert_eq!(ty.simple(), Some(Type::REAL));
    assert!(!diags.has_errors());
}

#[test]
fn promote_traversal_inserts_cast() {
    let mut diags = Diagnostics::new();
    let mut c = ctx(&mut diags);
    let promoted = c.promote(&int(4), ExprType::Simple(Type::REAL)).unwrap();
    assert!(matches!(promoted.kind(), ExprKind::Typecast(_)));
    assert_eq!(c.compute(&promoted).as_real(), Ok(4.0));
    let refused = c.promote(&real(1.5), ExprType::Simple(Type::INT)).unwrap();
    assert!(refused.is_error());
    drop(c);
    assert!(diags.has_error_code(ErrorCode::TYPE_MISMATCH));
}
