//! Stoch evaluation core.
//!
//! Every tree-wide operation over an expression tree goes through
//! [`Expr::traverse`] with a [`Context`] naming the operation:
//!
//! ```text
//! ExprBuilder ─► Expr tree ─► Context::run(Op, &expr) ─► Output
//!                                  │
//!                                  ├─ Compute / PreCompute / ClearCache / Substitute
//!                                  ├─ GetSymbols / GetMeasures / GetVariableDependencies
//!                                  ├─ Guess / Update / Affix / Block   (converge solver)
//!                                  └─ FindRange / BuildDiagram / Typecheck / Promote / GetType
//! ```
//!
//! Symbols carry the definition state machine and forward-reference
//! wait-lists; [`ModelDef`] memoizes the most recent model instance per
//! parameter set.

mod arith;
mod array;
pub mod backend;
mod compute;
mod converge;
mod ctx;
mod error;
pub mod expr;
mod model;
pub mod options;
mod promote;
mod symbol;
mod traverse;

pub use backend::{CompiledModel, DdEdge, DiagramBuilder, Formalism, OutputStream};
pub use converge::ConvergeOutcome;
pub use ctx::{CancelToken, Context, Op, Output, Range};
pub use error::{DiagramError, EvalError, EvalResult};
pub use expr::{BinaryOp, Distribution, Expr, ExprBuilder, ExprKind, ExprType, NodeId, StateVar, Target, UnaryOp};
pub use model::{FormalismFactory, InstanceState, ModelDef, ModelInstance};
pub use options::{ConfigError, ConvergeOptions, EngineOptions, InternalPolicy, PrecisionMode};
pub use symbol::{Symbol, SymbolKind, SymbolState};
