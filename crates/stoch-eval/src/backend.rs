//! Interfaces to the collaborators the engine does not implement:
//! decision-diagram builders, formalism back ends, and the caller's output
//! stream. Random streams are plain [`rand::RngCore`] objects and process
//! states plain integer slices, so they need no trait here.

use std::fmt;

use stoch_types::Value;

use crate::error::{DiagramError, EvalResult};
use crate::expr::{BinaryOp, UnaryOp};

// ══════════════════════════════════════════════════════════════════════════════
// Decision diagrams
// ══════════════════════════════════════════════════════════════════════════════

/// Opaque handle to a diagram node owned by a [`DiagramBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DdEdge(pub u64);

/// Caller-owned decision-diagram builder used by the `BuildDiagram` traversal.
///
/// Every edge returned by the builder is owned by the caller of the
/// traversal; edges that do not make it into the final result are handed
/// back through [`DiagramBuilder::release`].
pub trait DiagramBuilder {
    /// Diagram for a constant function.
    fn constant(&mut self, value: &Value) -> Result<DdEdge, DiagramError>;

    /// Diagram for the identity function of state variable `index`.
    fn variable(&mut self, index: usize, name: &str) -> Result<DdEdge, DiagramError>;

    /// Combine two diagrams.
    fn apply(&mut self, op: BinaryOp, a: DdEdge, b: DdEdge) -> Result<DdEdge, DiagramError>;

    /// Apply a unary operator.
    fn unary(&mut self, op: UnaryOp, a: DdEdge) -> Result<DdEdge, DiagramError>;

    /// Free an edge.
    fn release(&mut self, edge: DdEdge);
}

// ══════════════════════════════════════════════════════════════════════════════
// Formalisms
// ══════════════════════════════════════════════════════════════════════════════

/// The low-level model a formalism produces once construction succeeds.
pub trait CompiledModel: fmt::Debug {
    /// Number of reachable states, if the formalism knows it.
    fn num_states(&self) -> Option<u64> {
        None
    }

    /// A measure the formalism computes itself, bypassing the measure's
    /// defining expression.
    fn query(&self, _measure: &str) -> Option<Value> {
        None
    }
}

/// A model formalism (Markov chain, Petri net, ...) driven by the memoizer.
///
/// A fresh formalism object is created for every build. The protocol is
/// `init_model`, any number of `call`s from the model body, then exactly one
/// `finalize_model`.
pub trait Formalism {
    /// Prepare mutable build-time state for the instance named `instance`.
    fn init_model(&mut self, instance: &str) -> EvalResult<()>;

    /// Formalism-specific statement of the model body, e.g. `arcs(...)`.
    fn call(&mut self, function: &str, args: &[Value]) -> EvalResult<()>;

    /// Finish construction.
    fn finalize_model(&mut self) -> EvalResult<Box<dyn CompiledModel>>;
}

// ══════════════════════════════════════════════════════════════════════════════
// Output stream
// ══════════════════════════════════════════════════════════════════════════════

/// Caller-supplied text sink with an on/off switch.
pub struct OutputStream<'a> {
    sink: &'a mut dyn fmt::Write,
    pub active: bool,
}

impl<'a> OutputStream<'a> {
    pub fn new(sink: &'a mut dyn fmt::Write, active: bool) -> Self {
        Self { sink, active }
    }

    /// Write `text` if the stream is active. Inactive streams swallow output.
    pub fn write(&mut self, text: &str) -> fmt::Result {
        if self.active {
            self.sink.write_str(text)
        } else {
            Ok(())
        }
    }
}
