//! Recoverable engine errors.
//!
//! Most evaluation problems do not surface as `Err`: they are reported on
//! the diagnostics channel and degrade to a `Null` value. [`EvalError`] is
//! for the operations that hand a result back to the caller and must say
//! why they could not (model instances, symbol registration, diagrams).

use stoch_types::{AccessError, ErrorCode};
use thiserror::Error;

/// Evaluation error returned from fallible engine operations.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// Measure access on an instance whose construction has not finished.
    #[error("model instance '{0}' is still under construction")]
    UnderConstruction(String),

    /// Measure access on an instance whose construction failed.
    #[error("model instance '{0}' failed to construct")]
    ConstructionFailed(String),

    /// Measure access on an instance that was already torn down.
    #[error("model instance '{0}' was deconstructed")]
    Deconstructed(String),

    #[error("model '{model}' has no measure named '{measure}'")]
    UndeclaredMeasure { model: String, measure: String },

    #[error("model '{model}' expects {expected} parameter(s), got {found}")]
    WrongParamCount {
        model: String,
        expected: usize,
        found: usize,
    },

    /// An array dimension named by a symbol that is not an iterator.
    #[error("array '{array}' cannot be indexed by '{symbol}', which is not an iterator")]
    NotAnIterator { array: String, symbol: String },

    /// Registering a waiter would close a notification cycle.
    #[error("circular definition: '{waiter}' and '{target}' depend on each other")]
    Cycle { waiter: String, target: String },

    /// A formalism back end rejected a call or the finished model.
    #[error("formalism error: {0}")]
    Formalism(String),

    #[error("decision diagram error: {0}")]
    Diagram(#[from] DiagramError),

    /// Payload read through the wrong accessor.
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("computation aborted")]
    Aborted,
}

impl EvalError {
    /// Diagnostic code used when this error is reported as a user error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnderConstruction(_) | Self::Deconstructed(_) => ErrorCode::MODEL_NOT_READY,
            Self::ConstructionFailed(_) => ErrorCode::MODEL_CONSTRUCTION_FAILED,
            Self::UndeclaredMeasure { .. } => ErrorCode::UNDECLARED_MEASURE,
            Self::WrongParamCount { .. } => ErrorCode::WRONG_PARAM_COUNT,
            Self::NotAnIterator { .. } => ErrorCode::TYPE_MISMATCH,
            Self::Cycle { .. } => ErrorCode::CIRCULAR_DEFINITION,
            Self::Formalism(_) => ErrorCode::FORMALISM_ERROR,
            Self::Diagram(_) => ErrorCode::DIAGRAM_BUILD_FAILED,
            Self::Access(_) => ErrorCode::PAYLOAD_MISMATCH,
            Self::Aborted => ErrorCode::COMPUTATION_ABORTED,
        }
    }
}

/// Failure reported by a [`crate::backend::DiagramBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiagramError {
    #[error("operation not supported by the diagram builder: {0}")]
    Unsupported(String),

    #[error("diagram node limit of {0} exceeded")]
    NodeLimit(usize),

    #[error("{0}")]
    Backend(String),
}

/// Result alias for evaluator operations.
pub type EvalResult<T> = Result<T, EvalError>;
