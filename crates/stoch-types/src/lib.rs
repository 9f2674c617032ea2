//! Shared types for the Stoch evaluation core.
//!
//! This crate defines the runtime [`Value`], the type lattice ([`Type`],
//! [`TypeRegistry`]), source [`Location`]s and the structured diagnostics
//! used by every evaluation stage.

mod error;
mod location;
pub mod ty;
pub mod value;

pub use error::{Diagnostic, Diagnostics, ErrorCategory, ErrorCode, Severity, MAX_ERRORS};
pub use location::Location;
pub use ty::{aggregate_distance, Modifier, SimpleType, Type, TypeInfo, TypeRegistry};
pub use value::{AccessError, Payload, PayloadKind, SetObject, SharedObject, Sign, StringObject, Value};
