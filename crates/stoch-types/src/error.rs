use crate::Location;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of user errors stored before further ones are only counted.
pub const MAX_ERRORS: usize = 50;

/// Which channel a diagnostic travels on.
///
/// User errors and warnings are about the model being evaluated. Internal
/// diagnostics report a violated engine invariant and carry the detection
/// site in the engine's own source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Internal,
}

/// Diagnostic category, determined by error code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Type,
    Value,
    Symbol,
    Model,
    Execution,
    Internal,
}

/// Numeric diagnostic code (E100–E999).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    // ── Type errors (E100–E199) ──
    pub const TYPE_MISMATCH: Self = Self(100);
    pub const NO_COMMON_TYPE: Self = Self(101);
    pub const BAD_CAST: Self = Self(102);
    pub const WRONG_COMPONENT_COUNT: Self = Self(103);
    pub const IMPLICIT_PROMOTION: Self = Self(110);

    // ── Value errors (E200–E299) ──
    pub const BAD_VALUE: Self = Self(200);
    pub const UNDEFINED_OPERATION: Self = Self(201);
    pub const DIVISION_BY_ZERO: Self = Self(202);
    pub const OVERFLOW: Self = Self(203);
    pub const MISSING_RANDOM_STREAM: Self = Self(204);
    pub const MISSING_PROCESS_STATE: Self = Self(205);
    pub const OUT_OF_BOUNDS: Self = Self(206);

    // ── Symbol errors (E300–E399) ──
    pub const UNDEFINED_SYMBOL: Self = Self(300);
    pub const CIRCULAR_DEFINITION: Self = Self(301);
    pub const DUPLICATE_DEFINITION: Self = Self(302);
    pub const REDECLARATION: Self = Self(303);
    pub const IGNORED_ASSIGNMENT: Self = Self(304);

    // ── Model errors (E400–E499) ──
    pub const MODEL_CONSTRUCTION_FAILED: Self = Self(400);
    pub const MODEL_NOT_READY: Self = Self(401);
    pub const UNDECLARED_MEASURE: Self = Self(402);
    pub const WRONG_PARAM_COUNT: Self = Self(403);
    pub const FORMALISM_ERROR: Self = Self(404);
    pub const DIAGRAM_BUILD_FAILED: Self = Self(405);

    // ── Execution (E500–E599) ──
    pub const NOT_CONVERGED: Self = Self(500);
    pub const COMPUTATION_ABORTED: Self = Self(501);
    pub const OUTPUT_FAILED: Self = Self(502);

    // ── Internal (E900–E999) ──
    pub const INTERNAL: Self = Self(900);
    pub const UNHANDLED_TRAVERSAL: Self = Self(901);
    pub const NOT_COMPUTABLE: Self = Self(902);
    pub const STATE_VIOLATION: Self = Self(903);
    pub const PAYLOAD_MISMATCH: Self = Self(904);

    /// Get the category for this code.
    pub fn category(self) -> ErrorCategory {
        match self.0 {
            100..=199 => ErrorCategory::Type,
            200..=299 => ErrorCategory::Value,
            300..=399 => ErrorCategory::Symbol,
            400..=499 => ErrorCategory::Model,
            500..=599 => ErrorCategory::Execution,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type => write!(f, "type"),
            Self::Value => write!(f, "value"),
            Self::Symbol => write!(f, "symbol"),
            Self::Model => write!(f, "model"),
            Self::Execution => write!(f, "execution"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// A structured diagnostic attributed to a cause location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub message: String,
    /// Location of the construct that caused the diagnostic.
    pub location: Location,
    /// For internal diagnostics: `file:line` of the engine code that noticed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<String>,
}

impl Diagnostic {
    /// Create a user error.
    pub fn error(code: ErrorCode, location: Location, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: Severity::Error,
            category: code.category(),
            message: message.into(),
            location,
            detected_at: None,
        }
    }

    /// Create a warning.
    pub fn warning(code: ErrorCode, location: Location, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, location, message)
        }
    }

    /// Create an internal diagnostic detected at `file:line` of the engine.
    pub fn internal(
        code: ErrorCode,
        location: Location,
        message: impl Into<String>,
        file: &str,
        line: u32,
    ) -> Self {
        Self {
            severity: Severity::Internal,
            detected_at: Some(format!("{file}:{line}")),
            ..Self::error(code, location, message)
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} [{}] {}",
            self.location, self.code, self.category, self.message
        )?;
        if let Some(site) = &self.detected_at {
            write!(f, " (detected at {site})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// Sink collecting the three diagnostic channels of one evaluation session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub internal: Vec<Diagnostic>,
    pub total_errors: usize,
    pub total_warnings: usize,
}

impl Diagnostics {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if any user error was reported.
    pub fn has_errors(&self) -> bool {
        self.total_errors > 0
    }

    /// Check if any internal error was reported.
    pub fn has_internal(&self) -> bool {
        !self.internal.is_empty()
    }

    /// Add a user error, respecting the MAX_ERRORS limit.
    pub fn push_error(&mut self, error: Diagnostic) {
        tracing::error!(code = %error.code, location = %error.location, "{}", error.message);
        if self.errors.len() < MAX_ERRORS {
            self.errors.push(error);
        }
        self.total_errors += 1;
    }

    /// Add a warning.
    pub fn push_warning(&mut self, warning: Diagnostic) {
        tracing::warn!(code = %warning.code, location = %warning.location, "{}", warning.message);
        self.warnings.push(warning);
        self.total_warnings += 1;
    }

    /// Add an internal diagnostic.
    pub fn push_internal(&mut self, internal: Diagnostic) {
        tracing::error!(
            code = %internal.code,
            location = %internal.location,
            detected_at = internal.detected_at.as_deref().unwrap_or("?"),
            "internal error: {}",
            internal.message
        );
        self.internal.push(internal);
    }

    /// Route a diagnostic to the channel named by its severity.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.push_error(diagnostic),
            Severity::Warning => self.push_warning(diagnostic),
            Severity::Internal => self.push_internal(diagnostic),
        }
    }

    /// True if a user error with `code` was stored.
    pub fn has_error_code(&self, code: ErrorCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    /// True if a warning with `code` was stored.
    pub fn has_warning_code(&self, code: ErrorCode) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }

    /// Drop everything collected so far.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Serialize all channels for tooling.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
