//! Engine options.
//!
//! Every field has a default, so a host can deserialize a partial JSON
//! object (`{"converge": {"precision": 1e-8}}`) and get a complete set.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the converge solver measures the change of a variable between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionMode {
    /// `|update - current|`
    Absolute,
    /// `|update - current| / |current|`, absolute when `current` is zero.
    Relative,
}

/// What happens when an engine invariant is found violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalPolicy {
    /// Panic at the detection site.
    Panic,
    /// Record the diagnostic, log it, and continue with a `Null` result.
    Degrade,
}

impl Default for InternalPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            InternalPolicy::Panic
        } else {
            InternalPolicy::Degrade
        }
    }
}

/// Converge solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergeOptions {
    pub max_iterations: usize,
    pub precision: f64,
    pub precision_mode: PrecisionMode,
    /// Assigned values become visible to later statements of the same pass.
    pub use_current: bool,
}

impl Default for ConvergeOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            precision: 1e-5,
            precision_mode: PrecisionMode::Absolute,
            use_current: false,
        }
    }
}

/// All options consulted by the engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub converge: ConvergeOptions,
    /// Warn whenever an implicit promotion is inserted.
    pub warn_on_promotion: bool,
    pub internal_policy: InternalPolicy,
}

/// Rejected option set.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid options JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid option {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl EngineOptions {
    /// Parse and validate options from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let opts: Self = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.converge.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "converge.max_iterations",
                reason: "must be at least 1".into(),
            });
        }
        if !(self.converge.precision > 0.0 && self.converge.precision.is_finite()) {
            return Err(ConfigError::Invalid {
                field: "converge.precision",
                reason: format!("must be positive and finite, got {}", self.converge.precision),
            });
        }
        Ok(())
    }

    /// Options with `InternalPolicy::Degrade`, whatever the build profile.
    pub fn degrading() -> Self {
        Self {
            internal_policy: InternalPolicy::Degrade,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = EngineOptions::default();
        assert_eq!(opts.converge.max_iterations, 1000);
        assert_eq!(opts.converge.precision, 1e-5);
        assert_eq!(opts.converge.precision_mode, PrecisionMode::Absolute);
        assert!(!opts.converge.use_current);
        assert!(!opts.warn_on_promotion);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let opts =
            EngineOptions::from_json(r#"{"converge": {"precision_mode": "relative"}}"#).unwrap();
        assert_eq!(opts.converge.precision_mode, PrecisionMode::Relative);
        assert_eq!(opts.converge.max_iterations, 1000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineOptions::from_json(r#"{"converge": {"max_iterations": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "converge.max_iterations", .. }));
        let err = EngineOptions::from_json(r#"{"converge": {"precision": -1.0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "converge.precision", .. }));
        assert!(matches!(
            EngineOptions::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
