use serde::{Deserialize, Serialize};
use std::fmt;

/// Source provenance of a node: the file it was read from and a 1-based line.
///
/// Nodes synthesized by the engine itself (substitution, constant folding)
/// inherit the location of the node they replace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

impl Location {
    /// Create a new location.
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Location used for objects created before any input is read
    /// (the built-in type registry, default option values).
    pub fn builtin() -> Self {
        Self::new("<builtin>", 0)
    }

    /// Returns true for [`Location::builtin`].
    pub fn is_builtin(&self) -> bool {
        self.line == 0 && self.file == "<builtin>"
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_builtin() {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{}:{}", self.file, self.line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let loc = Location::new("mc.sm", 12);
        assert_eq!(format!("{loc}"), "mc.sm:12");
    }

    #[test]
    fn test_builtin_location() {
        let loc = Location::default();
        assert!(loc.is_builtin());
        assert_eq!(format!("{loc}"), "<builtin>");
        assert!(!Location::new("<builtin>", 3).is_builtin());
    }

    #[test]
    fn test_location_json_field_names() {
        let json = serde_json::to_string(&Location::new("a.sm", 4)).unwrap();
        assert_eq!(json, r#"{"file":"a.sm","line":4}"#);
    }
}
