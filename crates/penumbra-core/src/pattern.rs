//! Case-insensitive glob matching for asset, file and package names.

use glob::{MatchOptions, Pattern};

use crate::error::{Error, Result};

const OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A compiled list of name patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p.as_ref()).map_err(|e| {
                    Error::InvalidInput(format!("invalid pattern '{}': {e}", p.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches_with(name, OPTIONS))
    }

    /// Index of the first matching pattern.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.patterns.iter().position(|p| p.matches_with(name, OPTIONS))
    }
}

/// Order names by the first priority pattern they match. Unmatched names go
/// last; ties keep their input order.
pub fn sort_by_priority<T>(items: &mut [T], priority: &PatternSet, name: impl Fn(&T) -> &str) {
    items.sort_by_key(|item| priority.position(name(item)).unwrap_or(usize::MAX));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_is_case_insensitive() {
        let set = PatternSet::new(&["*Bridge*", "pinitd-cli"]).unwrap();
        assert!(set.matches("com.penumbraos.bridge-core.apk"));
        assert!(set.matches("PINITD-CLI"));
        assert!(!set.matches("mabl.apk"));
    }

    #[test]
    fn test_priority_sort_is_stable() {
        let priority = PatternSet::new(&["*core*", "*system*"]).unwrap();
        let mut apks = vec!["shell.apk", "system.apk", "core.apk", "settings.apk"];
        sort_by_priority(&mut apks, &priority, |s| *s);
        assert_eq!(apks, ["core.apk", "system.apk", "shell.apk", "settings.apk"]);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            PatternSet::new(&["[unclosed"]),
            Err(Error::InvalidInput(_))
        ));
    }
}
