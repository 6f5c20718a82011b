//! Glob filtering for `list`.

use crate::models::{Result, TidemarkError};
use glob::Pattern;

/// A compiled id filter. `None` matches every id.
#[derive(Debug, Clone, Default)]
pub struct IdPattern {
    pattern: Option<Pattern>,
    prefix: String,
}

impl IdPattern {
    /// Compile an optional glob over the full id (`*`, `?`, `[...]`, `[!...]`).
    pub fn new(pattern: Option<&str>) -> Result<Self> {
        let Some(raw) = pattern else {
            return Ok(Self::default());
        };

        // `*` already crosses `/`, so a run of stars means the same as one;
        // the glob crate would otherwise read `**` as a path wildcard.
        let normalized = collapse_stars(raw);
        let compiled = Pattern::new(&normalized).map_err(|e| TidemarkError::InvalidPattern {
            pattern: raw.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            prefix: literal_prefix(&normalized).to_string(),
            pattern: Some(compiled),
        })
    }

    pub fn matches(&self, id: &str) -> bool {
        self.pattern.as_ref().is_none_or(|p| p.matches(id))
    }

    /// Leading literal part of the pattern; every match starts with it.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn collapse_stars(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c == '*' && out.ends_with('*') {
            continue;
        }
        out.push(c);
    }
    out
}

fn literal_prefix(pattern: &str) -> &str {
    let end = pattern.find(['*', '?', '[']).unwrap_or(pattern.len());
    &pattern[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_pattern_matches_everything() {
        let pattern = IdPattern::new(None).unwrap();
        assert!(pattern.matches("anything/at:all"));
        assert_eq!(pattern.prefix(), "");
    }

    #[test]
    fn test_star_and_prefix() {
        let pattern = IdPattern::new(Some("job-*")).unwrap();
        assert!(pattern.matches("job-a"));
        assert!(pattern.matches("job-"));
        assert!(!pattern.matches("other"));
        assert!(!pattern.matches("a-job-b"));
        assert_eq!(pattern.prefix(), "job-");
    }

    #[test]
    fn test_star_crosses_separators() {
        let pattern = IdPattern::new(Some("dev:*")).unwrap();
        assert!(pattern.matches("dev:tap-a/target-b"));
    }

    #[test]
    fn test_question_mark_and_classes() {
        let pattern = IdPattern::new(Some("run-?-[ab]")).unwrap();
        assert!(pattern.matches("run-1-a"));
        assert!(!pattern.matches("run-12-a"));
        assert!(!pattern.matches("run-1-c"));

        let negated = IdPattern::new(Some("run-[!0-9]")).unwrap();
        assert!(negated.matches("run-x"));
        assert!(!negated.matches("run-5"));
        assert_eq!(negated.prefix(), "run-");
    }

    #[test]
    fn test_exact_pattern_is_all_prefix() {
        let pattern = IdPattern::new(Some("job-a")).unwrap();
        assert!(pattern.matches("job-a"));
        assert!(!pattern.matches("job-ab"));
        assert_eq!(pattern.prefix(), "job-a");
    }

    #[test]
    fn test_repeated_stars_behave_like_one() {
        let pattern = IdPattern::new(Some("job-**")).unwrap();
        assert!(pattern.matches("job-a"));
        assert!(pattern.matches("job-team/a"));
        assert!(!pattern.matches("other"));
        assert_eq!(pattern.prefix(), "job-");

        let inner = IdPattern::new(Some("a/**/b***")).unwrap();
        assert!(inner.matches("a/x/y/bz"));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = IdPattern::new(Some("job-[")).unwrap_err();
        assert!(matches!(err, TidemarkError::InvalidPattern { .. }));
    }
}
