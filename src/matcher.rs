//! Compiles event-type filter patterns into matchers.
//!
//! A filter is a glob over dotted `entity.action` event types: `*` matches any run of
//! characters, everything else is matched literally. Patterns are anchored at both ends, so
//! `issue.*` matches `issue.created` but not `issue.created.extra`.

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled filter pattern, ready to test against event types.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    source: String,
    regex: Regex,
}

impl CompiledFilter {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, event_type: &str) -> bool {
        self.regex.is_match(event_type)
    }
}

impl PartialEq for CompiledFilter {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Compiles a single glob pattern into an anchored regex.
pub fn compile_filter(pattern: &str) -> Result<CompiledFilter> {
    if pattern.is_empty() {
        return Err(Error::InvalidFilter("pattern must not be empty".to_string()));
    }
    let mut anchored = String::with_capacity(pattern.len() * 2 + 2);
    anchored.push('^');
    for part in pattern.split('*') {
        if !anchored.ends_with('^') {
            anchored.push_str(".*");
        }
        anchored.push_str(&regex::escape(part));
    }
    anchored.push('$');
    let regex = Regex::new(&anchored).map_err(|e| Error::InvalidFilter(format!("{pattern}: {e}")))?;
    Ok(CompiledFilter {
        source: pattern.to_string(),
        regex,
    })
}

/// Matches a normalized event against a webhook's compiled filter set. A webhook matches an
/// event when *any* of its filters matches the event's `event_type` and it accepts the event's
/// workspace.
pub fn matches_any(filters: &[CompiledFilter], event_type: &str) -> bool {
    filters.iter().any(|f| f.is_match(event_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exactly() {
        let f = compile_filter("issue.created").unwrap();
        assert!(f.is_match("issue.created"));
        assert!(!f.is_match("issue.created.extra"));
        assert!(!f.is_match("issue.updated"));
    }

    #[test]
    fn trailing_star_matches_prefix() {
        let f = compile_filter("issue.*").unwrap();
        assert!(f.is_match("issue.created"));
        assert!(f.is_match("issue.updated"));
        assert!(!f.is_match("project.created"));
    }

    #[test]
    fn bare_star_matches_everything() {
        let f = compile_filter("*").unwrap();
        assert!(f.is_match("issue.created"));
        assert!(f.is_match("anything.at.all"));
    }

    #[test]
    fn interior_star_matches_middle_segment() {
        let f = compile_filter("issue.*.done").unwrap();
        assert!(f.is_match("issue.status.done"));
        assert!(!f.is_match("issue.done"));
    }

    #[test]
    fn empty_pattern_rejected() {
        assert!(compile_filter("").is_err());
    }

    #[test]
    fn matches_any_true_when_one_filter_matches() {
        let filters = vec![compile_filter("project.*").unwrap(), compile_filter("issue.*").unwrap()];
        assert!(matches_any(&filters, "issue.created"));
        assert!(!matches_any(&filters, "comment.created"));
    }
}
