use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

/// Matching strategy applied to a group of patterns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherType {
    /// `*` / `?` wildcards, case-insensitive
    #[default]
    Glob,
    /// Value ends with the pattern, case-insensitive
    Suffix,
    /// Glob over a normalized `type/subtype` essence
    Mime,
}

/// A pattern list plus the strategy used to match it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MatcherGroup {
    #[serde(default)]
    pub matcher_type: MatcherType,
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl MatcherGroup {
    pub fn new(matcher_type: MatcherType, patterns: Vec<String>) -> Self {
        Self {
            matcher_type,
            patterns,
        }
    }

    pub fn glob<S: Into<String>>(patterns: impl IntoIterator<Item = S>) -> Self {
        Self::new(MatcherType::Glob, patterns.into_iter().map(Into::into).collect())
    }

    pub fn suffix<S: Into<String>>(patterns: impl IntoIterator<Item = S>) -> Self {
        Self::new(MatcherType::Suffix, patterns.into_iter().map(Into::into).collect())
    }

    pub fn mime<S: Into<String>>(patterns: impl IntoIterator<Item = S>) -> Self {
        Self::new(MatcherType::Mime, patterns.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.iter().all(|p| p.trim().is_empty())
    }
}

/// Executable form of a [`MatcherGroup`]
#[derive(Debug)]
pub(crate) enum CompiledMatcher {
    Glob(Vec<WildMatch>),
    Suffix(Vec<String>),
}

impl CompiledMatcher {
    pub(crate) fn compile(group: &MatcherGroup) -> Self {
        let patterns = group
            .patterns
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty());

        match group.matcher_type {
            MatcherType::Glob | MatcherType::Mime => {
                CompiledMatcher::Glob(patterns.map(|p| WildMatch::new(&p)).collect())
            }
            MatcherType::Suffix => CompiledMatcher::Suffix(patterns.collect()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            CompiledMatcher::Glob(globs) => globs.is_empty(),
            CompiledMatcher::Suffix(suffixes) => suffixes.is_empty(),
        }
    }

    pub(crate) fn matches(&self, value: &str) -> bool {
        let value = value.to_lowercase();
        match self {
            CompiledMatcher::Glob(globs) => globs.iter().any(|g| g.matches(&value)),
            CompiledMatcher::Suffix(suffixes) => suffixes.iter().any(|s| value.ends_with(s.as_str())),
        }
    }
}

/// Shared include/exclude predicate for one filter axis
///
/// Logic:
/// 1. If any exclude matcher matches any candidate, the axis fails.
/// 2. If no include matcher is configured, the axis passes.
/// 3. Otherwise the axis passes only if an include matcher matches a candidate.
pub(crate) fn axis_passes(
    includes: &[CompiledMatcher],
    excludes: &[CompiledMatcher],
    candidates: &[&str],
) -> bool {
    let hit = |m: &CompiledMatcher| candidates.iter().any(|c| m.matches(c));

    if excludes.iter().any(&hit) {
        return false;
    }

    if includes.iter().all(CompiledMatcher::is_empty) {
        return true;
    }

    includes.iter().any(&hit)
}

pub(crate) fn compile_all(groups: &[MatcherGroup]) -> Vec<CompiledMatcher> {
    groups
        .iter()
        .filter(|g| !g.is_empty())
        .map(CompiledMatcher::compile)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_is_case_insensitive() {
        let m = CompiledMatcher::compile(&MatcherGroup::glob(["*.Example.com"]));
        assert!(m.matches("API.example.COM"));
        assert!(!m.matches("example.org"));
    }

    #[test]
    fn test_suffix_matching() {
        let m = CompiledMatcher::compile(&MatcherGroup::suffix([".css", ".JS"]));
        assert!(m.matches(".css"));
        assert!(m.matches("/static/app.js"));
        assert!(!m.matches(".json"));
    }

    #[test]
    fn test_blank_patterns_are_ignored() {
        let group = MatcherGroup::glob(["", "  "]);
        assert!(group.is_empty());
        assert!(CompiledMatcher::compile(&group).is_empty());
    }

    #[test]
    fn test_axis_semantics() {
        // No constraints: pass
        assert!(axis_passes(&[], &[], &["anything"]));

        // Exclude wins over include
        let inc = compile_all(&[MatcherGroup::glob(["*.google.com"])]);
        let exc = compile_all(&[MatcherGroup::glob(["ads.google.com"])]);
        assert!(axis_passes(&inc, &exc, &["mail.google.com"]));
        assert!(!axis_passes(&inc, &exc, &["ads.google.com"]));

        // Include configured: only matches pass
        assert!(!axis_passes(&inc, &[], &["example.com"]));

        // Any candidate may satisfy the include list
        assert!(axis_passes(&inc, &[], &["mail.google.com:443", "mail.google.com"]));
    }
}
