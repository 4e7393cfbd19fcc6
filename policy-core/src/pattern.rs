//! Pattern compiler and per-rule compiled pattern cache
//!
//! Rule patterns are regular expressions evaluated over raw message bytes with
//! multi-line anchors on. A leading `(?i)`, `(?s)`, `(?si)` or `(?is)` marker is
//! lifted off the pattern and turned into builder options. Patterns the byte
//! engine rejects (look-around, backreferences) go to `fancy_regex` and run
//! over the message as lossy UTF-8 text. Patterns neither engine accepts are
//! retried as escaped literals before being given up on.

use crate::error::PolicyError;
use crate::Result;
use dashmap::DashMap;
use regex::bytes::{Regex, RegexBuilder};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine options carried by an inline flag marker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternFlags {
    pub case_insensitive: bool,
    pub dot_matches_new_line: bool,
}

const FLAG_MARKERS: [(&str, PatternFlags); 4] = [
    (
        "(?si)",
        PatternFlags {
            case_insensitive: true,
            dot_matches_new_line: true,
        },
    ),
    (
        "(?is)",
        PatternFlags {
            case_insensitive: true,
            dot_matches_new_line: true,
        },
    ),
    (
        "(?i)",
        PatternFlags {
            case_insensitive: true,
            dot_matches_new_line: false,
        },
    ),
    (
        "(?s)",
        PatternFlags {
            case_insensitive: false,
            dot_matches_new_line: true,
        },
    ),
];

/// Strip a leading inline flag marker, returning the flags and the remaining pattern
pub fn split_inline_flags(pattern: &str) -> (PatternFlags, &str) {
    for (marker, flags) in FLAG_MARKERS {
        if let Some(rest) = pattern.strip_prefix(marker) {
            return (flags, rest);
        }
    }
    (PatternFlags::default(), pattern)
}

fn build(pattern: &str, flags: PatternFlags) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .case_insensitive(flags.case_insensitive)
        .dot_matches_new_line(flags.dot_matches_new_line)
        .build()
}

fn build_fancy(pattern: &str, flags: PatternFlags) -> std::result::Result<fancy_regex::Regex, fancy_regex::Error> {
    let mut inline = String::from("(?m");
    if flags.case_insensitive {
        inline.push('i');
    }
    if flags.dot_matches_new_line {
        inline.push('s');
    }
    inline.push(')');
    fancy_regex::Regex::new(&format!("{}{}", inline, pattern))
}

/// Compile a rule pattern
///
/// Tries the byte engine, then the backtracking engine, then the escaped
/// literal text of the pattern.
pub fn compile_pattern(pattern: &str) -> Result<CompiledPattern> {
    let (flags, body) = split_inline_flags(pattern);
    let err = match build(body, flags) {
        Ok(re) => return Ok(CompiledPattern::Bytes(re)),
        Err(err) => err,
    };
    match build_fancy(body, flags) {
        Ok(re) => {
            debug!(pattern, "Pattern needs backtracking engine");
            return Ok(CompiledPattern::Fancy(re));
        }
        Err(fancy_err) => {
            debug!(pattern, error = %err, fancy_error = %fancy_err, "Pattern is not a valid regex, retrying as literal");
        }
    }
    build(&regex::escape(body), flags)
        .map(CompiledPattern::Bytes)
        .map_err(|e| PolicyError::pattern(pattern, e))
}

/// Result of compiling one rule's pattern
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    Bytes(Regex),
    /// Look-around or backreferences; matched over lossy UTF-8 text
    Fancy(fancy_regex::Regex),
    /// Neither the pattern nor its literal form compiled; the rule is inert
    Uncompilable,
}

impl CompiledPattern {
    pub fn compile(pattern: &str) -> Self {
        match compile_pattern(pattern) {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!("Rule pattern disabled: {}", e);
                CompiledPattern::Uncompilable
            }
        }
    }

    pub fn is_compiled(&self) -> bool {
        !matches!(self, CompiledPattern::Uncompilable)
    }

    pub fn is_match(&self, haystack: &[u8]) -> bool {
        match self {
            CompiledPattern::Bytes(re) => re.is_match(haystack),
            CompiledPattern::Fancy(re) => match re.is_match(&String::from_utf8_lossy(haystack)) {
                Ok(hit) => hit,
                Err(e) => {
                    debug!("Backtracking match aborted: {}", e);
                    false
                }
            },
            CompiledPattern::Uncompilable => false,
        }
    }

    /// Replace every match, expanding `$N` / `${name}` in `template`
    pub fn replace_all<'h>(&self, haystack: &'h [u8], template: &str) -> Cow<'h, [u8]> {
        match self {
            CompiledPattern::Bytes(re) => re.replace_all(haystack, template.as_bytes()),
            CompiledPattern::Fancy(re) => {
                let text = String::from_utf8_lossy(haystack);
                let expander = fancy_regex::Expander::default();
                let mut out = String::with_capacity(text.len());
                let mut last = 0;
                let mut hit = false;
                for caps in re.captures_iter(&text) {
                    let caps = match caps {
                        Ok(caps) => caps,
                        Err(e) => {
                            debug!("Backtracking replace aborted: {}", e);
                            return Cow::Borrowed(haystack);
                        }
                    };
                    let Some(whole) = caps.get(0) else {
                        continue;
                    };
                    out.push_str(&text[last..whole.start()]);
                    out.push_str(&expander.expansion(template, &caps));
                    last = whole.end();
                    hit = true;
                }
                if !hit {
                    return Cow::Borrowed(haystack);
                }
                out.push_str(&text[last..]);
                Cow::Owned(out.into_bytes())
            }
            CompiledPattern::Uncompilable => Cow::Borrowed(haystack),
        }
    }

    /// Up to `limit` matches, each reduced to group 1 when the pattern has
    /// groups and it participated, otherwise the whole match
    pub fn extract(&self, haystack: &[u8], limit: usize) -> Vec<Vec<u8>> {
        match self {
            CompiledPattern::Bytes(re) => re
                .captures_iter(haystack)
                .take(limit)
                .map(|caps| {
                    let kept = if caps.len() > 1 {
                        caps.get(1).or_else(|| caps.get(0))
                    } else {
                        caps.get(0)
                    };
                    kept.map(|m| m.as_bytes().to_vec()).unwrap_or_default()
                })
                .collect(),
            CompiledPattern::Fancy(re) => {
                let text = String::from_utf8_lossy(haystack);
                let mut found = Vec::new();
                for caps in re.captures_iter(&text).take(limit) {
                    let caps = match caps {
                        Ok(caps) => caps,
                        Err(e) => {
                            debug!("Backtracking extraction aborted: {}", e);
                            break;
                        }
                    };
                    let kept = if caps.len() > 1 {
                        caps.get(1).or_else(|| caps.get(0))
                    } else {
                        caps.get(0)
                    };
                    found.push(kept.map(|m| m.as_str().as_bytes().to_vec()).unwrap_or_default());
                }
                found
            }
            CompiledPattern::Uncompilable => Vec::new(),
        }
    }
}

/// Compiled patterns keyed by rule id
///
/// One cache lives per rule-set generation, so a reload discards it wholesale.
#[derive(Debug, Default)]
pub struct PatternCache {
    entries: DashMap<String, Arc<CompiledPattern>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the compiled pattern for `rule_id`, compiling `pattern` on first use
    pub fn get_or_compile(&self, rule_id: &str, pattern: &str) -> Arc<CompiledPattern> {
        if let Some(hit) = self.entries.get(rule_id) {
            return hit.value().clone();
        }
        self.entries
            .entry(rule_id.to_string())
            .or_insert_with(|| Arc::new(CompiledPattern::compile(pattern)))
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_inline_flags() {
        let (flags, rest) = split_inline_flags("(?i)token=\\w+");
        assert!(flags.case_insensitive);
        assert!(!flags.dot_matches_new_line);
        assert_eq!(rest, "token=\\w+");

        let (flags, rest) = split_inline_flags("(?is)a.b");
        assert!(flags.case_insensitive && flags.dot_matches_new_line);
        assert_eq!(rest, "a.b");

        let (flags, rest) = split_inline_flags("plain");
        assert_eq!(flags, PatternFlags::default());
        assert_eq!(rest, "plain");
    }

    #[test]
    fn test_flags_change_matching() {
        let re = compile_pattern("(?i)^cookie:").unwrap();
        assert!(re.is_match(b"Host: a\r\nCOOKIE: x=1"));

        let re = compile_pattern("a.b").unwrap();
        assert!(!re.is_match(b"a\nb"));
        let re = compile_pattern("(?s)a.b").unwrap();
        assert!(re.is_match(b"a\nb"));
    }

    #[test]
    fn test_multiline_anchors_by_default() {
        let re = compile_pattern("^Cookie: .*$").unwrap();
        assert!(re.is_match(b"GET / HTTP/1.1\r\nCookie: a=1\r\nHost: x\r\n"));
    }

    #[test]
    fn test_invalid_regex_falls_back_to_literal() {
        let re = compile_pattern("price=(10").unwrap();
        assert!(re.is_match(b"?price=(10&x=1"));
        assert!(!re.is_match(b"?price=10"));
    }

    #[test]
    fn test_lookbehind_uses_backtracking_engine() {
        let re = compile_pattern(r"(?<=sid=)\w+").unwrap();
        assert!(matches!(re, CompiledPattern::Fancy(_)));
        assert!(re.is_match(b"Cookie: sid=abc"));
        assert!(!re.is_match(b"Cookie: other=abc"));
        assert!(!re.is_match(br"(?<=sid=)\w+"));
        assert_eq!(re.replace_all(b"Cookie: sid=abc", "xyz").as_ref(), b"Cookie: sid=xyz");
    }

    #[test]
    fn test_lookahead_matches() {
        let re = compile_pattern(r"token=\d+(?=&)").unwrap();
        assert!(re.is_match(b"GET /?token=12&x=1 HTTP/1.1"));
        assert!(!re.is_match(b"GET /?token=12 HTTP/1.1"));
        assert_eq!(re.extract(b"?token=12&x", 10), vec![b"token=12".to_vec()]);
    }

    #[test]
    fn test_backreference_extracts_first_group() {
        let re = compile_pattern(r#""(\w+)":\s*"\1""#).unwrap();
        assert!(re.is_match(br#"{"a": "a"}"#));
        assert!(!re.is_match(br#"{"a": "b"}"#));
        assert_eq!(re.extract(br#"{"a": "a", "b": "b"}"#, 10), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(re.extract(br#"{"a": "a", "b": "b"}"#, 1).len(), 1);
    }

    #[test]
    fn test_backtracking_replacement_expands_groups() {
        let re = compile_pattern(r"(?<=user=)(\w+)(?=;)").unwrap();
        let out = re.replace_all(b"Cookie: user=bob; x=1", "[$1]");
        assert_eq!(out.as_ref(), b"Cookie: user=[bob]; x=1");

        let untouched = re.replace_all(b"Cookie: x=1", "[$1]");
        assert!(matches!(untouched, Cow::Borrowed(_)));
    }

    #[test]
    fn test_cache_keys_by_rule_id() {
        let cache = PatternCache::new();
        let a = cache.get_or_compile("rule-a", "abc");
        let again = cache.get_or_compile("rule-a", "ignored on hit");
        assert!(Arc::ptr_eq(&a, &again));

        let b = cache.get_or_compile("rule-b", "abc");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }
}
