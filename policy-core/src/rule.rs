//! Replacement rule data model

use crate::pattern::CompiledPattern;
use cookie::Cookie;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub fn new_rule_id() -> String {
    Uuid::new_v4().to_string()
}

/// A content replacement rule
///
/// Rules with `no_replace` set are mirror rules: they only tag, colour and
/// extract. All other usable rules are hijacking rules and may rewrite the
/// message, inject headers and cookies, drop it or schedule a replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReplacementRule {
    /// Stable identity; keys the compiled pattern cache
    pub id: String,
    /// Display name, also used to key extracted data
    #[serde(alias = "VerboseName")]
    pub name: String,
    pub pattern: String,
    /// Replacement template (`$1`, `${name}` expand capture groups)
    pub result: String,

    pub enable_for_request: bool,
    pub enable_for_response: bool,
    pub enable_for_header: bool,
    pub enable_for_body: bool,
    #[serde(rename = "EnableForURI")]
    pub enable_for_uri: bool,

    pub extra_headers: Vec<ExtraHeader>,
    pub extra_cookies: Vec<ExtraCookie>,

    pub color: String,
    pub extra_tags: Vec<String>,

    pub index: i64,
    pub disabled: bool,
    pub no_replace: bool,
    pub drop: bool,
    pub extra_repeat: bool,
}

impl Default for ReplacementRule {
    fn default() -> Self {
        Self {
            id: new_rule_id(),
            name: String::new(),
            pattern: String::new(),
            result: String::new(),
            enable_for_request: false,
            enable_for_response: false,
            enable_for_header: false,
            enable_for_body: false,
            enable_for_uri: false,
            extra_headers: Vec::new(),
            extra_cookies: Vec::new(),
            color: String::new(),
            extra_tags: Vec::new(),
            index: 0,
            disabled: false,
            no_replace: false,
            drop: false,
            extra_repeat: false,
        }
    }
}

impl ReplacementRule {
    /// Has a pattern and is not switched off
    pub fn is_usable(&self) -> bool {
        !self.pattern.is_empty() && !self.disabled
    }

    pub fn is_mirror(&self) -> bool {
        self.no_replace
    }

    /// Enabled for the direction of the message being processed
    pub fn applies_to(&self, is_request: bool, is_response: bool) -> bool {
        (is_request && self.enable_for_request) || (is_response && self.enable_for_response)
    }

    pub fn has_injections(&self) -> bool {
        !self.extra_headers.is_empty() || !self.extra_cookies.is_empty()
    }

    pub fn color(&self) -> RuleColor {
        RuleColor::from_name(&self.color)
    }

    /// One-off check of the rule's pattern against `haystack`, bypassing any cache
    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.is_usable() && CompiledPattern::compile(&self.pattern).is_match(haystack)
    }

    /// Name used for extracted data; falls back to the pattern
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.pattern
        } else {
            &self.name
        }
    }
}

/// Header injected into matching requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtraHeader {
    pub key: String,
    pub value: String,
}

impl ExtraHeader {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSiteMode {
    #[default]
    Default,
    Lax,
    Strict,
    None,
}

/// Cookie merged into matching requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtraCookie {
    #[serde(alias = "Name")]
    pub key: String,
    pub value: String,
    pub path: String,
    pub domain: String,
    /// Unix timestamp in seconds; 0 leaves the cookie session-scoped
    pub expires: i64,
    /// Seconds; 0 omits the attribute
    pub max_age: i64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site_mode: SameSiteMode,
}

impl ExtraCookie {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Name/value pair as it is sent in a request `Cookie` header
    ///
    /// Path, domain, expiry and SameSite only mean something in `Set-Cookie`
    /// and are carried for round-tripping the stored rule.
    pub fn to_cookie(&self) -> Cookie<'static> {
        Cookie::new(self.key.clone(), self.value.clone())
    }
}

/// Display colour attached to a flow when a rule matches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleColor {
    #[default]
    Red,
    Green,
    Blue,
    Yellow,
    Orange,
    Purple,
    Cyan,
    Grey,
}

impl RuleColor {
    pub const ALL: [RuleColor; 8] = [
        RuleColor::Red,
        RuleColor::Green,
        RuleColor::Blue,
        RuleColor::Yellow,
        RuleColor::Orange,
        RuleColor::Purple,
        RuleColor::Cyan,
        RuleColor::Grey,
    ];

    /// Resolve a configured colour name; unknown or empty names are red
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "green" => RuleColor::Green,
            "blue" => RuleColor::Blue,
            "yellow" => RuleColor::Yellow,
            "orange" => RuleColor::Orange,
            "purple" => RuleColor::Purple,
            "cyan" => RuleColor::Cyan,
            "grey" | "gray" => RuleColor::Grey,
            _ => RuleColor::Red,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleColor::Red => "red",
            RuleColor::Green => "green",
            RuleColor::Blue => "blue",
            RuleColor::Yellow => "yellow",
            RuleColor::Orange => "orange",
            RuleColor::Purple => "purple",
            RuleColor::Cyan => "cyan",
            RuleColor::Grey => "grey",
        }
    }
}

impl fmt::Display for RuleColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_resolution() {
        for color in RuleColor::ALL {
            assert_eq!(RuleColor::from_name(color.as_str()), color);
        }
        assert_eq!(RuleColor::from_name("GRAY"), RuleColor::Grey);
        assert_eq!(RuleColor::from_name(""), RuleColor::Red);
        assert_eq!(RuleColor::from_name("magenta"), RuleColor::Red);
    }

    #[test]
    fn test_rule_deserializes_with_defaults() {
        let rule: ReplacementRule = serde_json::from_str(
            r#"{"Pattern": "token=\\w+", "EnableForURI": true, "EnableForRequest": true, "Index": 7}"#,
        )
        .unwrap();

        assert_eq!(rule.pattern, "token=\\w+");
        assert!(rule.enable_for_uri);
        assert!(rule.applies_to(true, false));
        assert!(!rule.applies_to(false, true));
        assert_eq!(rule.index, 7);
        assert!(!rule.id.is_empty());
        assert!(rule.is_usable());
        assert!(!rule.is_mirror());
    }

    #[test]
    fn test_unusable_rules() {
        let empty = ReplacementRule::default();
        assert!(!empty.is_usable());

        let disabled = ReplacementRule {
            pattern: "x".to_string(),
            disabled: true,
            ..Default::default()
        };
        assert!(!disabled.is_usable());
    }

    #[test]
    fn test_is_match_honours_inline_flags() {
        let rule = ReplacementRule {
            pattern: "(?i)set-cookie".to_string(),
            ..Default::default()
        };
        assert!(rule.is_match(b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\n"));
        assert!(!rule.is_match(b"HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn test_extra_cookie_sends_only_name_and_value() {
        let extra = ExtraCookie {
            path: "/".to_string(),
            domain: "example.com".to_string(),
            max_age: 60,
            secure: true,
            http_only: true,
            same_site_mode: SameSiteMode::Strict,
            ..ExtraCookie::new("session", "abc")
        };
        let cookie = extra.to_cookie();

        assert_eq!(cookie.name(), "session");
        assert_eq!(cookie.value(), "abc");
        assert_eq!(cookie.to_string(), "session=abc");
    }
}
