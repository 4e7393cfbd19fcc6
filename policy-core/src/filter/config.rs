//! Persisted filter configuration, its legacy schema and the built-in defaults

use super::matcher::{MatcherGroup, MatcherType};
use crate::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Include/exclude matcher groups for every filter axis
///
/// An empty list on an axis places no constraint on it. Unknown keys are
/// ignored; a string list where a group is expected is what sends a blob to
/// the legacy schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilterConfig {
    #[serde(default)]
    pub include_hostnames: Vec<MatcherGroup>,
    #[serde(default)]
    pub exclude_hostnames: Vec<MatcherGroup>,
    #[serde(default)]
    pub include_suffix: Vec<MatcherGroup>,
    #[serde(default)]
    pub exclude_suffix: Vec<MatcherGroup>,
    #[serde(default)]
    pub include_uri: Vec<MatcherGroup>,
    #[serde(default)]
    pub exclude_uri: Vec<MatcherGroup>,
    #[serde(default)]
    pub exclude_methods: Vec<MatcherGroup>,
    #[serde(default, rename = "ExcludeMIME")]
    pub exclude_mime: Vec<MatcherGroup>,
}

/// Flat string-list schema written by earlier releases
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LegacyFilterConfig {
    #[serde(default)]
    pub include_hostnames: Vec<String>,
    #[serde(default)]
    pub exclude_hostnames: Vec<String>,
    #[serde(default)]
    pub include_suffix: Vec<String>,
    #[serde(default)]
    pub exclude_suffix: Vec<String>,
    #[serde(default)]
    pub include_uri: Vec<String>,
    #[serde(default)]
    pub exclude_uri: Vec<String>,
    #[serde(default)]
    pub exclude_methods: Vec<String>,
    #[serde(default, rename = "ExcludeMIME")]
    pub exclude_mime: Vec<String>,
}

fn upgrade(matcher_type: MatcherType, patterns: Vec<String>) -> Vec<MatcherGroup> {
    if patterns.is_empty() {
        Vec::new()
    } else {
        vec![MatcherGroup::new(matcher_type, patterns)]
    }
}

impl From<LegacyFilterConfig> for FilterConfig {
    fn from(legacy: LegacyFilterConfig) -> Self {
        Self {
            include_hostnames: upgrade(MatcherType::Glob, legacy.include_hostnames),
            exclude_hostnames: upgrade(MatcherType::Glob, legacy.exclude_hostnames),
            include_suffix: upgrade(MatcherType::Suffix, legacy.include_suffix),
            exclude_suffix: upgrade(MatcherType::Suffix, legacy.exclude_suffix),
            include_uri: upgrade(MatcherType::Glob, legacy.include_uri),
            exclude_uri: upgrade(MatcherType::Glob, legacy.exclude_uri),
            exclude_methods: upgrade(MatcherType::Glob, legacy.exclude_methods),
            exclude_mime: upgrade(MatcherType::Mime, legacy.exclude_mime),
        }
    }
}

impl FilterConfig {
    /// Parse a stored blob, trying the current schema and then the legacy one
    ///
    /// A legacy blob is upgraded in memory only; it is rewritten in the current
    /// schema the next time the filter is saved.
    pub fn from_json(blob: &str) -> Result<Self> {
        match serde_json::from_str::<FilterConfig>(blob) {
            Ok(config) => Ok(config),
            Err(current_err) => match serde_json::from_str::<LegacyFilterConfig>(blob) {
                Ok(legacy) => {
                    debug!("Upgrading legacy filter configuration");
                    Ok(legacy.into())
                }
                Err(_) => Err(current_err.into()),
            },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn groups(&self) -> [&Vec<MatcherGroup>; 8] {
        [
            &self.include_hostnames,
            &self.exclude_hostnames,
            &self.include_suffix,
            &self.exclude_suffix,
            &self.include_uri,
            &self.exclude_uri,
            &self.exclude_methods,
            &self.exclude_mime,
        ]
    }

    /// True when no axis carries a single pattern
    pub fn is_empty(&self) -> bool {
        self.groups()
            .iter()
            .all(|groups| groups.iter().all(MatcherGroup::is_empty))
    }
}

const DEFAULT_EXCLUDE_SUFFIX: &[&str] = &[
    ".css", ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".ico", ".svg", ".webp", ".tif", ".tiff",
    ".mp3", ".wav", ".ogg", ".flac", ".aac", ".mp4", ".avi", ".flv", ".mkv", ".mov", ".webm",
    ".woff", ".woff2", ".ttf", ".otf", ".eot", ".doc", ".docx", ".xls", ".xlsx", ".ppt",
    ".pptx", ".pdf",
];

const DEFAULT_EXCLUDE_METHODS: &[&str] = &["OPTIONS", "CONNECT"];

const DEFAULT_EXCLUDE_HOSTNAMES: &[&str] = &[
    "google.com",
    "*.google.com",
    "*.gstatic.com",
    "*.google-analytics.com",
    "*.googletagmanager.com",
    "*.doubleclick.net",
    "*.bing.com",
    "*.baidu.com",
];

const DEFAULT_EXCLUDE_MIME: &[&str] = &[
    "image/*",
    "audio/*",
    "video/*",
    "font/*",
    "application/font-*",
    "application/*octet-stream",
    "application/ogg",
    "application/pdf",
    "application/msword",
    "application/vnd.ms-*",
    "application/vnd.openxmlformats-officedocument.*",
    "application/x-shockwave-flash",
    "application/zip",
];

/// Built-in filter used when nothing usable is stored
pub fn default_filter_config() -> FilterConfig {
    FilterConfig {
        exclude_suffix: vec![MatcherGroup::suffix(DEFAULT_EXCLUDE_SUFFIX.iter().copied())],
        exclude_methods: vec![MatcherGroup::glob(DEFAULT_EXCLUDE_METHODS.iter().copied())],
        exclude_hostnames: vec![MatcherGroup::glob(DEFAULT_EXCLUDE_HOSTNAMES.iter().copied())],
        exclude_mime: vec![MatcherGroup::mime(DEFAULT_EXCLUDE_MIME.iter().copied())],
        ..Default::default()
    }
}
