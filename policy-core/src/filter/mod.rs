//! Traffic filter deciding which flows are surfaced at all
//!
//! Axes are evaluated in a fixed order (method, suffix, host, path) and the
//! first failing axis short-circuits. MIME filtering runs separately, once the
//! response content type is known.

pub mod config;
pub mod matcher;

pub use config::{default_filter_config, FilterConfig, LegacyFilterConfig};
pub use matcher::{MatcherGroup, MatcherType};

use crate::store::{ConfigStore, CONTENT_FILTER_KEY, HIJACK_FILTER_KEY};
use crate::Result;
use matcher::{axis_passes, compile_all, CompiledMatcher};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct CompiledFilter {
    include_hostnames: Vec<CompiledMatcher>,
    exclude_hostnames: Vec<CompiledMatcher>,
    include_suffix: Vec<CompiledMatcher>,
    exclude_suffix: Vec<CompiledMatcher>,
    include_uri: Vec<CompiledMatcher>,
    exclude_uri: Vec<CompiledMatcher>,
    exclude_methods: Vec<CompiledMatcher>,
    exclude_mime: Vec<CompiledMatcher>,
}

impl CompiledFilter {
    fn compile(config: &FilterConfig) -> Self {
        Self {
            include_hostnames: compile_all(&config.include_hostnames),
            exclude_hostnames: compile_all(&config.exclude_hostnames),
            include_suffix: compile_all(&config.include_suffix),
            exclude_suffix: compile_all(&config.exclude_suffix),
            include_uri: compile_all(&config.include_uri),
            exclude_uri: compile_all(&config.exclude_uri),
            exclude_methods: compile_all(&config.exclude_methods),
            exclude_mime: compile_all(&config.exclude_mime),
        }
    }

    fn is_empty(&self) -> bool {
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
        .iter()
        .all(|m| m.is_empty())
    }
}

/// Composed include/exclude matcher over method, host, path, suffix and MIME type
#[derive(Debug, Clone)]
pub struct TrafficFilter {
    defaults: FilterConfig,
    config: FilterConfig,
    compiled: Arc<CompiledFilter>,
}

impl Default for TrafficFilter {
    fn default() -> Self {
        Self::new(default_filter_config())
    }
}

impl TrafficFilter {
    /// Create a filter that starts out on (and falls back to) `defaults`
    pub fn new(defaults: FilterConfig) -> Self {
        let compiled = Arc::new(CompiledFilter::compile(&defaults));
        Self {
            config: defaults.clone(),
            defaults,
            compiled,
        }
    }

    /// Create a filter running `config`, with `defaults` kept for recovery
    pub fn with_config(config: FilterConfig, defaults: FilterConfig) -> Self {
        let mut filter = Self::new(defaults);
        filter.update(config);
        filter
    }

    /// Replace the active configuration
    pub fn update(&mut self, config: FilterConfig) {
        self.compiled = Arc::new(CompiledFilter::compile(&config));
        self.config = config;
    }

    /// Drop back to the injected default configuration
    pub fn reset_to_defaults(&mut self) {
        self.update(self.defaults.clone());
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// True when neither the raw config nor the compiled matchers hold anything
    pub fn is_empty(&self) -> bool {
        self.config.is_empty() && self.compiled.is_empty()
    }

    /// Decide whether a request should be surfaced
    ///
    /// `hostport` is `host[:port]`, `url` may be absolute or origin-form, and
    /// `ext` is the path's file extension (for example `.js`).
    pub fn is_passed(&self, method: &str, hostport: &str, url: &str, ext: &str) -> bool {
        let c = &self.compiled;

        if c.exclude_methods.iter().any(|m| m.matches(method)) {
            debug!(method, "Filtered by method");
            return false;
        }

        if !axis_passes(&c.include_suffix, &c.exclude_suffix, &[ext]) {
            debug!(ext, "Filtered by suffix");
            return false;
        }

        let host = strip_port(hostport);
        if !axis_passes(&c.include_hostnames, &c.exclude_hostnames, &[hostport, host]) {
            debug!(hostport, "Filtered by hostname");
            return false;
        }

        let path = request_path(url);
        if !axis_passes(&c.include_uri, &c.exclude_uri, &[path.as_str()]) {
            debug!(path = %path, "Filtered by uri");
            return false;
        }

        true
    }

    /// Decide whether a response content type should be surfaced
    pub fn is_mime_passed(&self, content_type: &str) -> bool {
        let essence = normalize_mime(content_type);
        if essence.is_empty() {
            return true;
        }
        !self
            .compiled
            .exclude_mime
            .iter()
            .any(|m| m.matches(&essence))
    }

    /// Persist the active configuration under `key`
    pub fn save(&self, store: &dyn ConfigStore, key: &str) -> Result<()> {
        let blob = self.config.to_json()?;
        store.set(key, &blob).inspect_err(|e| {
            warn!(key, error = %e, "Failed to persist filter configuration");
        })
    }

    /// Load the content filter from `store`, falling back to the defaults
    pub fn recover(&mut self, store: &dyn ConfigStore) {
        self.recover_from(store, CONTENT_FILTER_KEY);
    }

    /// Load the hijack filter from `store`, falling back to the defaults
    pub fn recover_hijack(&mut self, store: &dyn ConfigStore) {
        self.recover_from(store, HIJACK_FILTER_KEY);
    }

    fn recover_from(&mut self, store: &dyn ConfigStore, key: &str) {
        let stored = match store.get(key) {
            Ok(Some(blob)) if !blob.trim().is_empty() => match FilterConfig::from_json(&blob) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!(key, error = %e, "Stored filter is unreadable, using defaults");
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read stored filter, using defaults");
                None
            }
        };

        match stored {
            Some(config) if !config.is_empty() => self.update(config),
            _ => self.reset_to_defaults(),
        }
    }
}

fn strip_port(hostport: &str) -> &str {
    // [v6]:port
    if let Some(rest) = hostport.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => hostport,
    }
}

/// Path component of `url` without query string or fragment
pub fn request_path(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        if parsed.has_host() {
            return parsed.path().to_string();
        }
    }
    url.split(['?', '#']).next().unwrap_or_default().to_string()
}

/// File extension of the last path segment, including the dot
pub fn path_extension(url: &str) -> String {
    let path = request_path(url);
    let segment = path.rsplit('/').next().unwrap_or_default();
    segment
        .rfind('.')
        .map(|idx| segment[idx..].to_string())
        .unwrap_or_default()
}

/// Reduce a Content-Type value to its lowercase `type/subtype` essence
pub fn normalize_mime(content_type: &str) -> String {
    match content_type.trim().parse::<mime::Mime>() {
        Ok(m) => m.essence_str().to_string(),
        Err(_) => content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase(),
    }
}
