//! Mirror pipeline: tag, colour and extract from a completed flow
//!
//! Mirror rules never change traffic. They mark the flow record and persist
//! whatever their pattern captures from the raw request and response.

use crate::error::PolicyError;
use crate::pattern::CompiledPattern;
use crate::rule::{ReplacementRule, RuleColor};
use crate::rules::RuleSet;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

/// The stored representation of a flow that colorize may annotate
pub trait FlowRecord {
    /// Stable identifier used to key extracted data
    fn hash(&self) -> String;

    fn add_tags(&mut self, tags: &[String]);

    fn set_color(&mut self, color: RuleColor);
}

/// Minimal in-memory flow record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpFlow {
    pub hash: String,
    pub color: Option<RuleColor>,
    pub tags: Vec<String>,
}

impl HttpFlow {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            ..Default::default()
        }
    }
}

impl FlowRecord for HttpFlow {
    fn hash(&self) -> String {
        self.hash.clone()
    }

    fn add_tags(&mut self, tags: &[String]) {
        for tag in tags {
            if !tag.is_empty() && !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
    }

    fn set_color(&mut self, color: RuleColor) {
        self.color = Some(color);
    }
}

/// One captured fragment, keyed by flow and rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub flow_hash: String,
    pub rule_name: String,
    pub data: String,
    pub pattern: String,
}

/// Destination for extracted data
pub trait ExtractionSink: Send + Sync {
    fn save(&self, data: ExtractedData) -> Result<()>;
}

/// Sink that keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryExtractionSink {
    records: Mutex<Vec<ExtractedData>>,
}

impl MemoryExtractionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExtractedData> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ExtractionSink for MemoryExtractionSink {
    fn save(&self, data: ExtractedData) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| PolicyError::store("save extraction", "sink lock poisoned"))?
            .push(data);
        Ok(())
    }
}

/// Parsed view of the request that produced a flow
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
    /// Hijacking rules that already matched this flow in the rewrite pipeline
    pub matched_rules: Option<Vec<ReplacementRule>>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            matched_rules: None,
        }
    }

    pub fn with_matched_rules(mut self, rules: Vec<ReplacementRule>) -> Self {
        self.matched_rules = Some(rules);
        self
    }
}

impl RuleSet {
    /// Annotate `flow` from the mirror rules
    ///
    /// When the rewrite pipeline already matched rules for this flow, only
    /// the first of those is applied and the mirror scan is skipped. The
    /// colour is set once, by the first mirror rule that matches; tags from
    /// every matching rule are added.
    pub fn colorize(
        &self,
        request: &[u8],
        response: &[u8],
        ctx: &RequestContext,
        flow: &mut dyn FlowRecord,
    ) {
        if let Some(first) = ctx.matched_rules.as_ref().and_then(|rules| rules.first()) {
            flow.set_color(first.color());
            flow.add_tags(&first.extra_tags);
            return;
        }

        let snapshot = self.snapshot();
        if snapshot.mirror_rules().is_empty() {
            return;
        }

        let flow_hash = flow.hash();
        let mut colored = false;
        for rule in snapshot.mirror_rules() {
            let compiled = snapshot.pattern_for(rule);
            if !compiled.is_compiled() {
                continue;
            }

            let mut hit = false;
            if rule.enable_for_request && !request.is_empty() {
                hit |= self.extract(rule, &compiled, request, &flow_hash);
            }
            if rule.enable_for_response && !response.is_empty() {
                hit |= self.extract(rule, &compiled, response, &flow_hash);
            }
            if !hit {
                continue;
            }

            debug!(rule_id = %rule.id, url = %ctx.url, "Mirror rule matched");
            if !colored {
                flow.set_color(rule.color());
                colored = true;
            }
            flow.add_tags(&rule.extra_tags);
        }
    }

    /// Persist every match of `re` in `haystack`; true when anything matched
    fn extract(&self, rule: &ReplacementRule, re: &CompiledPattern, haystack: &[u8], flow_hash: &str) -> bool {
        let Some(sink) = &self.extraction_sink else {
            // Without a sink the first match is enough to know the rule hit
            return !re.extract(haystack, 1).is_empty();
        };
        let found = re.extract(haystack, self.config.max_matches_per_rule);
        for matched in &found {
            let data = String::from_utf8_lossy(matched).into_owned();
            let record = ExtractedData {
                flow_hash: flow_hash.to_string(),
                rule_name: rule.display_name().to_string(),
                data,
                pattern: rule.pattern.clone(),
            };
            if let Err(e) = sink.save(record) {
                warn!(rule_id = %rule.id, "Failed to save extracted data: {}", e);
            }
        }
        !found.is_empty()
    }
}
