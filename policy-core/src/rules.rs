//! Replacement rule set: loading, classification and persistence
//!
//! Every load builds an immutable [`RuleSnapshot`] (sorted views plus a fresh
//! pattern cache) and swaps it in by reference. Evaluations clone the current
//! `Arc` once, so a reload never tears an in-flight flow between generations.

use crate::colorize::ExtractionSink;
use crate::config::EngineConfig;
use crate::pattern::{CompiledPattern, PatternCache};
use crate::replay::ReplayDispatcher;
use crate::rule::{new_rule_id, ReplacementRule};
use crate::store::{ConfigStore, REPLACER_RULES_KEY};
use crate::Result;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Invoked with the full sorted rule list after `set_rules` / `clear_rules`
pub type PersistCallback = Arc<dyn Fn(&[ReplacementRule]) + Send + Sync>;

/// One generation of the rule set
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    all: Vec<ReplacementRule>,
    enabled: Vec<ReplacementRule>,
    mirror: Vec<ReplacementRule>,
    hijacking: Vec<ReplacementRule>,
    patterns: PatternCache,
}

impl RuleSnapshot {
    /// Sort, classify and compile `rules`
    ///
    /// Rules without a pattern, disabled rules and rules whose pattern cannot
    /// be compiled stay in `all` but are left out of every derived view.
    pub fn build(mut rules: Vec<ReplacementRule>) -> Self {
        let mut seen = HashSet::new();
        for rule in rules.iter_mut() {
            if rule.id.is_empty() || !seen.insert(rule.id.clone()) {
                let fresh = new_rule_id();
                debug!(old = %rule.id, new = %fresh, "Reassigning duplicate rule id");
                rule.id = fresh.clone();
                seen.insert(fresh);
            }
        }
        rules.sort_by_key(|r| r.index);

        let patterns = PatternCache::new();
        let mut enabled = Vec::new();
        let mut mirror = Vec::new();
        let mut hijacking = Vec::new();

        for rule in &rules {
            if !rule.is_usable() {
                continue;
            }
            if !patterns.get_or_compile(&rule.id, &rule.pattern).is_compiled() {
                warn!(rule_id = %rule.id, pattern = %rule.pattern, "Skipping rule with uncompilable pattern");
                continue;
            }
            enabled.push(rule.clone());
            if rule.is_mirror() {
                mirror.push(rule.clone());
            } else {
                hijacking.push(rule.clone());
            }
        }

        Self {
            all: rules,
            enabled,
            mirror,
            hijacking,
            patterns,
        }
    }

    pub fn all_rules(&self) -> &[ReplacementRule] {
        &self.all
    }

    pub fn enabled_rules(&self) -> &[ReplacementRule] {
        &self.enabled
    }

    pub fn mirror_rules(&self) -> &[ReplacementRule] {
        &self.mirror
    }

    pub fn hijacking_rules(&self) -> &[ReplacementRule] {
        &self.hijacking
    }

    /// Compiled pattern for `rule`, memoized by rule id
    pub fn pattern_for(&self, rule: &ReplacementRule) -> Arc<CompiledPattern> {
        self.patterns.get_or_compile(&rule.id, &rule.pattern)
    }

    pub fn cached_patterns(&self) -> usize {
        self.patterns.len()
    }
}

/// Ordered replacement rules split into mirror and hijacking groups
pub struct RuleSet {
    current: RwLock<Arc<RuleSnapshot>>,
    pub(crate) config: EngineConfig,
    on_persist: Option<PersistCallback>,
    pub(crate) extraction_sink: Option<Arc<dyn ExtractionSink>>,
    pub(crate) replay: Option<ReplayDispatcher>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("RuleSet")
            .field("rules", &snapshot.all.len())
            .field("mirror", &snapshot.mirror.len())
            .field("hijacking", &snapshot.hijacking.len())
            .field("replay", &self.replay.is_some())
            .finish()
    }
}

impl RuleSet {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(RuleSnapshot::default())),
            config,
            on_persist: None,
            extraction_sink: None,
            replay: None,
        }
    }

    pub fn with_persist_callback(mut self, callback: PersistCallback) -> Self {
        self.on_persist = Some(callback);
        self
    }

    pub fn with_extraction_sink(mut self, sink: Arc<dyn ExtractionSink>) -> Self {
        self.extraction_sink = Some(sink);
        self
    }

    pub fn with_replay(mut self, dispatcher: ReplayDispatcher) -> Self {
        self.replay = Some(dispatcher);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current generation; hold on to it for the duration of one evaluation
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Rebuild every derived view from `rules` and drop the old pattern cache
    pub fn load_rules(&self, rules: Vec<ReplacementRule>) {
        let snapshot = Arc::new(RuleSnapshot::build(rules));
        info!(
            total = snapshot.all.len(),
            enabled = snapshot.enabled.len(),
            mirror = snapshot.mirror.len(),
            hijacking = snapshot.hijacking.len(),
            "Replacement rules loaded"
        );
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Replace the working set and hand the sorted list to the persist callback
    pub fn set_rules(&self, rules: Vec<ReplacementRule>) {
        self.load_rules(rules);
        if let Some(persist) = &self.on_persist {
            let snapshot = self.snapshot();
            persist(snapshot.all_rules());
        }
    }

    /// Remove every rule, persisting the empty set
    pub fn clear_rules(&self) {
        self.set_rules(Vec::new());
    }

    pub fn get_rules(&self) -> Vec<ReplacementRule> {
        self.snapshot().all.clone()
    }

    pub fn get_enabled_rules(&self) -> Vec<ReplacementRule> {
        self.snapshot().enabled.clone()
    }

    pub fn get_mirror_rules(&self) -> Vec<ReplacementRule> {
        self.snapshot().mirror.clone()
    }

    pub fn get_hijacking_rules(&self) -> Vec<ReplacementRule> {
        self.snapshot().hijacking.clone()
    }

    pub fn have_rules(&self) -> bool {
        !self.snapshot().enabled.is_empty()
    }

    pub fn have_hijacking_rules(&self) -> bool {
        !self.snapshot().hijacking.is_empty()
    }

    /// Enabled rules of either group whose pattern hits a raw request
    pub fn match_request(&self, raw: &[u8]) -> Vec<ReplacementRule> {
        self.match_message(raw, true)
    }

    /// Enabled rules of either group whose pattern hits a raw response
    pub fn match_response(&self, raw: &[u8]) -> Vec<ReplacementRule> {
        self.match_message(raw, false)
    }

    fn match_message(&self, raw: &[u8], is_request: bool) -> Vec<ReplacementRule> {
        let snapshot = self.snapshot();
        snapshot
            .enabled_rules()
            .iter()
            .filter(|rule| rule.applies_to(is_request, !is_request))
            .filter(|rule| snapshot.pattern_for(rule).is_match(raw))
            .cloned()
            .collect()
    }

    /// Write the current rule list under [`REPLACER_RULES_KEY`]
    pub fn persist_to_store(&self, store: &dyn ConfigStore) -> Result<()> {
        save_rules_to_store(store, self.snapshot().all_rules())
    }
}

/// Persist callback writing the rule list as JSON under [`REPLACER_RULES_KEY`]
pub fn store_persist_callback(store: Arc<dyn ConfigStore>) -> PersistCallback {
    Arc::new(move |rules: &[ReplacementRule]| {
        if let Err(e) = save_rules_to_store(store.as_ref(), rules) {
            warn!(error = %e, "Failed to persist replacement rules");
        }
    })
}

pub fn save_rules_to_store(store: &dyn ConfigStore, rules: &[ReplacementRule]) -> Result<()> {
    store.set(REPLACER_RULES_KEY, &serde_json::to_string(rules)?)
}

/// Read the stored rule list; a missing or blank entry is an empty list
pub fn load_rules_from_store(store: &dyn ConfigStore) -> Result<Vec<ReplacementRule>> {
    match store.get(REPLACER_RULES_KEY)? {
        Some(blob) if !blob.trim().is_empty() => Ok(serde_json::from_str(&blob)?),
        _ => Ok(Vec::new()),
    }
}
