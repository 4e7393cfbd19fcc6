//! Traffic Policy Core Library
//!
//! This library decides what an intercepting proxy does with each flow:
//! which flows are surfaced (traffic filter), how messages are rewritten
//! (hijacking rules), and how completed flows are tagged, coloured and mined
//! for data (mirror rules).

pub mod codec;
/// Mirror rules applied to completed flows
pub mod colorize;
pub mod filter;
pub mod pattern;
/// Background replay of rewritten requests
pub mod replay;
pub mod rewrite;
pub mod rule;
pub mod rules;
pub mod store;

/// Configuration types and utilities
pub mod config;

/// Error types for policy operations
pub mod error;

pub use colorize::{
    ExtractedData, ExtractionSink, FlowRecord, HttpFlow, MemoryExtractionSink, RequestContext,
};
pub use config::{EngineConfig, ReplayConfig};
pub use error::PolicyError;
pub use filter::{default_filter_config, FilterConfig, MatcherGroup, MatcherType, TrafficFilter};
pub use pattern::{compile_pattern, CompiledPattern, PatternCache};
pub use replay::{HttpReplaySender, ReplayDispatcher, ReplayJob, ReplaySender};
pub use rewrite::{RewriteContext, RewriteOutcome};
pub use rule::{ExtraCookie, ExtraHeader, ReplacementRule, RuleColor, SameSiteMode};
pub use rules::{load_rules_from_store, save_rules_to_store, store_persist_callback, RuleSet};
pub use store::{ConfigStore, FileStore, MemoryStore, ScopedStore};

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;
