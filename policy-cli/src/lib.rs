//! Policy CLI
//!
//! Dry-runs the traffic filter and replacement rules against raw HTTP
//! messages saved on disk, printing JSON reports.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use policy_core::filter::{path_extension, request_path};
use policy_core::{
    default_filter_config, load_rules_from_store, ConfigStore, EngineConfig, ExtractedData,
    FileStore, FilterConfig, HttpFlow, HttpReplaySender, MemoryExtractionSink, ReplacementRule,
    ReplayDispatcher, RequestContext, RewriteContext, RuleColor, RuleSet, TrafficFilter,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod logging;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Also write logs to this file, rotated daily
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// JSON configuration store holding persisted filters and rules
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the hijacking rules over a raw HTTP message
    Apply {
        /// Raw request or response bytes
        message: PathBuf,

        /// JSON rule list; defaults to the rules in the store
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Treat the message as a response
        #[arg(long)]
        response: bool,

        /// The message travelled over TLS
        #[arg(long)]
        https: bool,

        /// Actually send replays requested by matching rules
        #[arg(long)]
        replay: bool,

        /// Write the rewritten message here
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Evaluate the traffic filter for one request
    Filter {
        /// Absolute URL or origin-form path
        url: String,

        #[arg(long, default_value = "GET")]
        method: String,

        /// host[:port]; taken from the URL when omitted
        #[arg(long)]
        host: Option<String>,

        /// Response Content-Type to check against the MIME excludes
        #[arg(long)]
        content_type: Option<String>,

        /// JSON filter config; defaults to the one in the store
        #[arg(long)]
        filter: Option<PathBuf>,

        /// Use the hijack filter instead of the content filter
        #[arg(long)]
        hijack: bool,
    },

    /// Run the mirror rules over a request/response pair
    Colorize {
        /// Raw request bytes
        request: PathBuf,

        /// Raw response bytes
        #[arg(long)]
        response: Option<PathBuf>,

        /// JSON rule list; defaults to the rules in the store
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Identifier recorded on extracted data
        #[arg(long, default_value = "cli")]
        flow_hash: String,
    },

    /// Print the built-in filter configuration
    Defaults,
}

#[derive(Debug, Serialize)]
pub struct ApplyReport {
    pub matched_rules: Vec<String>,
    pub dropped: bool,
    pub modified: bool,
    pub replays: u64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct FilterReport {
    pub passed: bool,
    pub mime_passed: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ColorizeReport {
    pub color: Option<RuleColor>,
    pub tags: Vec<String>,
    pub extractions: Vec<ExtractedData>,
}

/// Execute one command and return its report as pretty JSON
pub async fn run(args: Args) -> anyhow::Result<String> {
    let store = args.store.as_ref().map(FileStore::new);

    match args.command {
        Command::Apply {
            message,
            rules,
            response,
            https,
            replay,
            output,
        } => {
            let raw = read_file(&message)?;
            let rules = load_rules(rules.as_deref(), store.as_ref())?;
            let report = apply(rules, &raw, response, https, replay).await?;
            if let Some(path) = output {
                std::fs::write(&path, report.message.as_bytes())
                    .with_context(|| format!("writing {}", path.display()))?;
            }
            Ok(serde_json::to_string_pretty(&report)?)
        }
        Command::Filter {
            url,
            method,
            host,
            content_type,
            filter,
            hijack,
        } => {
            let traffic_filter = load_filter(filter.as_deref(), store.as_ref(), hijack)?;
            let host = match host {
                Some(host) => host,
                None => host_from_url(&url)?,
            };
            let ext = path_extension(&url);
            tracing::debug!(method = %method, host = %host, path = %request_path(&url), "Evaluating filter");

            let report = FilterReport {
                passed: traffic_filter.is_passed(&method, &host, &url, &ext),
                mime_passed: content_type.map(|ct| traffic_filter.is_mime_passed(&ct)),
            };
            Ok(serde_json::to_string_pretty(&report)?)
        }
        Command::Colorize {
            request,
            response,
            rules,
            flow_hash,
        } => {
            let request = read_file(&request)?;
            let response = match response {
                Some(path) => read_file(&path)?,
                None => Vec::new(),
            };
            let rules = load_rules(rules.as_deref(), store.as_ref())?;
            let report = colorize(rules, &request, &response, &flow_hash);
            Ok(serde_json::to_string_pretty(&report)?)
        }
        Command::Defaults => Ok(default_filter_config().to_json()?),
    }
}

async fn apply(
    rules: Vec<ReplacementRule>,
    raw: &[u8],
    is_response: bool,
    is_https: bool,
    replay: bool,
) -> anyhow::Result<ApplyReport> {
    let config = EngineConfig::default();
    let mut rule_set = RuleSet::new(config.clone());
    let dispatcher = if replay {
        let sender = HttpReplaySender::new(&config.replay)?;
        let dispatcher = ReplayDispatcher::spawn(Arc::new(sender), &config.replay);
        rule_set = rule_set.with_replay(dispatcher.clone());
        Some(dispatcher)
    } else {
        None
    };
    rule_set.load_rules(rules);

    let outcome = rule_set.apply(
        !is_response,
        is_response,
        raw,
        &RewriteContext::new(is_https),
    );

    let mut replays = 0;
    if let Some(dispatcher) = dispatcher {
        let deadline = tokio::time::Instant::now() + config.replay.timeout() + Duration::from_secs(1);
        loop {
            let stats = dispatcher.stats();
            if stats.finished() >= stats.submitted || tokio::time::Instant::now() >= deadline {
                replays = stats.submitted;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    Ok(ApplyReport {
        matched_rules: outcome
            .matched_rules
            .iter()
            .map(|r| r.display_name().to_string())
            .collect(),
        dropped: outcome.dropped,
        modified: outcome.is_modified(),
        replays,
        message: String::from_utf8_lossy(&outcome.message).into_owned(),
    })
}

fn colorize(
    rules: Vec<ReplacementRule>,
    request: &[u8],
    response: &[u8],
    flow_hash: &str,
) -> ColorizeReport {
    let sink = Arc::new(MemoryExtractionSink::new());
    let rule_set = RuleSet::default().with_extraction_sink(sink.clone());
    rule_set.load_rules(rules);

    let line = policy_core::codec::start_line(request);
    let ctx = match policy_core::codec::parse_request_line(line) {
        Some(parsed) => RequestContext::new(
            String::from_utf8_lossy(parsed.method),
            String::from_utf8_lossy(parsed.uri),
        ),
        None => RequestContext::default(),
    };

    let mut flow = HttpFlow::new(flow_hash);
    rule_set.colorize(request, response, &ctx, &mut flow);

    ColorizeReport {
        color: flow.color,
        tags: flow.tags,
        extractions: sink.records(),
    }
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn load_rules(path: Option<&Path>, store: Option<&FileStore>) -> anyhow::Result<Vec<ReplacementRule>> {
    if let Some(path) = path {
        let content = read_file(path)?;
        return serde_json::from_slice(&content)
            .with_context(|| format!("parsing rules from {}", path.display()));
    }
    match store {
        Some(store) => Ok(load_rules_from_store(store)?),
        None => bail!("no rules given: pass --rules or --store"),
    }
}

fn load_filter(
    path: Option<&Path>,
    store: Option<&FileStore>,
    hijack: bool,
) -> anyhow::Result<TrafficFilter> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = FilterConfig::from_json(&content)
            .with_context(|| format!("parsing filter from {}", path.display()))?;
        return Ok(TrafficFilter::with_config(config, default_filter_config()));
    }

    let mut filter = TrafficFilter::default();
    if let Some(store) = store {
        let store: &dyn ConfigStore = store;
        if hijack {
            filter.recover_hijack(store);
        } else {
            filter.recover(store);
        }
    }
    Ok(filter)
}

fn host_from_url(url: &str) -> anyhow::Result<String> {
    let parsed = url::Url::parse(url)
        .with_context(|| format!("{} is not an absolute URL; pass --host", url))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("{} has no host", url))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_from_url() {
        assert_eq!(host_from_url("https://a.com/x").unwrap(), "a.com");
        assert_eq!(host_from_url("http://a.com:8080/x").unwrap(), "a.com:8080");
        assert!(host_from_url("/relative").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["policy-cli", "--store", "s.json", "filter", "http://a.com/"]).unwrap();
        assert_eq!(args.store, Some(PathBuf::from("s.json")));
        match args.command {
            Command::Filter { method, hijack, .. } => {
                assert_eq!(method, "GET");
                assert!(!hijack);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
