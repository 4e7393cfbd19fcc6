//! Hijacking pipeline: run replacement rules against one HTTP message
//!
//! `apply` never fails. Anything it cannot parse or decode is passed through
//! unchanged and logged at debug level.

use crate::codec::{self, DecodedMessage};
use crate::pattern::CompiledPattern;
use crate::replay::ReplayJob;
use crate::rule::ReplacementRule;
use crate::rules::RuleSet;
use tracing::{debug, warn};

/// Per-flow information the rewrite pipeline needs beyond the raw bytes
#[derive(Debug, Clone, Default)]
pub struct RewriteContext {
    /// The flow travelled over TLS; replays use `https`
    pub is_https: bool,
    /// CONNECT target or connection host, used when the request has no Host header
    pub host: Option<String>,
}

impl RewriteContext {
    pub fn new(is_https: bool) -> Self {
        Self {
            is_https,
            host: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// Result of running the hijacking rules on one message
#[derive(Debug, Clone, Default)]
pub struct RewriteOutcome {
    /// Rules that changed the message, in evaluation order
    pub matched_rules: Vec<ReplacementRule>,
    /// Final message bytes; the input verbatim when nothing matched
    pub message: Vec<u8>,
    /// At least one matched rule asks for the message to be dropped
    pub dropped: bool,
}

impl RewriteOutcome {
    fn unchanged(raw: &[u8]) -> Self {
        Self {
            matched_rules: Vec::new(),
            message: raw.to_vec(),
            dropped: false,
        }
    }

    pub fn is_modified(&self) -> bool {
        !self.matched_rules.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RuleEffect {
    /// The pattern hit an applicable channel
    hit: bool,
    /// Some channel's bytes differ afterwards
    changed: bool,
}

impl RuleEffect {
    /// Drop and replay rules count on a hit alone, everything else must change bytes
    fn contributes(&self, rule: &ReplacementRule) -> bool {
        self.changed || (self.hit && (rule.drop || rule.extra_repeat))
    }
}

impl RuleSet {
    /// Run every hijacking rule, in index order, against `raw`
    ///
    /// Each rule sees the output of the previous one. Header and body are
    /// split (and the body de-chunked and inflated) before matching; the
    /// result is recombined with a repaired Content-Length. A request that
    /// matched a replay rule is submitted to the replay dispatcher once.
    pub fn apply(
        &self,
        is_request: bool,
        is_response: bool,
        raw: &[u8],
        ctx: &RewriteContext,
    ) -> RewriteOutcome {
        let snapshot = self.snapshot();
        if snapshot.hijacking_rules().is_empty() || raw.is_empty() {
            return RewriteOutcome::unchanged(raw);
        }

        let fixed;
        let input = if is_response {
            match codec::fix_response(raw) {
                Ok(bytes) => {
                    fixed = bytes;
                    fixed.as_slice()
                }
                Err(e) => {
                    debug!("Skipping rewrite of unparsable response: {}", e);
                    return RewriteOutcome::unchanged(raw);
                }
            }
        } else {
            raw
        };

        let mut message = codec::decode_message(input);
        if message.is_empty() {
            return RewriteOutcome::unchanged(raw);
        }

        let mut matched_rules = Vec::new();
        for rule in snapshot.hijacking_rules() {
            if !rule.applies_to(is_request, is_response) {
                continue;
            }
            if !(rule.enable_for_header || rule.enable_for_body || rule.enable_for_uri) {
                continue;
            }
            let compiled = snapshot.pattern_for(rule);
            if !compiled.is_compiled() {
                continue;
            }

            let effect = apply_rule(rule, &compiled, &mut message, is_request);
            if effect.contributes(rule) {
                debug!(rule_id = %rule.id, pattern = %rule.pattern, "Replacement rule matched");
                matched_rules.push(rule.clone());
            }
        }

        if matched_rules.is_empty() {
            return RewriteOutcome::unchanged(raw);
        }

        let dropped = matched_rules.iter().any(|r| r.drop);
        let final_bytes = message.recombine();

        if is_request && matched_rules.iter().any(|r| r.extra_repeat) {
            self.schedule_replay(&final_bytes, ctx);
        }

        RewriteOutcome {
            matched_rules,
            message: final_bytes,
            dropped,
        }
    }

    fn schedule_replay(&self, request: &[u8], ctx: &RewriteContext) {
        let Some(dispatcher) = &self.replay else {
            debug!("Replay requested but no dispatcher is attached");
            return;
        };
        let job = ReplayJob {
            raw: request.to_vec(),
            is_https: ctx.is_https,
            host: ctx.host.clone(),
        };
        if let Err(e) = dispatcher.submit(job) {
            warn!("Replay not scheduled: {}", e);
        }
    }
}

fn apply_rule(
    rule: &ReplacementRule,
    re: &CompiledPattern,
    message: &mut DecodedMessage,
    is_request: bool,
) -> RuleEffect {
    // Injection rules on requests never fall through to text replacement
    if is_request && rule.enable_for_header && rule.has_injections() {
        if !(re.is_match(&message.header) || re.is_match(&message.body)) {
            return RuleEffect::default();
        }
        let injected = inject(&message.header, rule);
        let changed = injected != message.header;
        message.header = injected;
        return RuleEffect { hit: true, changed };
    }

    let mut effect = RuleEffect::default();

    if is_request && rule.enable_for_uri {
        let (hit, rewritten) = rewrite_uri(&message.header, re, &rule.result);
        effect.hit |= hit;
        if let Some(header) = rewritten {
            message.header = header;
            effect.changed = true;
        }
    }

    if rule.enable_for_body {
        let (hit, replaced) = replace_all(re, &message.body, &rule.result);
        effect.hit |= hit;
        if let Some(body) = replaced {
            message.body = body;
            effect.changed = true;
        }
    }

    if rule.enable_for_header {
        let (hit, replaced) = replace_all(re, &message.header, &rule.result);
        effect.hit |= hit;
        if let Some(header) = replaced {
            message.header = header;
            effect.changed = true;
        }
    }

    effect
}

/// Replace every match; `Some` only when the bytes actually differ
fn replace_all(re: &CompiledPattern, haystack: &[u8], template: &str) -> (bool, Option<Vec<u8>>) {
    if !re.is_match(haystack) {
        return (false, None);
    }
    let replaced = re.replace_all(haystack, template);
    if replaced.as_ref() == haystack {
        (true, None)
    } else {
        (true, Some(replaced.into_owned()))
    }
}

/// Rewrite only the request-target of the start line
fn rewrite_uri(header: &[u8], re: &CompiledPattern, template: &str) -> (bool, Option<Vec<u8>>) {
    let Some(line) = codec::parse_request_line(codec::start_line(header)) else {
        return (false, None);
    };
    match replace_all(re, line.uri, template) {
        (hit, Some(uri)) => (hit, Some(codec::replace_start_line(header, &line.with_uri(&uri)))),
        (hit, None) => (hit, None),
    }
}

/// Set the rule's extra headers and merge its extra cookies into the header block
fn inject(header: &[u8], rule: &ReplacementRule) -> Vec<u8> {
    let mut header = header.to_vec();

    for extra in &rule.extra_headers {
        let key = extra.key.trim();
        if key.is_empty() {
            continue;
        }
        header = codec::set_header(&header, key, &extra.value);
    }

    let cookies: Vec<(String, String)> = rule
        .extra_cookies
        .iter()
        .filter(|c| !c.key.is_empty())
        .map(|c| {
            let cookie = c.to_cookie();
            (cookie.name().to_string(), cookie.value().to_string())
        })
        .collect();
    if !cookies.is_empty() {
        header = codec::merge_cookies(&header, &cookies);
    }

    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{ExtraCookie, ExtraHeader};

    fn hijack(pattern: &str, result: &str) -> ReplacementRule {
        ReplacementRule {
            pattern: pattern.to_string(),
            result: result.to_string(),
            enable_for_request: true,
            enable_for_header: true,
            enable_for_body: true,
            ..Default::default()
        }
    }

    fn rule_set(rules: Vec<ReplacementRule>) -> RuleSet {
        let set = RuleSet::default();
        set.load_rules(rules);
        set
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn test_no_rules_returns_input() {
        let set = RuleSet::default();
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let outcome = set.apply(true, false, raw, &RewriteContext::default());
        assert!(!outcome.is_modified());
        assert_eq!(outcome.message, raw.to_vec());
    }

    #[test]
    fn test_header_replacement() {
        let set = rule_set(vec![hijack(r"Cookie: \w+=\w+", "Cookie: 111111111")]);
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nCookie: abc=123\r\n\r\n";
        let outcome = set.apply(true, false, raw, &RewriteContext::default());

        assert_eq!(outcome.matched_rules.len(), 1);
        assert!(text(&outcome.message).contains("Cookie: 111111111\r\n"));
        assert!(!text(&outcome.message).contains("abc=123"));
    }

    #[test]
    fn test_capture_group_expansion_and_content_length() {
        let set = rule_set(vec![hijack(r"name=(\w+)", "user=$1!")]);
        let raw = b"POST /login HTTP/1.1\r\nHost: a\r\nContent-Length: 8\r\n\r\nname=bob";
        let outcome = set.apply(true, false, raw, &RewriteContext::default());

        let out = text(&outcome.message);
        assert!(out.ends_with("\r\n\r\nuser=bob!"));
        assert!(out.contains("Content-Length: 9\r\n"));
    }

    #[test]
    fn test_direction_gating() {
        let set = rule_set(vec![hijack("secret", "public")]);
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret";
        let outcome = set.apply(false, true, raw, &RewriteContext::default());
        assert!(!outcome.is_modified());
        assert_eq!(outcome.message, raw.to_vec());
    }

    #[test]
    fn test_response_rewrite_repairs_status_line() {
        let rule = ReplacementRule {
            enable_for_request: false,
            enable_for_response: true,
            ..hijack("secret", "public")
        };
        let set = rule_set(vec![rule]);
        let raw = b"HTTP/1.1 200\r\nContent-Length: 6\r\n\r\nsecret";
        let outcome = set.apply(false, true, raw, &RewriteContext::default());

        let out = text(&outcome.message);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("public"));
    }

    #[test]
    fn test_uri_rewrite_touches_only_request_target() {
        let rule = ReplacementRule {
            enable_for_header: false,
            enable_for_body: false,
            enable_for_uri: true,
            ..hijack("debug=0", "debug=1")
        };
        let set = rule_set(vec![rule]);
        let raw = b"GET /a?debug=0 HTTP/1.1\r\nHost: a\r\nReferer: /a?debug=0\r\n\r\n";
        let outcome = set.apply(true, false, raw, &RewriteContext::default());

        let out = text(&outcome.message);
        assert!(out.starts_with("GET /a?debug=1 HTTP/1.1\r\n"));
        assert!(out.contains("Referer: /a?debug=0\r\n"));
    }

    #[test]
    fn test_injection_skips_text_replacement() {
        let rule = ReplacementRule {
            extra_headers: vec![ExtraHeader::new("X-Injected", "1")],
            extra_cookies: vec![ExtraCookie::new("sid", "abc")],
            ..hijack("Host: target", "Host: elsewhere")
        };
        let set = rule_set(vec![rule]);
        let raw = b"GET / HTTP/1.1\r\nHost: target\r\nCookie: a=1\r\n\r\n";
        let outcome = set.apply(true, false, raw, &RewriteContext::default());

        let out = text(&outcome.message);
        assert_eq!(outcome.matched_rules.len(), 1);
        assert!(out.contains("Host: target\r\n"));
        assert!(out.contains("X-Injected: 1\r\n"));
        assert!(out.contains("Cookie: a=1; sid=abc\r\n"));
    }

    #[test]
    fn test_injected_cookie_attributes_stay_out_of_request() {
        let cookie = ExtraCookie {
            path: "/admin".to_string(),
            secure: true,
            max_age: 60,
            ..ExtraCookie::new("a", "2")
        };
        let rule = ReplacementRule {
            extra_cookies: vec![cookie],
            ..hijack("Host: target", "")
        };
        let set = rule_set(vec![rule]);
        let raw = b"GET / HTTP/1.1\r\nHost: target\r\nCookie: a=1; b=3\r\n\r\n";
        let out = text(&set.apply(true, false, raw, &RewriteContext::default()).message);

        assert!(out.contains("Cookie: a=2; b=3\r\n"));
        assert!(!out.contains("Path="));
        assert!(!out.contains("Secure"));
    }

    #[test]
    fn test_rules_chain_in_index_order() {
        let first = ReplacementRule {
            index: 1,
            ..hijack("alpha", "beta")
        };
        let second = ReplacementRule {
            index: 2,
            ..hijack("beta", "gamma")
        };
        let set = rule_set(vec![second, first]);
        let raw = b"POST / HTTP/1.1\r\nHost: a\r\n\r\nalpha";
        let outcome = set.apply(true, false, raw, &RewriteContext::default());

        assert_eq!(outcome.matched_rules.len(), 2);
        assert!(text(&outcome.message).ends_with("gamma"));
    }

    #[test]
    fn test_identity_rewrite_does_not_count() {
        let set = rule_set(vec![hijack("same", "same")]);
        let raw = b"POST / HTTP/1.1\r\nHost: a\r\n\r\nsame";
        let outcome = set.apply(true, false, raw, &RewriteContext::default());
        assert!(!outcome.is_modified());
    }

    #[test]
    fn test_drop_rule() {
        let rule = ReplacementRule {
            drop: true,
            ..hijack("evil", "")
        };
        let set = rule_set(vec![rule]);
        let outcome = set.apply(
            true,
            false,
            b"GET /evil HTTP/1.1\r\nHost: a\r\n\r\n",
            &RewriteContext::default(),
        );
        assert!(outcome.dropped);
    }

    #[test]
    fn test_lookbehind_rule_rewrites_cookie_value() {
        let set = rule_set(vec![hijack(r"(?<=sid=)\w+", "xyz")]);
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nCookie: sid=abc\r\n\r\n";
        let outcome = set.apply(true, false, raw, &RewriteContext::default());

        assert_eq!(outcome.matched_rules.len(), 1);
        assert!(text(&outcome.message).contains("Cookie: sid=xyz\r\n"));
    }

    #[test]
    fn test_lookahead_rule_rewrites_uri() {
        let rule = ReplacementRule {
            enable_for_uri: true,
            enable_for_header: false,
            enable_for_body: false,
            ..hijack(r"token=\d+(?=&)", "token=0")
        };
        let set = rule_set(vec![rule]);
        let raw = b"GET /a?token=12&x=1 HTTP/1.1\r\nHost: a\r\n\r\n";
        let outcome = set.apply(true, false, raw, &RewriteContext::default());

        assert!(text(&outcome.message).starts_with("GET /a?token=0&x=1 HTTP/1.1\r\n"));
    }

    #[test]
    fn test_gzip_chunked_body_is_decoded_before_matching() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello secret").unwrap();
        let gz = encoder.finish().unwrap();

        let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Encoding: gzip\r\n\r\n".to_vec();
        raw.extend_from_slice(format!("{:x}\r\n", gz.len()).as_bytes());
        raw.extend_from_slice(&gz);
        raw.extend_from_slice(b"\r\n0\r\n\r\n");

        let rule = ReplacementRule {
            enable_for_request: false,
            enable_for_response: true,
            ..hijack("secret", "world")
        };
        let set = rule_set(vec![rule]);
        let outcome = set.apply(false, true, &raw, &RewriteContext::default());

        let out = text(&outcome.message);
        assert!(out.ends_with("\r\n\r\nhello world"));
        assert!(!out.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(!out.to_ascii_lowercase().contains("content-encoding"));
        assert!(out.contains("Content-Length: 11\r\n"));
    }
}
