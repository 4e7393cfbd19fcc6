//! Property Tests
//!
//! Invariants of the filter and rule pipelines over generated inputs.

use policy_core::codec;
use policy_core::{
    FilterConfig, MatcherGroup, ReplacementRule, RewriteContext, RuleSet, TrafficFilter,
};
use proptest::prelude::*;

fn arb_method() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS", "HEAD"])
        .prop_map(str::to_string)
}

fn arb_host() -> impl Strategy<Value = String> {
    ("[a-z]{1,8}", prop::sample::select(vec!["com", "net", "io"]), prop::option::of(1u16..65535))
        .prop_map(|(name, tld, port)| match port {
            Some(port) => format!("{}.{}:{}", name, tld, port),
            None => format!("{}.{}", name, tld),
        })
}

fn arb_path() -> impl Strategy<Value = String> {
    (
        prop::collection::vec("[a-z0-9]{1,6}", 0..4),
        prop::option::of(prop::sample::select(vec![".js", ".css", ".php", ".png"])),
    )
        .prop_map(|(segments, ext)| format!("/{}{}", segments.join("/"), ext.unwrap_or("")))
}

fn arb_glob() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["*", "*.com", "*.net*", "a*", "/api/*", "*.js", "GET", "POST", "*z*"])
        .prop_map(str::to_string)
}

fn arb_filter_config() -> impl Strategy<Value = FilterConfig> {
    (
        prop::collection::vec(arb_glob(), 0..3),
        prop::collection::vec(arb_glob(), 0..3),
        prop::collection::vec(arb_glob(), 0..3),
        prop::collection::vec(arb_glob(), 0..3),
    )
        .prop_map(|(include_hosts, exclude_hosts, include_uri, exclude_methods)| {
            let group = |patterns: Vec<String>| {
                if patterns.is_empty() {
                    Vec::new()
                } else {
                    vec![MatcherGroup::glob(patterns)]
                }
            };
            FilterConfig {
                include_hostnames: group(include_hosts),
                exclude_hostnames: group(exclude_hosts),
                include_uri: group(include_uri),
                exclude_methods: group(exclude_methods),
                ..Default::default()
            }
        })
}

fn hijack_rule(pattern: String, index: i64) -> ReplacementRule {
    ReplacementRule {
        result: format!("<{}>", index),
        pattern,
        index,
        enable_for_request: true,
        enable_for_body: true,
        ..Default::default()
    }
}

proptest! {
    /// An exclude matcher that hits the request can only close the filter
    #[test]
    fn property_exclude_is_monotonic(
        config in arb_filter_config(),
        method in arb_method(),
        host in arb_host(),
        path in arb_path(),
    ) {
        let ext = policy_core::filter::path_extension(&path);
        let before = TrafficFilter::with_config(config.clone(), FilterConfig::default())
            .is_passed(&method, &host, &path, &ext);

        let mut tightened = config.clone();
        tightened.exclude_hostnames.push(MatcherGroup::glob([host.clone()]));
        let after = TrafficFilter::with_config(tightened, FilterConfig::default())
            .is_passed(&method, &host, &path, &ext);

        prop_assert!(!after);
        prop_assert!(before || !after);
    }

    /// A non-matching include group never opens a closed filter
    #[test]
    fn property_non_matching_include_cannot_open(
        config in arb_filter_config(),
        method in arb_method(),
        host in arb_host(),
        path in arb_path(),
    ) {
        let ext = policy_core::filter::path_extension(&path);
        let before = TrafficFilter::with_config(config.clone(), FilterConfig::default())
            .is_passed(&method, &host, &path, &ext);

        let mut widened = config.clone();
        widened.include_hostnames.push(MatcherGroup::glob(["never-matches.invalid"]));
        let after = TrafficFilter::with_config(widened, FilterConfig::default())
            .is_passed(&method, &host, &path, &ext);

        prop_assert!(before || !after);
    }

    /// Without hijacking rules every message comes back untouched
    #[test]
    fn property_apply_without_rules_is_identity(
        raw in prop::collection::vec(any::<u8>(), 0..512),
        is_request in any::<bool>(),
    ) {
        let rules = RuleSet::default();
        rules.load_rules(vec![ReplacementRule {
            pattern: ".*".to_string(),
            disabled: true,
            enable_for_request: true,
            enable_for_response: true,
            enable_for_body: true,
            ..Default::default()
        }]);

        let outcome = rules.apply(is_request, !is_request, &raw, &RewriteContext::default());
        prop_assert_eq!(outcome.message, raw);
        prop_assert!(!outcome.dropped);
        prop_assert!(outcome.matched_rules.is_empty());
    }

    /// Evaluation order follows the index, whatever order rules are loaded in
    #[test]
    fn property_rule_order_is_deterministic(order in Just(vec![1i64, 2, 3]).prop_shuffle()) {
        let rules = RuleSet::default();
        rules.load_rules(order.iter().map(|i| hijack_rule("x".to_string(), *i)).collect());

        let indices: Vec<i64> = rules.get_hijacking_rules().iter().map(|r| r.index).collect();
        prop_assert_eq!(indices, vec![1, 2, 3]);

        // Rule 1 consumes the only match, so it is the only one to fire
        let outcome = rules.apply(true, false, b"POST / HTTP/1.1\r\nHost: a\r\n\r\nx", &RewriteContext::default());
        prop_assert_eq!(outcome.matched_rules.len(), 1);
        prop_assert_eq!(outcome.matched_rules[0].index, 1);
        prop_assert!(outcome.message.ends_with(b"<1>"));
    }

    /// Dechunking and inflating then recombining keeps the decoded content
    #[test]
    fn property_decode_recombine_preserves_content(
        body in prop::collection::vec(any::<u8>(), 1..2048),
        chunk_size in 1usize..300,
    ) {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body).unwrap();
        let gz = encoder.finish().unwrap();

        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for chunk in gz.chunks(chunk_size) {
            raw.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            raw.extend_from_slice(chunk);
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"0\r\n\r\n");

        let decoded = codec::decode_message(&raw);
        prop_assert!(decoded.dechunked);
        prop_assert!(decoded.inflated);
        prop_assert_eq!(&decoded.body, &body);

        let recombined = decoded.recombine();
        let again = codec::decode_message(&recombined);
        prop_assert_eq!(&again.body, &body);
        prop_assert_eq!(
            codec::header_value(&again.header, "content-length"),
            Some(body.len().to_string())
        );
    }
}
