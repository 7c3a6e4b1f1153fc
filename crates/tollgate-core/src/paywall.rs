//! Paywall rules and URL matching.
//!
//! Rules are loaded from a JSON document mapping URL patterns to payment
//! outputs. Patterns are `/`-separated segments where `*` matches any single
//! segment. Lookup returns the rule consuming the longest prefix of the
//! request path; among equally long matches a literal segment beats `*` at
//! each depth, so the result never depends on container iteration order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// One output a visitor must fund to pass a paywall.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaywallOutput {
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The payment requirements attached to one URL pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaywallSpec {
    pub outputs: Vec<PaywallOutput>,
}

/// A successful paywall lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// The canonical pattern of the winning rule, e.g. `/posts/*`.
    pub pattern: String,
    /// The request-path prefix the pattern consumed, e.g. `/posts/intro`.
    pub matched_prefix: String,
    /// The winning rule's payment requirements.
    pub spec: PaywallSpec,
}

#[derive(Debug, Clone, Default)]
struct Node {
    children: BTreeMap<String, Node>,
    outputs: Option<Vec<PaywallOutput>>,
}

/// Immutable pattern index over all of a site's paywall rules.
///
/// Rebuilds construct a fresh index and swap the whole reference; the index
/// itself is never mutated while lookups are in flight.
#[derive(Debug, Clone, Default)]
pub struct PaywallIndex {
    root: Node,
    rules: usize,
}

#[derive(Debug, Deserialize)]
struct RawSpec {
    #[serde(default)]
    outputs: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default)]
    amount: u64,
    #[serde(default)]
    description: Option<String>,
}

impl PaywallIndex {
    /// Parse the site's rules document.
    ///
    /// Outputs without a positive amount are dropped, and rules left with no
    /// outputs are skipped entirely, so a half-written document gates nothing
    /// rather than gating for free.
    pub fn from_json(doc: &str) -> Result<Self> {
        let raw: BTreeMap<String, RawSpec> = serde_json::from_str(doc)?;
        let mut index = PaywallIndex::default();

        for (pattern, spec) in raw {
            let outputs: Vec<PaywallOutput> = spec
                .outputs
                .into_iter()
                .filter(|o| o.amount > 0)
                .map(|o| PaywallOutput {
                    amount: o.amount,
                    description: o.description,
                })
                .collect();

            index.insert(&pattern, outputs);
        }

        Ok(index)
    }

    /// Number of patterns carrying at least one output.
    pub fn len(&self) -> usize {
        self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules == 0
    }

    fn insert(&mut self, pattern: &str, outputs: Vec<PaywallOutput>) {
        if outputs.is_empty() {
            return;
        }

        let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return;
        }

        let mut node = &mut self.root;
        for segment in segments {
            node = node.children.entry(segment.to_string()).or_default();
        }

        if node.outputs.is_none() {
            self.rules += 1;
        }
        node.outputs = Some(outputs);
    }

    /// Look up the rule gating `url_path`, if any.
    pub fn match_url(&self, url_path: &str) -> Option<MatchResult> {
        let segments: Vec<&str> = url_path.split('/').filter(|s| !s.is_empty()).collect();

        let mut best: Option<(usize, Vec<&str>, &[PaywallOutput])> = None;
        let mut pattern = Vec::new();
        Self::walk(&self.root, &segments, 0, &mut pattern, &mut best);

        let (depth, pattern, outputs) = best?;
        Some(MatchResult {
            pattern: join_segments(&pattern),
            matched_prefix: join_segments(&segments[..depth]),
            spec: PaywallSpec {
                outputs: outputs.to_vec(),
            },
        })
    }

    fn walk<'a>(
        node: &'a Node,
        segments: &[&'a str],
        depth: usize,
        pattern: &mut Vec<&'a str>,
        best: &mut Option<(usize, Vec<&'a str>, &'a [PaywallOutput])>,
    ) {
        if depth > 0 {
            if let Some(outputs) = &node.outputs {
                // Strictly deeper replaces; at equal depth the first candidate
                // stands, and literal children are explored before `*` below.
                if best.as_ref().is_none_or(|(d, _, _)| depth > *d) {
                    *best = Some((depth, pattern.clone(), outputs.as_slice()));
                }
            }
        }

        let Some(&segment) = segments.get(depth) else {
            return;
        };

        if let Some(child) = node.children.get(segment) {
            pattern.push(segment);
            Self::walk(child, segments, depth + 1, pattern, best);
            pattern.pop();
        }

        if let Some(child) = node.children.get("*") {
            pattern.push("*");
            Self::walk(child, segments, depth + 1, pattern, best);
            pattern.pop();
        }
    }
}

fn join_segments(segments: &[&str]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(rules: &str) -> PaywallIndex {
        PaywallIndex::from_json(rules).unwrap()
    }

    const THREE_RULES: &str = r#"{
        "/a/b/c": { "outputs": [{ "amount": 100 }] },
        "/a/*/c": { "outputs": [{ "amount": 200 }] },
        "/a/*":   { "outputs": [{ "amount": 300 }] }
    }"#;

    #[test]
    fn exact_match_beats_wildcards() {
        let m = index(THREE_RULES).match_url("/a/b/c").unwrap();
        assert_eq!(m.pattern, "/a/b/c");
        assert_eq!(m.spec.outputs[0].amount, 100);
    }

    #[test]
    fn longer_wildcard_beats_shorter() {
        let m = index(THREE_RULES).match_url("/a/x/c").unwrap();
        assert_eq!(m.pattern, "/a/*/c");
        assert_eq!(m.spec.outputs[0].amount, 200);
    }

    #[test]
    fn falls_back_to_shorter_wildcard() {
        let m = index(THREE_RULES).match_url("/a/x/y").unwrap();
        assert_eq!(m.pattern, "/a/*");
        assert_eq!(m.matched_prefix, "/a/x");
    }

    #[test]
    fn longest_match_survives_a_literal_dead_end() {
        // The literal branch under /a/b has no outputs past depth two for
        // this path, so the wildcard rule must still win.
        let rules = r#"{
            "/a/b/c": { "outputs": [{ "amount": 100 }] },
            "/a/*":   { "outputs": [{ "amount": 300 }] }
        }"#;
        let m = index(rules).match_url("/a/b/x").unwrap();
        assert_eq!(m.pattern, "/a/*");
        assert_eq!(m.matched_prefix, "/a/b");
    }

    #[test]
    fn unmatched_paths_are_ungated() {
        let idx = index(THREE_RULES);
        assert!(idx.match_url("/z").is_none());
        assert!(idx.match_url("/").is_none());
    }

    #[test]
    fn matched_prefix_consumes_only_the_pattern_length() {
        let m = index(THREE_RULES).match_url("/a/x/c/deep/below").unwrap();
        assert_eq!(m.pattern, "/a/*/c");
        assert_eq!(m.matched_prefix, "/a/x/c");
    }

    #[test]
    fn zero_amount_outputs_never_gate() {
        let idx = index(r#"{ "/free": { "outputs": [{ "amount": 0 }] } }"#);
        assert!(idx.is_empty());
        assert!(idx.match_url("/free").is_none());
    }

    #[test]
    fn descriptions_are_carried() {
        let idx = index(
            r#"{ "/post": { "outputs": [{ "amount": 5, "description": "one article" }] } }"#,
        );
        let m = idx.match_url("/post").unwrap();
        assert_eq!(m.spec.outputs[0].description.as_deref(), Some("one article"));
    }
}
