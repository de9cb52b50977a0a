//! Comparative query decomposition: `"A vs B"`-shaped queries are split into
//! independently searchable sub-queries (SPEC_FULL.md §4.6).

use std::sync::LazyLock;

use regex::Regex;

use crate::config::SearchConfig;

/// Comparative-structure patterns, English and Japanese. Checked in order;
/// the first match wins. Mirrors the `LazyLock<Vec<Regex>>` compiled-pattern
/// idiom used throughout `canonical.rs`.
static COMPARATIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)^\s*difference between\s+(.+?)\s+and\s+(.+?)\s*\??\s*$").unwrap(),
        Regex::new(r"(?i)^\s*compare\s+(.+?)\s+(?:and|with|to)\s+(.+?)\s*\??\s*$").unwrap(),
        Regex::new(r"(?i)^\s*(.+?)\s+vs\.?\s+(.+?)\s*\??\s*$").unwrap(),
        Regex::new(r"(?i)^\s*(.+?)\s+versus\s+(.+?)\s*\??\s*$").unwrap(),
        Regex::new(r"^\s*(.+?)と(.+?)の違い\s*$").unwrap(),
        Regex::new(r"^\s*(.+?)と(.+?)はどう違う\s*$").unwrap(),
    ]
});

/// Split `query` into sub-queries if it matches a recognized comparative
/// shape and decomposition is enabled. Returns an empty vec when disabled, no
/// pattern matches, or either captured side is empty after trimming.
/// Never returns more than `config.query_decomp_max_sub_queries` entries.
#[must_use]
pub fn decompose(query: &str, config: &SearchConfig) -> Vec<String> {
    if !config.query_decomp_enabled {
        return Vec::new();
    }
    for pattern in COMPARATIVE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(query) {
            let a = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let b = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
            if a.is_empty() || b.is_empty() {
                continue;
            }
            let mut sub_queries = vec![a.to_owned(), b.to_owned()];
            sub_queries.truncate(config.query_decomp_max_sub_queries);
            return sub_queries;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_vs_query() {
        let cfg = SearchConfig::default();
        let parts = decompose("rest api vs graphql", &cfg);
        assert_eq!(parts, vec!["rest api".to_owned(), "graphql".to_owned()]);
    }

    #[test]
    fn splits_difference_between_query() {
        let cfg = SearchConfig::default();
        let parts = decompose("difference between TLS and SSL", &cfg);
        assert_eq!(parts, vec!["TLS".to_owned(), "SSL".to_owned()]);
    }

    #[test]
    fn splits_japanese_comparative_query() {
        let cfg = SearchConfig::default();
        let parts = decompose("有給休暇と特別休暇の違い", &cfg);
        assert_eq!(parts, vec!["有給休暇".to_owned(), "特別休暇".to_owned()]);
    }

    #[test]
    fn returns_empty_for_non_comparative_query() {
        let cfg = SearchConfig::default();
        assert!(decompose("how do I reset my password", &cfg).is_empty());
    }

    #[test]
    fn disabled_flag_short_circuits() {
        let mut cfg = SearchConfig::default();
        cfg.query_decomp_enabled = false;
        assert!(decompose("rest api vs graphql", &cfg).is_empty());
    }

    #[test]
    fn respects_max_sub_queries_cap() {
        let mut cfg = SearchConfig::default();
        cfg.query_decomp_max_sub_queries = 1;
        let parts = decompose("rest api vs graphql", &cfg);
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn empty_capture_side_is_rejected() {
        let cfg = SearchConfig::default();
        assert!(decompose("vs graphql", &cfg).is_empty());
    }
}
