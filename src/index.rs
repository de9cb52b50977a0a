//! Per-manual sparse inverted index with BM25 scoring, query-coverage and
//! node-coverage corrections, and a length penalty (SPEC_FULL.md §4.3).

use std::collections::HashMap;

use crate::canonical::normalize;
use crate::config::SearchConfig;
use crate::document::DocumentStore;
use crate::tokenizer::{tokenize, Token};

/// BM25 free parameters. Defaults match the corpus-standard `k1 ≈ 1.2, b ≈
/// 0.75` recommendation; not exposed through `SearchConfig` since SPEC_FULL.md
/// names them as fixed constants, unlike the signal weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

#[derive(Debug, Clone, Default)]
struct PostingList {
    /// node_id -> (term frequency, token positions for phrase/proximity).
    entries: HashMap<String, (u32, Vec<usize>)>,
}

/// An inverted index over one manual's nodes.
#[derive(Debug, Clone)]
pub struct SparseIndex {
    params: Bm25Params,
    postings: HashMap<String, PostingList>,
    /// Token count per node, used for the BM25 length normalization term.
    node_token_count: HashMap<String, usize>,
    /// Character count per node, used for the length-penalty correction.
    node_char_count: HashMap<String, usize>,
    /// Tokens actually present in each node, by normalized text. Needed for
    /// node-coverage and phrase/proximity signals.
    node_tokens: HashMap<String, Vec<Token>>,
    total_tokens: u64,
    node_count: usize,
    /// The fingerprint this index was built against, for staleness checks.
    fingerprint: String,
}

impl SparseIndex {
    /// Build an index over every node in `store`, eagerly (SPEC_FULL.md §4.3:
    /// "Indexing is eager at first request per manual").
    #[must_use]
    pub fn build(store: &DocumentStore, fingerprint: impl Into<String>) -> Self {
        let mut postings: HashMap<String, PostingList> = HashMap::new();
        let mut node_token_count = HashMap::new();
        let mut node_char_count = HashMap::new();
        let mut node_tokens = HashMap::new();
        let mut total_tokens = 0u64;
        let mut node_count = 0usize;

        for node in store.iter() {
            let normalized = normalize(&node.text);
            let tokens = tokenize(&normalized);
            node_char_count.insert(node.id.clone(), normalized.chars().count());
            node_token_count.insert(node.id.clone(), tokens.len());
            total_tokens += tokens.len() as u64;
            node_count += 1;

            for token in &tokens {
                let list = postings.entry(token.text.clone()).or_default();
                let entry = list.entries.entry(node.id.clone()).or_insert((0, Vec::new()));
                entry.0 += 1;
                entry.1.push(token.seq);
            }
            node_tokens.insert(node.id.clone(), tokens);
        }

        Self {
            params: Bm25Params::default(),
            postings,
            node_token_count,
            node_char_count,
            node_tokens,
            total_tokens,
            node_count,
            fingerprint: fingerprint.into(),
        }
    }

    #[must_use]
    pub fn is_stale(&self, current_fingerprint: &str) -> bool {
        self.fingerprint != current_fingerprint
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    fn avg_token_count(&self) -> f64 {
        if self.node_count == 0 {
            0.0
        } else {
            self.total_tokens as f64 / self.node_count as f64
        }
    }

    /// Document frequency of `term`: number of nodes containing it at least once.
    #[must_use]
    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, |l| l.entries.len())
    }

    /// Inverse document frequency, Okapi BM25 form (never negative).
    #[must_use]
    pub fn idf(&self, term: &str) -> f64 {
        let n = self.node_count as f64;
        let df = self.document_frequency(term) as f64;
        if n == 0.0 {
            return 0.0;
        }
        let raw = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
        raw.max(0.0)
    }

    /// Nodes containing `term`, with term frequency (used by the required-term
    /// gate's per-term node sets).
    #[must_use]
    pub fn nodes_containing(&self, term: &str) -> Vec<&str> {
        self.postings
            .get(term)
            .map(|l| l.entries.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn node_tokens(&self, node_id: &str) -> Option<&[Token]> {
        self.node_tokens.get(node_id).map(Vec::as_slice)
    }

    /// Raw, un-corrected BM25 score of `node_id` against `query_tokens` (already
    /// normalized/tokenized text).
    #[must_use]
    pub fn score_bm25_raw(&self, query_tokens: &[String], node_id: &str) -> f64 {
        let Some(&length) = self.node_token_count.get(node_id) else {
            return 0.0;
        };
        let avgdl = self.avg_token_count();
        let mut score = 0.0;
        for term in query_tokens {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let Some(&(tf, _)) = list.entries.get(node_id) else {
                continue;
            };
            let idf = self.idf(term);
            let tf = f64::from(tf);
            let denom = tf + self.params.k1 * (1.0 - self.params.b + self.params.b * length as f64 / avgdl.max(1.0));
            score += idf * (tf * (self.params.k1 + 1.0)) / denom.max(f64::EPSILON);
        }
        score
    }

    /// BM25 score with the query-coverage, node-coverage, and length-penalty
    /// corrections from SPEC_FULL.md §4.3 applied.
    #[must_use]
    pub fn score_bm25(&self, query_tokens: &[String], node_id: &str, config: &SearchConfig) -> f64 {
        let raw = self.score_bm25_raw(query_tokens, node_id);
        if raw <= 0.0 {
            return 0.0;
        }

        let unique_query_terms: std::collections::HashSet<&String> = query_tokens.iter().collect();
        let unique_hit = unique_query_terms
            .iter()
            .filter(|term| {
                self.postings
                    .get(term.as_str())
                    .is_some_and(|l| l.entries.contains_key(node_id))
            })
            .count();
        let query_coverage_ratio = if unique_query_terms.is_empty() {
            0.0
        } else {
            unique_hit as f64 / unique_query_terms.len() as f64
        };

        let node_coverage = self.node_coverage(query_tokens, node_id);

        let char_count = self.node_char_count.get(node_id).copied().unwrap_or(0) as f64;
        let length_penalty = config.lexical_length_penalty_weight * (1.0 + char_count / 4000.0).ln();

        let with_query_coverage = raw * (1.0 + config.sparse_query_coverage_weight * query_coverage_ratio);
        let with_node_coverage = with_query_coverage * (1.0 + config.lexical_coverage_weight * node_coverage);
        (with_node_coverage - length_penalty).max(0.0)
    }

    /// Fraction of distinct query terms present in the node, independent of
    /// term frequency (distinct from BM25's frequency-weighted coverage).
    #[must_use]
    pub fn node_coverage(&self, query_tokens: &[String], node_id: &str) -> f64 {
        let unique: std::collections::HashSet<&String> = query_tokens.iter().collect();
        if unique.is_empty() {
            return 0.0;
        }
        let hit = unique
            .iter()
            .filter(|term| {
                self.postings
                    .get(term.as_str())
                    .is_some_and(|l| l.entries.contains_key(node_id))
            })
            .count();
        hit as f64 / unique.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentStore, FsDocumentSource};
    use crate::manual::Manual;

    fn build_store(files: &[(&str, &str)]) -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).unwrap();
        }
        let manual = Manual::new("m", dir.path()).unwrap();
        let store = DocumentStore::build(&manual, &FsDocumentSource).unwrap();
        (dir, store)
    }

    #[test]
    fn term_present_in_more_nodes_scores_lower_idf() {
        let (_dir, store) = build_store(&[
            ("a.md", "# A\ncommon rare_term alpha\n"),
            ("b.md", "# B\ncommon beta\n"),
            ("c.md", "# C\ncommon gamma\n"),
        ]);
        let idx = SparseIndex::build(&store, "fp1");
        assert!(idx.idf("rare_term") > idx.idf("common"));
    }

    #[test]
    fn score_is_zero_for_node_without_any_query_term() {
        let (_dir, store) = build_store(&[("a.md", "# A\nfoo bar\n"), ("b.md", "# B\nbaz qux\n")]);
        let idx = SparseIndex::build(&store, "fp1");
        let cfg = SearchConfig::default();
        let node_b = store.iter().nth(1).unwrap().id.clone();
        assert_eq!(idx.score_bm25(&["foo".to_owned()], &node_b, &cfg), 0.0);
    }

    #[test]
    fn higher_term_frequency_scores_higher() {
        let (_dir, store) = build_store(&[
            ("a.md", "# A\nfoo foo foo other words here\n"),
            ("b.md", "# B\nfoo other words here\n"),
        ]);
        let idx = SparseIndex::build(&store, "fp1");
        let cfg = SearchConfig::default();
        let node_a = store.iter().next().unwrap().id.clone();
        let node_b = store.iter().nth(1).unwrap().id.clone();
        let score_a = idx.score_bm25(&["foo".to_owned()], &node_a, &cfg);
        let score_b = idx.score_bm25(&["foo".to_owned()], &node_b, &cfg);
        assert!(score_a > score_b);
    }

    #[test]
    fn full_query_coverage_scores_higher_than_partial() {
        let (_dir, store) = build_store(&[
            ("a.md", "# A\nfoo bar baz\n"),
            ("b.md", "# B\nfoo only here\n"),
        ]);
        let idx = SparseIndex::build(&store, "fp1");
        let cfg = SearchConfig::default();
        let node_a = store.iter().next().unwrap().id.clone();
        let node_b = store.iter().nth(1).unwrap().id.clone();
        let query = vec!["foo".to_owned(), "bar".to_owned(), "baz".to_owned()];
        let score_a = idx.score_bm25(&query, &node_a, &cfg);
        let score_b = idx.score_bm25(&query, &node_b, &cfg);
        assert!(score_a > score_b);
    }

    #[test]
    fn stale_detection_uses_fingerprint() {
        let (_dir, store) = build_store(&[("a.md", "# A\nfoo\n")]);
        let idx = SparseIndex::build(&store, "fp1");
        assert!(!idx.is_stale("fp1"));
        assert!(idx.is_stale("fp2"));
    }

    #[test]
    fn document_frequency_counts_distinct_nodes_not_occurrences() {
        let (_dir, store) = build_store(&[("a.md", "# A\nfoo foo foo\n"), ("b.md", "# B\nbar\n")]);
        let idx = SparseIndex::build(&store, "fp1");
        assert_eq!(idx.document_frequency("foo"), 1);
        assert_eq!(idx.document_frequency("missing"), 0);
    }
}
