//! Candidate gates: the baseline `g0` gate and the `g_req` required-terms
//! gate, plus gate selection (SPEC_FULL.md §4.4).

use std::collections::HashMap;

use crate::config::SearchConfig;
use crate::document::DocumentStore;
use crate::fusion::{fuse_rrf, Ranking};
use crate::index::SparseIndex;
use crate::signals::{compute_signals, has_non_exceptions_signal, Signal, SignalContext, SignalHit};

/// One scored, signal-tagged node produced by a gate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node_id: String,
    pub score: f64,
    pub signals: Vec<SignalHit>,
}

/// A required term dropped or flagged by the DF guard.
#[derive(Debug, Clone)]
pub struct RequiredTermDfDecision {
    pub term: String,
    pub dropped: bool,
    /// Below `required_too_rare_ratio`: kept in the search but flagged, per
    /// SPEC_FULL.md §4.4 ("mark (but keep) if ratio < too_rare lower bound").
    pub too_rare: bool,
    pub df_ratio: f64,
}

/// `required_effect_status` (SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredEffectStatus {
    RequiredEffective,
    TermDroppedOrWeakened,
    RequiredNoneMatched,
    RequiredFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    G0,
    GReq,
}

/// Full result of gate selection: the chosen candidate set plus the
/// diagnostics the pipeline folds into `applied{…}`.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub gate_used: GateKind,
    pub candidates: Vec<Candidate>,
    pub required_terms_df_filtered: Vec<RequiredTermDfDecision>,
    pub required_terms_relaxed: bool,
    pub required_terms_relax_reason: Option<String>,
    pub required_effect_status: RequiredEffectStatus,
    /// Whether `MANUAL_FIND_PER_FILE_CANDIDATE_CAP` dropped at least one
    /// candidate from this gate's output (SPEC_FULL.md §6, §4.8 `stage_cap`).
    pub per_file_cap_applied: bool,
}

fn title_tokens_for(store: &DocumentStore, node_id: &str) -> Vec<String> {
    store
        .get(node_id)
        .map(|n| crate::tokenizer::tokenize(&crate::canonical::normalize(&n.title)))
        .unwrap_or_default()
        .into_iter()
        .map(|t| t.text)
        .collect()
}

/// `g0`: score every node in the manual with full-query BM25 plus signal
/// bonuses, keeping only nodes that carry at least one non-`exceptions`
/// signal.
#[must_use]
pub fn run_g0(
    index: &SparseIndex,
    store: &DocumentStore,
    query_tokens: &[String],
    exceptions_vocab: &[String],
    config: &SearchConfig,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    // SPEC_FULL.md §6, `MANUAL_FIND_SCAN_HARD_CAP`: a hard per-query ceiling
    // on how many nodes a single gate pass scores, independent of the
    // per-path decay rerank and dynamic cutoff that run afterward.
    for node in store.iter().take(config.scan_hard_cap) {
        let base = index.score_bm25(query_tokens, &node.id, config);
        let Some(node_tokens) = index.node_tokens(&node.id) else {
            continue;
        };
        let title_tokens = title_tokens_for(store, &node.id);
        let ctx = SignalContext {
            query_tokens,
            node_tokens,
            title_tokens: &title_tokens,
            exceptions_vocab,
        };
        let signals = compute_signals(&ctx, config);
        if !has_non_exceptions_signal(&signals) {
            continue;
        }
        let bonus_total: f64 = signals.iter().map(|h| h.bonus).sum();
        candidates.push(Candidate {
            node_id: node.id.clone(),
            score: base + bonus_total,
            signals,
        });
    }
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.node_id.cmp(&b.node_id)));
    candidates
}

/// Document-frequency ratio of `term` within the manual (fraction of nodes
/// containing it).
fn df_ratio(index: &SparseIndex, term: &str) -> f64 {
    if index.node_count() == 0 {
        return 0.0;
    }
    index.document_frequency(term) as f64 / index.node_count() as f64
}

fn apply_df_guard(index: &SparseIndex, required_terms: &[String], config: &SearchConfig) -> (Vec<String>, Vec<RequiredTermDfDecision>) {
    let mut surviving = Vec::new();
    let mut decisions = Vec::new();
    for term in required_terms {
        let ratio = df_ratio(index, term);
        let dropped = ratio > config.required_too_common_ratio;
        let too_rare = !dropped && ratio < config.required_too_rare_ratio;
        decisions.push(RequiredTermDfDecision {
            term: term.clone(),
            dropped,
            too_rare,
            df_ratio: ratio,
        });
        if !dropped {
            surviving.push(term.clone());
        }
    }
    (surviving, decisions)
}

fn score_candidate(
    index: &SparseIndex,
    store: &DocumentStore,
    node_id: &str,
    query_tokens: &[String],
    exceptions_vocab: &[String],
    config: &SearchConfig,
) -> Candidate {
    let base = index.score_bm25(query_tokens, node_id, config);
    let node_tokens = index.node_tokens(node_id).unwrap_or(&[]);
    let title_tokens = title_tokens_for(store, node_id);
    let ctx = SignalContext {
        query_tokens,
        node_tokens,
        title_tokens: &title_tokens,
        exceptions_vocab,
    };
    let signals = compute_signals(&ctx, config);
    let bonus_total: f64 = signals.iter().map(|h| h.bonus).sum();
    Candidate {
        node_id: node_id.to_owned(),
        score: base + bonus_total,
        signals,
    }
}

/// `g_req`: the required-terms gate. Returns `None` candidates (empty vec) if
/// `required_terms` is empty — callers should not invoke this gate in that
/// case, matching SPEC_FULL.md §4.4 ("executed only if required_terms is
/// non-empty").
#[must_use]
pub fn run_g_req(
    index: &SparseIndex,
    store: &DocumentStore,
    query_tokens: &[String],
    required_terms: &[String],
    exceptions_vocab: &[String],
    config: &SearchConfig,
) -> (Vec<Candidate>, Vec<RequiredTermDfDecision>) {
    if required_terms.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let (surviving, decisions) = apply_df_guard(index, required_terms, config);
    if surviving.is_empty() {
        return (Vec::new(), decisions);
    }

    let candidates = match surviving.len() {
        1 => {
            let term = &surviving[0];
            let idf = index.idf(term);
            index
                .nodes_containing(term)
                .into_iter()
                .take(config.scan_hard_cap)
                .map(|node_id| {
                    let mut candidate = score_candidate(index, store, node_id, query_tokens, exceptions_vocab, config);
                    candidate.score += config.required_lambda * idf;
                    candidate.signals.push(SignalHit {
                        signal: Signal::RequiredTerm,
                        bonus: config.required_lambda * idf,
                    });
                    candidate
                })
                .collect()
        }
        _ => {
            let t1 = &surviving[0];
            let t2 = &surviving[1];
            run_two_term_rrf(index, store, query_tokens, t1, t2, exceptions_vocab, config)
        }
    };

    let mut candidates = candidates;
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.node_id.cmp(&b.node_id)));
    (candidates, decisions)
}

fn build_ranking(
    index: &SparseIndex,
    store: &DocumentStore,
    node_ids: &[&str],
    query_tokens: &[String],
    exceptions_vocab: &[String],
    config: &SearchConfig,
) -> (Ranking, HashMap<String, Candidate>) {
    let mut scored: Vec<Candidate> = node_ids
        .iter()
        .map(|id| score_candidate(index, store, id, query_tokens, exceptions_vocab, config))
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.node_id.cmp(&b.node_id)));
    let ranking: Ranking = scored.iter().map(|c| (c.node_id.clone(), c.score)).collect();
    let by_id: HashMap<String, Candidate> = scored.into_iter().map(|c| (c.node_id.clone(), c)).collect();
    (ranking, by_id)
}

/// Three-pass RRF fusion for two-term `g_req`: `A` (contains `t1`), `B`
/// (contains `t2`), `A+B` (contains both). The survivor's signal is tagged
/// `required_terms_rrf` if more than one pass influenced its fused rank, else
/// `required_term`/`required_term_and` depending on which single pass it came
/// from.
fn run_two_term_rrf(
    index: &SparseIndex,
    store: &DocumentStore,
    query_tokens: &[String],
    t1: &str,
    t2: &str,
    exceptions_vocab: &[String],
    config: &SearchConfig,
) -> Vec<Candidate> {
    let nodes_a: Vec<&str> = index.nodes_containing(t1).into_iter().take(config.scan_hard_cap).collect();
    let nodes_b: Vec<&str> = index.nodes_containing(t2).into_iter().take(config.scan_hard_cap).collect();
    let nodes_a_set: std::collections::HashSet<&str> = nodes_a.iter().copied().collect();
    let nodes_both: Vec<&str> = nodes_b.iter().copied().filter(|n| nodes_a_set.contains(n)).collect();

    let (ranking_a, by_id_a) = build_ranking(index, store, &nodes_a, query_tokens, exceptions_vocab, config);
    let (ranking_b, by_id_b) = build_ranking(index, store, &nodes_b, query_tokens, exceptions_vocab, config);
    let (ranking_ab, by_id_ab) = build_ranking(index, store, &nodes_both, query_tokens, exceptions_vocab, config);

    let mut base_scores: HashMap<String, f64> = HashMap::new();
    for map in [&by_id_a, &by_id_b, &by_id_ab] {
        for (id, candidate) in map {
            base_scores.entry(id.clone()).or_insert(candidate.score);
        }
    }

    let mut pass_membership: HashMap<String, u8> = HashMap::new();
    for (mask, ranking) in [(0b001u8, &ranking_a), (0b010u8, &ranking_b), (0b100u8, &ranking_ab)] {
        for (id, _) in ranking {
            *pass_membership.entry(id.clone()).or_insert(0) |= mask;
        }
    }

    let fused = fuse_rrf(
        &[ranking_a, ranking_b, ranking_ab],
        &base_scores,
        config.query_decomp_rrf_k,
        config.query_decomp_base_weight,
    );

    fused
        .into_iter()
        .map(|hit| {
            let mask = pass_membership.get(&hit.node_id).copied().unwrap_or(0);
            let popcount = mask.count_ones();
            let signal = if popcount > 1 {
                Signal::RequiredTermsRrf
            } else if mask & 0b100 != 0 {
                Signal::RequiredTermAnd
            } else {
                Signal::RequiredTerm
            };
            let mut candidate = by_id_a
                .get(&hit.node_id)
                .or_else(|| by_id_b.get(&hit.node_id))
                .or_else(|| by_id_ab.get(&hit.node_id))
                .cloned()
                .unwrap_or(Candidate {
                    node_id: hit.node_id.clone(),
                    score: hit.blended_score,
                    signals: Vec::new(),
                });
            candidate.score = hit.blended_score;
            candidate.signals.push(SignalHit { signal, bonus: 0.0 });
            candidate
        })
        .collect()
}

/// Hard per-path cap on a gate's survivors (SPEC_FULL.md §6,
/// `MANUAL_FIND_PER_FILE_CANDIDATE_CAP`): keeps at most `cap` candidates from
/// any single file, distinct from `diversity.rs`'s softer per-path score
/// decay that runs later over the fused ranking. `candidates` must already be
/// sorted by score descending so the kept survivors per path are the
/// highest-scoring ones.
fn enforce_per_file_cap(candidates: Vec<Candidate>, store: &DocumentStore, cap: usize) -> (Vec<Candidate>, bool) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut kept = Vec::with_capacity(candidates.len());
    let mut truncated = false;
    for candidate in candidates {
        let path = store.get(&candidate.node_id).map(|n| n.relative_path.clone()).unwrap_or_default();
        let count = counts.entry(path).or_insert(0);
        if *count >= cap {
            truncated = true;
            continue;
        }
        *count += 1;
        kept.push(candidate);
    }
    (kept, truncated)
}

fn compute_required_effect_status(
    g_req_candidates: &[Candidate],
    decisions: &[RequiredTermDfDecision],
    gate_used: GateKind,
    top_k_with_required_signal: usize,
    top_k_total: usize,
) -> RequiredEffectStatus {
    if matches!(gate_used, GateKind::G0) {
        return RequiredEffectStatus::RequiredFallback;
    }
    if decisions.iter().any(|d| d.dropped) {
        return RequiredEffectStatus::TermDroppedOrWeakened;
    }
    if g_req_candidates.is_empty() {
        return RequiredEffectStatus::RequiredNoneMatched;
    }
    if top_k_total > 0 && top_k_with_required_signal == 0 {
        return RequiredEffectStatus::RequiredNoneMatched;
    }
    RequiredEffectStatus::RequiredEffective
}

/// Run both gates and select per SPEC_FULL.md §4.4's gate-selection rule: use
/// `g_req` if it produced at least one candidate, otherwise fall back to `g0`
/// and mark the relaxation.
#[must_use]
pub fn select_gate(
    index: &SparseIndex,
    store: &DocumentStore,
    query_tokens: &[String],
    required_terms: &[String],
    exceptions_vocab: &[String],
    config: &SearchConfig,
) -> GateOutcome {
    if required_terms.is_empty() {
        let candidates = run_g0(index, store, query_tokens, exceptions_vocab, config);
        let (candidates, per_file_cap_applied) = enforce_per_file_cap(candidates, store, config.per_file_candidate_cap);
        return GateOutcome {
            gate_used: GateKind::G0,
            required_effect_status: RequiredEffectStatus::RequiredFallback,
            candidates,
            required_terms_df_filtered: Vec::new(),
            required_terms_relaxed: false,
            required_terms_relax_reason: None,
            per_file_cap_applied,
        };
    }

    let (g_req_candidates, decisions) =
        run_g_req(index, store, query_tokens, required_terms, exceptions_vocab, config);

    if !g_req_candidates.is_empty() {
        let (g_req_candidates, per_file_cap_applied) =
            enforce_per_file_cap(g_req_candidates, store, config.per_file_candidate_cap);
        let required_signal_count = g_req_candidates
            .iter()
            .filter(|c| {
                c.signals.iter().any(|s| {
                    matches!(
                        s.signal,
                        Signal::RequiredTerm | Signal::RequiredTermAnd | Signal::RequiredTermsRrf
                    )
                })
            })
            .count();
        let status = compute_required_effect_status(
            &g_req_candidates,
            &decisions,
            GateKind::GReq,
            required_signal_count,
            g_req_candidates.len(),
        );
        return GateOutcome {
            gate_used: GateKind::GReq,
            candidates: g_req_candidates,
            required_terms_df_filtered: decisions,
            required_terms_relaxed: false,
            required_terms_relax_reason: None,
            required_effect_status: status,
            per_file_cap_applied,
        };
    }

    let candidates = run_g0(index, store, query_tokens, exceptions_vocab, config);
    let (candidates, per_file_cap_applied) = enforce_per_file_cap(candidates, store, config.per_file_candidate_cap);
    GateOutcome {
        gate_used: GateKind::G0,
        per_file_cap_applied,
        candidates,
        required_terms_df_filtered: decisions,
        required_terms_relaxed: true,
        required_terms_relax_reason: Some("zero_candidates_with_required_terms".to_owned()),
        required_effect_status: RequiredEffectStatus::RequiredFallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentStore, FsDocumentSource};
    use crate::manual::Manual;

    fn build(files: &[(&str, &str)]) -> (tempfile::TempDir, DocumentStore, SparseIndex) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).unwrap();
        }
        let manual = Manual::new("m", dir.path()).unwrap();
        let store = DocumentStore::build(&manual, &FsDocumentSource).unwrap();
        let index = SparseIndex::build(&store, "fp");
        (dir, store, index)
    }

    #[test]
    fn g0_excludes_nodes_with_zero_signals() {
        let (_dir, store, index) = build(&[("a.md", "# A\nalpha beta\n"), ("b.md", "# B\nunrelated text\n")]);
        let cfg = SearchConfig::default();
        let candidates = run_g0(&index, &store, &["alpha".to_owned()], &[], &cfg);
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn g_req_single_term_boosts_by_idf() {
        let (_dir, store, index) = build(&[
            ("a.md", "# A\nneeded term here\n"),
            ("b.md", "# B\nneeded term here too\n"),
            ("c.md", "# C\nno match\n"),
        ]);
        let cfg = SearchConfig::default();
        let (candidates, decisions) =
            run_g_req(&index, &store, &["needed".to_owned()], &["needed".to_owned()], &[], &cfg);
        assert_eq!(candidates.len(), 2);
        assert!(decisions.iter().all(|d| !d.dropped));
    }

    #[test]
    fn g_req_df_guard_drops_too_common_term() {
        let (_dir, store, index) = build(&[
            ("a.md", "# A\ncommon\n"),
            ("b.md", "# B\ncommon\n"),
            ("c.md", "# C\ncommon\n"),
        ]);
        let cfg = SearchConfig::default();
        let (_candidates, decisions) =
            run_g_req(&index, &store, &["common".to_owned()], &["common".to_owned()], &[], &cfg);
        assert!(decisions[0].dropped);
    }

    #[test]
    fn gate_selection_falls_back_to_g0_when_g_req_empty() {
        let (_dir, store, index) = build(&[("a.md", "# A\nsome text here\n")]);
        let cfg = SearchConfig::default();
        let outcome = select_gate(
            &index,
            &store,
            &["some".to_owned(), "text".to_owned()],
            &["nonexistent_term".to_owned()],
            &[],
            &cfg,
        );
        assert_eq!(outcome.gate_used, GateKind::G0);
        assert!(outcome.required_terms_relaxed);
        assert_eq!(
            outcome.required_terms_relax_reason.as_deref(),
            Some("zero_candidates_with_required_terms")
        );
    }

    #[test]
    fn gate_selection_prefers_g_req_when_it_has_candidates() {
        let (_dir, store, index) = build(&[("a.md", "# A\nneeded term here\n"), ("b.md", "# B\nother\n")]);
        let cfg = SearchConfig::default();
        let outcome = select_gate(&index, &store, &["needed".to_owned()], &["needed".to_owned()], &[], &cfg);
        assert_eq!(outcome.gate_used, GateKind::GReq);
        assert_eq!(outcome.required_effect_status, RequiredEffectStatus::RequiredEffective);
    }

    #[test]
    fn two_term_mode_tags_rrf_survivors() {
        let (_dir, store, index) = build(&[
            ("a.md", "# A\nalpha beta\n"),
            ("b.md", "# B\nalpha only\n"),
            ("c.md", "# C\nbeta only\n"),
        ]);
        let cfg = SearchConfig::default();
        let (candidates, _decisions) = run_g_req(
            &index,
            &store,
            &["alpha".to_owned(), "beta".to_owned()],
            &["alpha".to_owned(), "beta".to_owned()],
            &[],
            &cfg,
        );
        assert_eq!(candidates.len(), 3);
        let both_node = store.iter().next().unwrap();
        let both_candidate = candidates.iter().find(|c| c.node_id == both_node.id).unwrap();
        assert!(both_candidate
            .signals
            .iter()
            .any(|s| s.signal == Signal::RequiredTermsRrf));
    }
}
