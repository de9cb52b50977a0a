//! Post-fusion per-path diversity decay and dynamic cutoff (SPEC_FULL.md
//! §4.8).
//!
//! This stage has no single teacher file to ground on — the pack's `lib.rs`
//! re-exports `DiversityConfig`/`DiversityMeta`/`DiversityResult`/`diversify`
//! and four `DIVERSITY_*_ENV` constants without shipping the implementation
//! file itself. The shape below follows those re-exported names and the
//! config-struct-with-`from_env()` idiom established by `config.rs` and
//! `fusion.rs`'s `RrfConfig::from_env()`.

use crate::config::SearchConfig;

pub const DIVERSITY_ALPHA_ENV: &str = "MANUAL_FIND_DIVERSITY_ALPHA";
pub const DIVERSITY_CUTOFF_SCORE_RATIO_ENV: &str = "MANUAL_FIND_CUTOFF_SCORE_RATIO";
pub const DIVERSITY_CUTOFF_MIN_COVERAGE_ENV: &str = "MANUAL_FIND_CUTOFF_MIN_COVERAGE";
pub const DIVERSITY_MAX_CANDIDATES_ENV: &str = "MANUAL_FIND_SCAN_HARD_CAP";

/// Parameters for the diversity/cutoff stage, mirrored off `SearchConfig`
/// rather than re-reading the environment so there is exactly one source of
/// truth for a process's configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiversityConfig {
    pub alpha: f64,
    pub cutoff_score_ratio: f64,
    pub cutoff_min_coverage: f64,
}

impl DiversityConfig {
    #[must_use]
    pub fn from_search_config(config: &SearchConfig) -> Self {
        Self {
            alpha: config.diversity_alpha,
            cutoff_score_ratio: config.cutoff_score_ratio,
            cutoff_min_coverage: config.cutoff_min_coverage,
        }
    }
}

/// Why the cutoff stage removed or truncated candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffReason {
    TimeBudget,
    CandidateCap,
    DynamicCutoff,
    StageCap,
}

/// A candidate as seen by the diversity stage: enough to decay by path and
/// apply the score/coverage floor.
#[derive(Debug, Clone)]
pub struct DiversityInput {
    pub node_id: String,
    pub path: String,
    pub score: f64,
    pub match_coverage: f64,
}

/// Diagnostic attached to a surviving candidate.
#[derive(Debug, Clone, Copy)]
pub struct DiversityMeta {
    pub decay: f64,
    pub original_rank: usize,
}

/// One surviving candidate with its post-decay score and diagnostics.
#[derive(Debug, Clone)]
pub struct DiversifiedCandidate {
    pub node_id: String,
    pub path: String,
    pub score: f64,
    pub match_coverage: f64,
    pub meta: DiversityMeta,
}

#[derive(Debug, Clone)]
pub struct DiversityResult {
    pub candidates: Vec<DiversifiedCandidate>,
    pub cutoff_reason: Option<CutoffReason>,
    pub removed_count: usize,
}

/// Apply per-path decay then the dynamic score/coverage cutoff to a
/// score-descending `items` list.
///
/// Decay: the k-th candidate (0-based duplicate count) sharing a `path` with
/// a higher-ranked candidate has its score multiplied by `1/(1+alpha*k)`; the
/// first candidate on a path is undecayed (`k=0`).
///
/// Cutoff: the result is first capped to `min(max_candidates, 50)`
/// (`candidate_cap` if that actually truncates), then any tail candidate with
/// `score < head_score * cutoff_score_ratio && match_coverage <
/// cutoff_min_coverage` is dropped (`dynamic_cutoff`).
#[must_use]
pub fn diversify(items: Vec<DiversityInput>, max_candidates: usize, config: &DiversityConfig) -> DiversityResult {
    let mut decayed: Vec<DiversifiedCandidate> = Vec::with_capacity(items.len());
    let mut path_seen_count: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for (rank, item) in items.into_iter().enumerate() {
        let k = *path_seen_count.get(&item.path).unwrap_or(&0);
        path_seen_count.insert(item.path.clone(), k + 1);
        let decay = 1.0 / (1.0 + config.alpha * k as f64);
        decayed.push(DiversifiedCandidate {
            node_id: item.node_id,
            path: item.path,
            score: item.score * decay,
            match_coverage: item.match_coverage,
            meta: DiversityMeta { decay, original_rank: rank },
        });
    }

    decayed.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.node_id.cmp(&b.node_id)));

    let mut cutoff_reason = None;
    let cap = max_candidates.min(50);
    let mut removed = 0usize;
    if decayed.len() > cap {
        removed += decayed.len() - cap;
        decayed.truncate(cap);
        cutoff_reason = Some(CutoffReason::CandidateCap);
    }

    if let Some(head_score) = decayed.first().map(|c| c.score) {
        if head_score > 0.0 {
            let floor = head_score * config.cutoff_score_ratio;
            let before = decayed.len();
            decayed.retain(|c| !(c.score < floor && c.match_coverage < config.cutoff_min_coverage));
            if decayed.len() < before {
                removed += before - decayed.len();
                cutoff_reason = Some(CutoffReason::DynamicCutoff);
            }
        }
    }

    DiversityResult {
        candidates: decayed,
        cutoff_reason,
        removed_count: removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DiversityConfig {
        DiversityConfig {
            alpha: 0.5,
            cutoff_score_ratio: 0.15,
            cutoff_min_coverage: 0.20,
        }
    }

    fn item(id: &str, path: &str, score: f64, coverage: f64) -> DiversityInput {
        DiversityInput {
            node_id: id.to_owned(),
            path: path.to_owned(),
            score,
            match_coverage: coverage,
        }
    }

    #[test]
    fn first_candidate_on_a_path_is_undecayed() {
        let items = vec![item("a", "p1", 10.0, 1.0)];
        let result = diversify(items, 50, &cfg());
        assert!((result.candidates[0].score - 10.0).abs() < 1e-9);
        assert!((result.candidates[0].meta.decay - 1.0).abs() < 1e-9);
    }

    #[test]
    fn second_candidate_on_same_path_is_decayed() {
        let items = vec![item("a", "p1", 10.0, 1.0), item("b", "p1", 9.0, 1.0)];
        let result = diversify(items, 50, &cfg());
        let b = result.candidates.iter().find(|c| c.node_id == "b").unwrap();
        assert!((b.meta.decay - (1.0 / 1.5)).abs() < 1e-9);
    }

    #[test]
    fn different_paths_are_not_decayed_against_each_other() {
        let items = vec![item("a", "p1", 10.0, 1.0), item("b", "p2", 9.0, 1.0)];
        let result = diversify(items, 50, &cfg());
        assert!((result.candidates[1].score - 9.0).abs() < 1e-9);
    }

    #[test]
    fn candidate_cap_truncates_and_is_recorded() {
        let items: Vec<DiversityInput> = (0..10).map(|i| item(&format!("n{i}"), &format!("p{i}"), 10.0 - i as f64, 1.0)).collect();
        let result = diversify(items, 5, &cfg());
        assert_eq!(result.candidates.len(), 5);
        assert_eq!(result.cutoff_reason, Some(CutoffReason::CandidateCap));
        assert_eq!(result.removed_count, 5);
    }

    #[test]
    fn dynamic_cutoff_removes_low_score_low_coverage_tail() {
        let items = vec![
            item("a", "p1", 10.0, 1.0),
            item("b", "p2", 0.5, 0.05), // below both floor and coverage
        ];
        let result = diversify(items, 50, &cfg());
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.cutoff_reason, Some(CutoffReason::DynamicCutoff));
    }

    #[test]
    fn low_score_but_sufficient_coverage_survives_cutoff() {
        let items = vec![item("a", "p1", 10.0, 1.0), item("b", "p2", 0.5, 0.9)];
        let result = diversify(items, 50, &cfg());
        assert_eq!(result.candidates.len(), 2);
    }

    #[test]
    fn no_reduction_when_everything_fits_and_clears_the_floor() {
        let items = vec![item("a", "p1", 10.0, 1.0), item("b", "p2", 9.0, 1.0)];
        let result = diversify(items, 50, &cfg());
        assert_eq!(result.candidates.len(), 2);
        assert_eq!(result.cutoff_reason, None);
    }
}
