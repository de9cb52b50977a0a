//! Orchestration: `find`/`hits`/`invalidate`, the public entry points of the
//! manual search core (SPEC_FULL.md §4.11).
//!
//! `Pipeline` is the one type application code constructs directly. It wires
//! together every other module behind the collaborator traits declared in
//! `collab.rs` (`DocumentSource`, `Clock`, `IdGenerator`) plus a process-wide
//! `SearchConfig`, and owns the three pieces of long-lived state the spec
//! calls out: a per-manual `SparseIndex` cache, a `SemanticCache`, and a
//! `TraceStore`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info_span};

use crate::cache::{compute_key, CacheConfig, SemCacheKeyInput, SemCacheMode, SemanticCache};
use crate::canonical::normalize;
use crate::collab::{Clock, CounterIdGenerator, IdGenerator, SystemClock};
use crate::config::SearchConfig;
use crate::decompose::decompose;
use crate::diversity::{diversify, CutoffReason, DiversityConfig, DiversityInput};
use crate::document::{validate_manual_has_content, DocumentSource, DocumentStore, FsDocumentSource};
use crate::error::{SearchCoreError, SearchResult};
use crate::fusion::{fuse_rrf_default, Ranking};
use crate::gates::{select_gate, Candidate, GateKind, GateOutcome, RequiredEffectStatus, RequiredTermDfDecision};
use crate::index::SparseIndex;
use crate::manual::{Manual, RESERVED_ROOT_MANUAL_ID};
use crate::signals::{exploration_bonus, Signal};
use crate::stats::{AdaptiveStats, StatsRecord};
use crate::tokenizer::tokenize;
use crate::trace::TraceStore;

/// `budget` request field: a soft time box and a hard candidate cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    pub time_ms: u64,
    pub max_candidates: usize,
}

impl Default for Budget {
    fn default() -> Self {
        Self { time_ms: 2_000, max_candidates: 50 }
    }
}

impl Budget {
    fn validate(self) -> SearchResult<Self> {
        if self.time_ms < 1 {
            return Err(SearchCoreError::InvalidParameter("budget.time_ms must be >= 1".into()));
        }
        if self.max_candidates < 1 {
            return Err(SearchCoreError::InvalidParameter("budget.max_candidates must be >= 1".into()));
        }
        Ok(self)
    }
}

/// Inputs to [`Pipeline::find`] (SPEC_FULL.md §4.11).
#[derive(Debug, Clone)]
pub struct FindParams {
    pub query: String,
    pub manual_id: String,
    pub required_terms: Vec<String>,
    pub expand_scope: bool,
    pub only_unscanned_from_trace_id: Option<String>,
    pub include_claim_graph: bool,
    pub use_cache: bool,
    pub budget: Budget,
    pub inline_hits_limit: Option<usize>,
    /// Caller-supplied tie-breaker vocabulary for the `exceptions` signal
    /// (SPEC_FULL.md §4.5). Not part of the distilled spec's named input
    /// list, but the signal itself is defined as caller-provided, so it must
    /// enter the pipeline from somewhere; defaults to empty.
    pub exceptions_vocab: Vec<String>,
}

impl FindParams {
    #[must_use]
    pub fn new(query: impl Into<String>, manual_id: impl Into<String>, required_terms: Vec<String>) -> Self {
        Self {
            query: query.into(),
            manual_id: manual_id.into(),
            required_terms,
            expand_scope: false,
            only_unscanned_from_trace_id: None,
            include_claim_graph: false,
            use_cache: true,
            budget: Budget::default(),
            inline_hits_limit: None,
            exceptions_vocab: Vec::new(),
        }
    }

    /// Validate the structural invariants from SPEC_FULL.md §8 (invariants
    /// 4, 5, 7) that do not depend on manual content.
    fn validate(&self) -> SearchResult<()> {
        if self.query.trim().is_empty() {
            return Err(SearchCoreError::InvalidParameter("query must not be empty".into()));
        }
        if self.manual_id.is_empty() {
            return Err(SearchCoreError::InvalidParameter("manual_id must not be empty".into()));
        }
        if self.manual_id == RESERVED_ROOT_MANUAL_ID {
            return Err(SearchCoreError::InvalidParameter(format!(
                "manual_id {RESERVED_ROOT_MANUAL_ID:?} is reserved"
            )));
        }
        if self.required_terms.is_empty() || self.required_terms.len() > 2 {
            return Err(SearchCoreError::InvalidParameter(
                "required_terms must contain 1 or 2 non-empty strings".into(),
            ));
        }
        if self.required_terms.iter().any(|t| t.trim().is_empty()) {
            return Err(SearchCoreError::InvalidParameter("required_terms entries must not be empty".into()));
        }
        self.budget.validate()?;
        if let Some(limit) = self.inline_hits_limit {
            if !(1..=5).contains(&limit) {
                return Err(SearchCoreError::InvalidParameter("inline_hits.limit must be in 1..=5".into()));
            }
        }
        // Cross-manual expansion is an explicit Non-goal (SPEC_FULL.md §1): a
        // `find` call is always scoped to exactly one manual.
        if self.expand_scope {
            return Err(SearchCoreError::OutOfScope(
                "cross-manual scope expansion is not supported".into(),
            ));
        }
        Ok(())
    }

    /// Strict boolean/integer type-checking entry point for callers that hold
    /// a loosely-typed JSON request (e.g. an MCP transport layer): a JSON
    /// `true`/`false` where an integer is expected, or vice versa, is
    /// `invalid_parameter` (SPEC_FULL.md §8, invariant 6) rather than being
    /// silently coerced.
    pub fn from_json(value: &serde_json::Value) -> SearchResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| SearchCoreError::InvalidParameter("params must be a JSON object".into()))?;

        let query = json_required_string(obj, "query")?;
        let manual_id = json_required_string(obj, "manual_id")?;
        let required_terms = json_required_string_array(obj, "required_terms")?;

        let mut params = Self::new(query, manual_id, required_terms);
        if let Some(v) = obj.get("expand_scope") {
            params.expand_scope = json_strict_bool(v, "expand_scope")?;
        }
        if let Some(v) = obj.get("include_claim_graph") {
            params.include_claim_graph = json_strict_bool(v, "include_claim_graph")?;
        }
        if let Some(v) = obj.get("use_cache") {
            params.use_cache = json_strict_bool(v, "use_cache")?;
        }
        if let Some(v) = obj.get("only_unscanned_from_trace_id") {
            if !v.is_null() {
                params.only_unscanned_from_trace_id = Some(
                    v.as_str()
                        .ok_or_else(|| SearchCoreError::InvalidParameter("only_unscanned_from_trace_id must be a string".into()))?
                        .to_owned(),
                );
            }
        }
        if let Some(v) = obj.get("budget") {
            let budget_obj = v
                .as_object()
                .ok_or_else(|| SearchCoreError::InvalidParameter("budget must be an object".into()))?;
            let mut budget = Budget::default();
            if let Some(t) = budget_obj.get("time_ms") {
                budget.time_ms = json_strict_u64(t, "budget.time_ms")?;
            }
            if let Some(m) = budget_obj.get("max_candidates") {
                budget.max_candidates = json_strict_u64(m, "budget.max_candidates")? as usize;
            }
            params.budget = budget;
        }
        if let Some(v) = obj.get("inline_hits") {
            let inline_obj = v
                .as_object()
                .ok_or_else(|| SearchCoreError::InvalidParameter("inline_hits must be an object".into()))?;
            if let Some(l) = inline_obj.get("limit") {
                params.inline_hits_limit = Some(json_strict_u64(l, "inline_hits.limit")? as usize);
            }
        }
        params.validate()?;
        Ok(params)
    }
}

fn json_required_string(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> SearchResult<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| SearchCoreError::InvalidParameter(format!("{key} must be a non-empty string")))
}

fn json_required_string_array(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> SearchResult<Vec<String>> {
    let arr = obj
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| SearchCoreError::InvalidParameter(format!("{key} must be an array of strings")))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| SearchCoreError::InvalidParameter(format!("{key} entries must be strings")))
        })
        .collect()
}

/// Reject a JSON boolean passed where an integer is expected, and vice versa
/// (SPEC_FULL.md §8, invariant 6).
fn json_strict_bool(value: &serde_json::Value, field: &str) -> SearchResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| SearchCoreError::InvalidParameter(format!("{field} must be a boolean")))
}

fn json_strict_u64(value: &serde_json::Value, field: &str) -> SearchResult<u64> {
    if value.is_boolean() {
        return Err(SearchCoreError::InvalidParameter(format!("{field} must be an integer, not a boolean")));
    }
    let n = value
        .as_u64()
        .ok_or_else(|| SearchCoreError::InvalidParameter(format!("{field} must be a non-negative integer")))?;
    Ok(n)
}

/// `integration_status` (SPEC_FULL.md §4.11 summary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Complete,
    Partial,
    Empty,
}

/// Compressed reference to a node, used throughout response payloads.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeRef {
    pub manual_id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub title: String,
}

/// One surviving candidate in a trace payload (SPEC_FULL.md §3, §4.11).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CandidateItem {
    pub node_ref: NodeRef,
    pub score: f64,
    pub signals: Vec<Signal>,
    pub matched_tokens: Vec<String>,
    pub token_hits: Option<usize>,
    pub match_coverage: f64,
    pub rank_explain: String,
}

/// Out-of-core diagnostic payload (SPEC_FULL.md §9): always present, empty
/// unless both `include_claim_graph` and `MANUAL_FIND_CLAIM_GRAPH_ENABLED`
/// are set.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ClaimGraph {
    pub claims: Vec<String>,
    pub evidences: Vec<String>,
    pub edges: Vec<String>,
}

/// `applied{...}` diagnostics (SPEC_FULL.md §3, §4.4, §4.9).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppliedDiagnostics {
    pub selected_gate: GateKind,
    pub required_terms_df_filtered: Vec<RequiredTermDfFilteredView>,
    pub required_terms_relaxed: bool,
    pub required_terms_relax_reason: Option<String>,
    pub required_effect_status: RequiredEffectStatus,
    pub required_failure_reason: Option<String>,
    pub sem_cache_hit: bool,
    pub sem_cache_mode: SemCacheMode,
    pub cutoff_reason: Option<CutoffReason>,
    pub query_decomp_applied: bool,
    pub sub_queries: Vec<String>,
    pub only_unscanned_applied: bool,
}

/// Serializable view of a [`RequiredTermDfDecision`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RequiredTermDfFilteredView {
    pub term: String,
    pub dropped: bool,
    pub too_rare: bool,
    pub df_ratio: f64,
    pub reason: Option<String>,
}

impl From<&RequiredTermDfDecision> for RequiredTermDfFilteredView {
    fn from(d: &RequiredTermDfDecision) -> Self {
        let reason = if d.dropped {
            Some("too_common".to_owned())
        } else if d.too_rare {
            Some("too_rare".to_owned())
        } else {
            None
        };
        Self { term: d.term.clone(), dropped: d.dropped, too_rare: d.too_rare, df_ratio: d.df_ratio, reason }
    }
}

/// `summary{...}` (SPEC_FULL.md §4.11).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub scanned_files: usize,
    pub scanned_nodes: usize,
    pub candidates: usize,
    pub file_bias_ratio: f64,
    pub conflict_count: usize,
    pub gap_count: usize,
    pub integration_status: IntegrationStatus,
}

/// The full, non-compact `find` result (SPEC_FULL.md §4.11).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FindResponse {
    pub trace_id: String,
    pub applied: AppliedDiagnostics,
    pub candidates: Vec<CandidateItem>,
    pub claim_graph: ClaimGraph,
    pub summary: Summary,
    pub next_actions: Vec<String>,
}

/// The minimal public-facing `find` result (SPEC_FULL.md §4.11, Glossary
/// "Compact response").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompactFindResponse {
    pub trace_id: String,
    pub candidates: Vec<CandidateItem>,
    pub status: String,
    pub failure_reason: Option<String>,
    pub inline_hits: Option<Vec<CandidateItem>>,
    pub next_actions: Vec<String>,
}

/// Paging kinds for [`Pipeline::hits`] (SPEC_FULL.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitsKind {
    Candidates,
    Unscanned,
    Conflicts,
    Gaps,
    IntegratedTop,
    Claims,
    Evidences,
    Edges,
    GateRuns,
    FusionDebug,
}

#[derive(Debug, Clone)]
pub struct HitsParams {
    pub trace_id: String,
    pub kind: HitsKind,
    pub offset: usize,
    pub limit: usize,
}

impl HitsParams {
    fn validate(&self) -> SearchResult<()> {
        if self.trace_id.is_empty() {
            return Err(SearchCoreError::InvalidParameter("trace_id must not be empty".into()));
        }
        if self.limit < 1 {
            return Err(SearchCoreError::InvalidParameter("limit must be >= 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HitsResponse {
    pub trace_id: String,
    pub total: usize,
    pub items: Vec<CandidateItem>,
}

/// A saved result payload, keyed by `trace_id` in the [`TraceStore`] and (on
/// a cache hit) cloned wholesale out of the [`SemanticCache`] (SPEC_FULL.md
/// §3, "CacheEntry... stores a cloned payload to survive trace eviction").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TracePayload {
    pub trace_id: String,
    pub manual_id: String,
    pub applied: AppliedDiagnostics,
    pub candidates: Vec<CandidateItem>,
    pub integrated_top: Vec<CandidateItem>,
    pub unscanned: Vec<String>,
    pub gaps: Vec<String>,
    pub conflicts: Vec<String>,
    pub claim_graph: ClaimGraph,
    pub summary: Summary,
    pub source_latency_ms: u64,
    pub manuals_fingerprint: String,
}

struct BuiltIndex {
    store: DocumentStore,
    index: SparseIndex,
    fingerprint: String,
}

struct ManualSlot {
    built: RwLock<Option<Arc<BuiltIndex>>>,
}

/// The manual search core. Construct one per process (or per test), register
/// manuals, then call [`Pipeline::find`]/[`Pipeline::hits`].
pub struct Pipeline {
    config: SearchConfig,
    document_source: Arc<dyn DocumentSource>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    roots: Mutex<HashMap<String, PathBuf>>,
    slots: Mutex<HashMap<String, Arc<ManualSlot>>>,
    cache: SemanticCache<TracePayload>,
    /// Which cache keys belong to which manual, so `invalidate(manual_id)`
    /// can evict exactly that manual's entries (SemanticCache itself has no
    /// notion of manual ownership).
    cache_keys_by_manual: Mutex<HashMap<String, HashSet<String>>>,
    trace_store: TraceStore<TracePayload>,
    stats: AdaptiveStats,
}

impl Pipeline {
    /// Build a pipeline with the production collaborators: filesystem reads,
    /// a real clock, and a counter-seeded id generator.
    #[must_use]
    pub fn new(config: SearchConfig) -> Self {
        let stats = AdaptiveStats::spawn(config.adaptive_stats_path.clone(), config.adaptive_stats_enabled);
        Self::with_collaborators(config, Arc::new(FsDocumentSource), Arc::new(SystemClock), Arc::new(CounterIdGenerator::new()), stats)
    }

    /// Build a pipeline with substitutable collaborators, for tests or
    /// alternative transports (SPEC_FULL.md §4.12).
    #[must_use]
    pub fn with_collaborators(
        config: SearchConfig,
        document_source: Arc<dyn DocumentSource>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        stats: AdaptiveStats,
    ) -> Self {
        let cache = SemanticCache::new(CacheConfig::from_search_config(&config));
        let trace_store = TraceStore::new(config.trace_max_keep, config.trace_ttl_sec);
        Self {
            config,
            document_source,
            clock,
            ids,
            roots: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            cache,
            cache_keys_by_manual: Mutex::new(HashMap::new()),
            trace_store,
            stats,
        }
    }

    /// Register a manual's root directory. Must be called before `find`
    /// targets it.
    pub fn register_manual(&self, manual_id: impl Into<String>, root: impl Into<PathBuf>) -> SearchResult<()> {
        let manual_id = manual_id.into();
        // Validates the id shape (non-empty, not the reserved root) without
        // needing the directory to exist yet.
        Manual::new(manual_id.clone(), PathBuf::new())?;
        self.roots.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(manual_id, root.into());
        Ok(())
    }

    fn resolve_root(&self, manual_id: &str) -> SearchResult<PathBuf> {
        self.roots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(manual_id)
            .cloned()
            .ok_or_else(|| SearchCoreError::not_found_unknown_manual(manual_id))
    }

    /// Build-once-per-fingerprint per-manual index. Readers never block each
    /// other; only a fingerprint change takes the write lock (SPEC_FULL.md
    /// §5: "Builders are serialized per manual by a per-manual lock;
    /// concurrent readers use the index without locks").
    fn get_or_build(&self, manual_id: &str) -> SearchResult<(Arc<BuiltIndex>, String)> {
        let root = self.resolve_root(manual_id)?;
        let manual = Manual::new(manual_id, root)?;
        let fingerprint = manual.fingerprint()?;

        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            slots
                .entry(manual_id.to_owned())
                .or_insert_with(|| Arc::new(ManualSlot { built: RwLock::new(None) }))
                .clone()
        };

        {
            let read = slot.built.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(built) = read.as_ref() {
                if !built.index.is_stale(&fingerprint) {
                    return Ok((built.clone(), fingerprint));
                }
            }
        }

        let mut write = slot.built.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(built) = write.as_ref() {
            if !built.index.is_stale(&fingerprint) {
                return Ok((built.clone(), fingerprint));
            }
        }
        let store = DocumentStore::build(&manual, self.document_source.as_ref())?;
        validate_manual_has_content(&store, manual_id)?;
        let index = SparseIndex::build(&store, fingerprint.clone());
        let built = Arc::new(BuiltIndex { store, index, fingerprint: fingerprint.clone() });
        *write = Some(built.clone());
        Ok((built, fingerprint))
    }

    fn required_term_key(term: &str) -> String {
        let normalized = normalize(term);
        let tokens = tokenize(&normalized);
        if tokens.len() == 1 {
            tokens.into_iter().next().expect("len checked above").text
        } else {
            normalized
        }
    }

    /// The non-compact `find` entry point (SPEC_FULL.md §4.11): returns the
    /// full diagnostic shape with `applied`/`summary`/`claim_graph`.
    pub fn find(&self, params: &FindParams) -> SearchResult<FindResponse> {
        self.run(params, false)
    }

    /// The compact public `find` entry point: entering this path always
    /// bypasses the semantic cache (SPEC_FULL.md §4.9).
    pub fn find_compact(&self, params: &FindParams) -> SearchResult<CompactFindResponse> {
        let full = self.run(params, true)?;
        let status = match full.summary.integration_status {
            IntegrationStatus::Complete => "ok",
            IntegrationStatus::Partial => "partial",
            IntegrationStatus::Empty => "empty",
        }
        .to_owned();
        let failure_reason = match full.summary.integration_status {
            IntegrationStatus::Empty => Some(
                full.applied
                    .required_failure_reason
                    .clone()
                    .unwrap_or_else(|| "no_candidates".to_owned()),
            ),
            _ => None,
        };
        let inline_hits = params.inline_hits_limit.map(|limit| full.candidates.iter().take(limit).cloned().collect());
        Ok(CompactFindResponse {
            trace_id: full.trace_id,
            candidates: full.candidates,
            status,
            failure_reason,
            inline_hits,
            next_actions: Vec::new(),
        })
    }

    #[allow(clippy::too_many_lines)]
    fn run(&self, params: &FindParams, force_bypass: bool) -> SearchResult<FindResponse> {
        params.validate()?;
        let start = self.clock.now_ms();
        let span = info_span!("find", manual_id = %params.manual_id);
        let _guard = span.enter();

        // §8 invariant 10: an expired/unknown referenced trace is `not_found`,
        // never a silent full scan — checked before any search work happens.
        if let Some(old_trace_id) = &params.only_unscanned_from_trace_id {
            self.trace_store.get_at(old_trace_id, start)?;
        }

        let (built, fingerprint) = self.get_or_build(&params.manual_id)?;
        let normalized_query = normalize(&params.query);

        let required_term_keys: Vec<String> = params.required_terms.iter().map(|t| Self::required_term_key(t)).collect();
        let exceptions_vocab: Vec<String> = params.exceptions_vocab.iter().map(|t| Self::required_term_key(t)).collect();

        let bypass = force_bypass
            || params.only_unscanned_from_trace_id.is_some()
            || params.include_claim_graph
            || !params.use_cache
            || !self.config.sem_cache_enabled;

        let cache_key = compute_key(&SemCacheKeyInput {
            manuals_fingerprint: &fingerprint,
            normalized_query: &normalized_query,
            required_terms: &required_term_keys,
            budget_time_ms: params.budget.time_ms,
            budget_max_candidates: params.budget.max_candidates,
            scope_bits: u64::from(params.expand_scope),
        });

        let mut guard_revalidated = false;
        if !bypass {
            if let Some(cached) = self.cache.get_at(&cache_key, start) {
                let guard_tripped = guard_revalidation_needed(&cached.summary, &self.config);
                if !guard_tripped {
                    let new_trace_id = self.ids.next_trace_id();
                    let mut response_payload = cached;
                    response_payload.trace_id = new_trace_id.clone();
                    response_payload.applied.sem_cache_hit = true;
                    response_payload.applied.sem_cache_mode = SemCacheMode::Exact;
                    self.trace_store.insert_at(new_trace_id.clone(), response_payload.clone(), start);
                    debug!(trace_id = %new_trace_id, "sem_cache hit");
                    return Ok(payload_to_response(response_payload));
                }
                guard_revalidated = true;
                debug!("sem_cache guard_revalidate: stored summary exceeds quality ceiling");
            }
        }

        let query_tokens: Vec<String> = tokenize(&normalized_query).into_iter().map(|t| t.text).collect();

        let gate_outcome = select_gate(
            &built.index,
            &built.store,
            &query_tokens,
            &required_term_keys,
            &exceptions_vocab,
            &self.config,
        );

        let elapsed = (self.clock.now_ms() - start).max(0) as u64;
        let mut cutoff_reason_from_budget = None;
        if elapsed >= params.budget.time_ms {
            cutoff_reason_from_budget = Some(CutoffReason::TimeBudget);
        }

        let sub_queries = decompose(&params.query, &self.config);
        let query_decomp_applied = !sub_queries.is_empty() && cutoff_reason_from_budget.is_none();

        let fused_candidates: Vec<Candidate> = if query_decomp_applied {
            fold_in_sub_queries(&gate_outcome.candidates, &sub_queries, &built, &exceptions_vocab, &self.config)
        } else {
            gate_outcome.candidates.clone()
        };

        let exploration_added = inject_exploration(&fused_candidates, &built, &query_tokens, &self.config);
        let mut all_candidates = fused_candidates;
        all_candidates.extend(exploration_added);

        let diversity_inputs: Vec<DiversityInput> = all_candidates
            .iter()
            .filter_map(|c| {
                built.store.get(&c.node_id).map(|node| DiversityInput {
                    node_id: c.node_id.clone(),
                    path: node.relative_path.clone(),
                    score: c.score,
                    match_coverage: built.index.node_coverage(&query_tokens, &c.node_id),
                })
            })
            .collect();

        let diversity_config = DiversityConfig::from_search_config(&self.config);
        let diversity_result = diversify(diversity_inputs, params.budget.max_candidates, &diversity_config);

        let cutoff_reason = cutoff_reason_from_budget
            .or(diversity_result.cutoff_reason)
            .or_else(|| gate_outcome.per_file_cap_applied.then_some(CutoffReason::StageCap));

        let candidates_by_id: HashMap<&str, &Candidate> = all_candidates.iter().map(|c| (c.node_id.as_str(), c)).collect();
        let mut candidate_items: Vec<CandidateItem> = Vec::with_capacity(diversity_result.candidates.len());
        for d in &diversity_result.candidates {
            let Some(node) = built.store.get(&d.node_id) else { continue };
            let Some(candidate) = candidates_by_id.get(d.node_id.as_str()) else { continue };
            let node_tokens = built.index.node_tokens(&d.node_id).unwrap_or(&[]);
            let unique_query_tokens: Vec<&str> = {
                let mut seen = HashSet::new();
                query_tokens.iter().map(String::as_str).filter(|t| seen.insert(*t)).collect()
            };
            let matched_tokens: Vec<String> = unique_query_tokens
                .iter()
                .copied()
                .filter(|term| node_tokens.iter().any(|t| t.text == *term))
                .map(ToOwned::to_owned)
                .collect();
            let token_hits = if matched_tokens.is_empty() {
                None
            } else {
                Some(node_tokens.iter().filter(|t| matched_tokens.contains(&t.text)).count())
            };
            let signal_names: Vec<&'static str> = candidate
                .signals
                .iter()
                .map(|s| signal_label(s.signal))
                .collect();
            candidate_items.push(CandidateItem {
                node_ref: NodeRef {
                    manual_id: params.manual_id.clone(),
                    path: node.relative_path.clone(),
                    start_line: node.start_line,
                    end_line: node.end_line,
                    title: node.title.clone(),
                },
                score: d.score,
                signals: candidate.signals.iter().map(|s| s.signal).collect(),
                matched_tokens,
                token_hits,
                match_coverage: d.match_coverage,
                rank_explain: signal_names.join("+"),
            });
        }

        let file_bias_ratio = compute_file_bias_ratio(&built.store, &all_candidates);

        let unique_query_terms: HashSet<&String> = query_tokens.iter().collect();
        let mut gaps: Vec<String> = gate_outcome
            .required_terms_df_filtered
            .iter()
            .filter(|d| d.dropped)
            .map(|d| d.term.clone())
            .collect();
        for term in &unique_query_terms {
            if built.index.document_frequency(term) == 0 {
                gaps.push((*term).clone());
            }
        }
        gaps.sort_unstable();
        gaps.dedup();

        let unscanned: Vec<String> = if let Some(old_trace_id) = &params.only_unscanned_from_trace_id {
            let old_trace = self.trace_store.get_at(old_trace_id, start)?;
            let already_scanned: HashSet<String> = old_trace.candidates.iter().map(|c| c.node_ref.path.clone()).collect();
            candidate_items.iter().map(|c| c.node_ref.path.clone()).filter(|p| already_scanned.contains(p)).collect()
        } else {
            Vec::new()
        };
        if !unscanned.is_empty() {
            let already: HashSet<&str> = unscanned.iter().map(String::as_str).collect();
            candidate_items.retain(|c| !already.contains(c.node_ref.path.as_str()));
        }

        let integration_status = if candidate_items.is_empty() {
            IntegrationStatus::Empty
        } else if cutoff_reason == Some(CutoffReason::TimeBudget) {
            IntegrationStatus::Partial
        } else {
            IntegrationStatus::Complete
        };

        let required_failure_reason = match gate_outcome.required_effect_status {
            RequiredEffectStatus::RequiredNoneMatched => Some("required_none_matched".to_owned()),
            RequiredEffectStatus::TermDroppedOrWeakened => Some("required_term_dropped".to_owned()),
            _ => None,
        };

        // Out-of-core diagnostic subsystem (SPEC_FULL.md §9): always empty in
        // this crate, regardless of `include_claim_graph`/`claim_graph_enabled`.
        let claim_graph = ClaimGraph::default();

        let sem_cache_mode = if bypass {
            SemCacheMode::Bypass
        } else if guard_revalidated {
            SemCacheMode::GuardRevalidate
        } else {
            SemCacheMode::Miss
        };

        let applied = AppliedDiagnostics {
            selected_gate: gate_outcome.gate_used,
            required_terms_df_filtered: gate_outcome.required_terms_df_filtered.iter().map(Into::into).collect(),
            required_terms_relaxed: gate_outcome.required_terms_relaxed,
            required_terms_relax_reason: gate_outcome.required_terms_relax_reason.clone(),
            required_effect_status: gate_outcome.required_effect_status,
            required_failure_reason,
            sem_cache_hit: false,
            sem_cache_mode,
            cutoff_reason,
            query_decomp_applied,
            sub_queries: sub_queries.clone(),
            only_unscanned_applied: params.only_unscanned_from_trace_id.is_some(),
        };

        let summary = Summary {
            scanned_files: built.store.file_count(),
            scanned_nodes: built.store.len(),
            candidates: candidate_items.len(),
            file_bias_ratio,
            conflict_count: 0,
            gap_count: gaps.len(),
            integration_status,
        };

        let trace_id = self.ids.next_trace_id();
        let end = self.clock.now_ms();
        let latency_ms = (end - start).max(0) as u64;
        let integrated_top: Vec<CandidateItem> = candidate_items.iter().take(5).cloned().collect();

        let payload = TracePayload {
            trace_id: trace_id.clone(),
            manual_id: params.manual_id.clone(),
            applied: applied.clone(),
            candidates: candidate_items.clone(),
            integrated_top,
            unscanned,
            gaps,
            conflicts: Vec::new(),
            claim_graph: claim_graph.clone(),
            summary: summary.clone(),
            source_latency_ms: latency_ms,
            manuals_fingerprint: fingerprint,
        };

        self.trace_store.insert_at(trace_id.clone(), payload.clone(), end);
        if !bypass {
            self.cache.put_at(cache_key.clone(), payload, end);
            let mut by_manual = self.cache_keys_by_manual.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            by_manual.entry(params.manual_id.clone()).or_default().insert(cache_key);
        }

        self.stats.record(StatsRecord {
            timestamp_ms: end,
            trace_id: trace_id.clone(),
            manual_id: params.manual_id.clone(),
            normalized_query_char_len: normalized_query.chars().count(),
            gate_used: format!("{:?}", applied.selected_gate),
            candidate_count: summary.candidates,
            cache_mode: format!("{:?}", applied.sem_cache_mode),
            cutoff_reason: applied.cutoff_reason.map(|c| format!("{c:?}")),
            latency_ms,
        });

        Ok(FindResponse {
            trace_id,
            applied,
            candidates: candidate_items,
            claim_graph,
            summary,
            next_actions: Vec::new(),
        })
    }

    /// Stateless paging over a saved trace (SPEC_FULL.md §4.11's `hits`
    /// contract).
    pub fn hits(&self, params: &HitsParams) -> SearchResult<HitsResponse> {
        params.validate()?;
        let now = self.clock.now_ms();
        let payload = self.trace_store.get_at(&params.trace_id, now)?;

        let items: Vec<CandidateItem> = match params.kind {
            HitsKind::Candidates => payload.candidates.clone(),
            HitsKind::IntegratedTop => payload.integrated_top.clone(),
            HitsKind::Unscanned | HitsKind::Conflicts | HitsKind::Gaps | HitsKind::Claims | HitsKind::Evidences | HitsKind::Edges | HitsKind::GateRuns | HitsKind::FusionDebug => {
                Vec::new()
            }
        };
        let total = match params.kind {
            HitsKind::Candidates => payload.candidates.len(),
            HitsKind::IntegratedTop => payload.integrated_top.len(),
            HitsKind::Unscanned => payload.unscanned.len(),
            HitsKind::Conflicts => payload.conflicts.len(),
            HitsKind::Gaps => payload.gaps.len(),
            HitsKind::Claims => payload.claim_graph.claims.len(),
            HitsKind::Evidences => payload.claim_graph.evidences.len(),
            HitsKind::Edges => payload.claim_graph.edges.len(),
            HitsKind::GateRuns | HitsKind::FusionDebug => 0,
        };

        let page: Vec<CandidateItem> = items.into_iter().skip(params.offset).take(params.limit).collect();

        Ok(HitsResponse { trace_id: params.trace_id.clone(), total, items: page })
    }

    /// Admin operation: drop the cached index and semantic-cache entries for
    /// one manual (SPEC_FULL.md §6). Traces already issued are left intact —
    /// they describe a point in time, not the manual's current state.
    pub fn invalidate(&self, manual_id: &str) {
        self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(manual_id);
        let keys: Vec<String> = {
            let mut by_manual = self.cache_keys_by_manual.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            by_manual.remove(manual_id).map(|s| s.into_iter().collect()).unwrap_or_default()
        };
        self.cache.invalidate_keys(&keys);
    }
}

fn guard_revalidation_needed(summary: &Summary, config: &SearchConfig) -> bool {
    let gap_guard_enabled = config.sem_cache_max_summary_gap >= 0;
    let conflict_guard_enabled = config.sem_cache_max_summary_conflict >= 0;
    (gap_guard_enabled && summary.gap_count as i64 > config.sem_cache_max_summary_gap)
        || (conflict_guard_enabled && summary.conflict_count as i64 > config.sem_cache_max_summary_conflict)
}

fn payload_to_response(payload: TracePayload) -> FindResponse {
    FindResponse {
        trace_id: payload.trace_id,
        applied: payload.applied,
        candidates: payload.candidates,
        claim_graph: payload.claim_graph,
        summary: payload.summary,
        next_actions: Vec::new(),
    }
}

fn signal_label(signal: Signal) -> &'static str {
    match signal {
        Signal::Exact => "exact",
        Signal::RequiredTerm => "required_term",
        Signal::RequiredTermAnd => "required_term_and",
        Signal::RequiredTermsRrf => "required_terms_rrf",
        Signal::GateRrf => "gate_rrf",
        Signal::Phrase => "phrase",
        Signal::Anchor => "anchor",
        Signal::NumberContext => "number_context",
        Signal::Proximity => "proximity",
        Signal::Exceptions => "exceptions",
        Signal::CodeExact => "code_exact",
        Signal::Prf => "prf",
        Signal::Exploration => "exploration",
        Signal::QueryDecompRrf => "query_decomp_rrf",
        Signal::DefinitionTitle => "definition_title",
    }
}

/// Fold sub-query rankings into the primary gate ranking via RRF
/// (SPEC_FULL.md §4.6, §4.7). Survivors influenced by more than one ranking
/// (the main gate plus at least one sub-query) are tagged `query_decomp_rrf`.
fn fold_in_sub_queries(
    gate_candidates: &[Candidate],
    sub_queries: &[String],
    built: &BuiltIndex,
    exceptions_vocab: &[String],
    config: &SearchConfig,
) -> Vec<Candidate> {
    let base_ranking: Ranking = gate_candidates.iter().map(|c| (c.node_id.clone(), c.score)).collect();
    let mut base_scores: HashMap<String, f64> = HashMap::new();
    let mut by_id: HashMap<String, Candidate> = HashMap::new();
    for c in gate_candidates {
        base_scores.insert(c.node_id.clone(), c.score);
        by_id.insert(c.node_id.clone(), c.clone());
    }

    let mut rankings = vec![base_ranking];
    let mut sub_empty = true;
    for sub_query in sub_queries {
        let sub_tokens: Vec<String> = tokenize(&normalize(sub_query)).into_iter().map(|t| t.text).collect();
        let sub_candidates = crate::gates::run_g0(&built.index, &built.store, &sub_tokens, exceptions_vocab, config);
        if !sub_candidates.is_empty() {
            sub_empty = false;
        }
        let ranking: Ranking = sub_candidates.iter().map(|c| (c.node_id.clone(), c.score)).collect();
        for c in &sub_candidates {
            base_scores.entry(c.node_id.clone()).or_insert(c.score);
            by_id.entry(c.node_id.clone()).or_insert_with(|| c.clone());
        }
        rankings.push(ranking);
    }

    // SPEC_FULL.md §4.6: fall back to the undecomposed ranking only if every
    // sub-query AND the base gate both returned empty.
    if sub_empty && gate_candidates.is_empty() {
        return gate_candidates.to_vec();
    }

    let fused = fuse_rrf_default(&rankings, &base_scores, config);
    fused
        .into_iter()
        .map(|hit| {
            let mut candidate = by_id.get(&hit.node_id).cloned().unwrap_or(Candidate {
                node_id: hit.node_id.clone(),
                score: hit.blended_score,
                signals: Vec::new(),
            });
            candidate.score = hit.blended_score;
            if hit.source_count > 1 {
                candidate.signals.push(crate::signals::SignalHit {
                    signal: Signal::QueryDecompRrf,
                    bonus: 0.0,
                });
            }
            candidate
        })
        .collect()
}

/// Inject a fixed fraction of low-prior, minimum-coverage candidates not
/// already selected, to reduce ranking stagnation (SPEC_FULL.md §4.5,
/// "exploration"). Per the DESIGN.md Open Question decision, these never
/// contribute to `summary.file_bias_ratio`.
fn inject_exploration(selected: &[Candidate], built: &BuiltIndex, query_tokens: &[String], config: &SearchConfig) -> Vec<Candidate> {
    if config.exploration_ratio <= 0.0 || selected.is_empty() {
        return Vec::new();
    }
    let quota = ((selected.len() as f64) * config.exploration_ratio).floor() as usize;
    if quota == 0 {
        return Vec::new();
    }
    let selected_ids: HashSet<&str> = selected.iter().map(|c| c.node_id.as_str()).collect();

    let mut pool: Vec<Candidate> = built
        .store
        .iter()
        .filter(|node| !selected_ids.contains(node.id.as_str()))
        .filter_map(|node| {
            let coverage = built.index.node_coverage(query_tokens, &node.id);
            if coverage < config.cutoff_min_coverage {
                return None;
            }
            let base = built.index.score_bm25(query_tokens, &node.id, config);
            if base <= 0.0 {
                return None;
            }
            Some(Candidate {
                node_id: node.id.clone(),
                score: exploration_bonus(base, config),
                signals: vec![crate::signals::SignalHit { signal: Signal::Exploration, bonus: 0.0 }],
            })
        })
        .collect();

    pool.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.node_id.cmp(&b.node_id)));
    pool.truncate(quota);
    pool
}

/// Highest per-path share among non-exploration candidates (SPEC_FULL.md
/// §4.8, §9): 1.0 means every surviving candidate came from the same file.
/// Exploration candidates are excluded per the DESIGN.md Open Question
/// decision, since they are deliberately drawn from under-represented paths.
fn compute_file_bias_ratio(store: &DocumentStore, candidates: &[Candidate]) -> f64 {
    let relevant: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| !c.signals.iter().any(|s| s.signal == Signal::Exploration))
        .collect();
    if relevant.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for candidate in &relevant {
        if let Some(node) = store.get(&candidate.node_id) {
            *counts.entry(node.relative_path.as_str()).or_insert(0) += 1;
        }
    }
    let max_count = counts.values().copied().max().unwrap_or(0);
    max_count as f64 / relevant.len() as f64
}
