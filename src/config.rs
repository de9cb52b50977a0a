//! Process-wide configuration for the manual search core.
//!
//! Every key is read through the same precedence chain: process environment →
//! project-local `.env` → user-global env file → the documented default. A
//! malformed value degrades to the default rather than panicking; startup never
//! fails because of a bad environment variable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Fully resolved, immutable configuration. Built once via [`SearchConfig::from_env`]
/// and handed to the pipeline by value — there is no global mutable singleton on
/// the hot path.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub trace_max_keep: usize,
    pub trace_ttl_sec: u64,

    pub sem_cache_enabled: bool,
    pub sem_cache_ttl_sec: u64,
    pub sem_cache_max_keep: usize,
    pub sem_cache_embedding_provider: String,
    pub sem_cache_max_summary_gap: i64,
    pub sem_cache_max_summary_conflict: i64,

    pub sparse_query_coverage_weight: f64,
    pub lexical_coverage_weight: f64,
    pub lexical_phrase_weight: f64,
    pub lexical_number_context_bonus: f64,
    pub lexical_proximity_bonus_near: f64,
    pub lexical_proximity_bonus_far: f64,
    pub lexical_length_penalty_weight: f64,

    pub query_decomp_enabled: bool,
    pub query_decomp_max_sub_queries: usize,
    pub query_decomp_rrf_k: f64,
    pub query_decomp_base_weight: f64,

    pub scan_hard_cap: usize,
    pub per_file_candidate_cap: usize,
    pub exploration_ratio: f64,
    pub exploration_score_scale: f64,

    pub diversity_alpha: f64,
    pub required_too_common_ratio: f64,
    pub required_too_rare_ratio: f64,
    pub required_lambda: f64,
    pub cutoff_score_ratio: f64,
    pub cutoff_min_coverage: f64,

    pub adaptive_stats_path: PathBuf,
    pub adaptive_stats_enabled: bool,

    pub claim_graph_enabled: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            trace_max_keep: 100,
            trace_ttl_sec: 1800,

            sem_cache_enabled: true,
            sem_cache_ttl_sec: 1800,
            sem_cache_max_keep: 500,
            sem_cache_embedding_provider: "none".to_owned(),
            sem_cache_max_summary_gap: -1,
            sem_cache_max_summary_conflict: -1,

            sparse_query_coverage_weight: 0.35,
            lexical_coverage_weight: 0.50,
            lexical_phrase_weight: 0.50,
            lexical_number_context_bonus: 0.80,
            lexical_proximity_bonus_near: 1.00,
            lexical_proximity_bonus_far: 0.50,
            lexical_length_penalty_weight: 0.20,

            query_decomp_enabled: true,
            query_decomp_max_sub_queries: 3,
            query_decomp_rrf_k: 60.0,
            query_decomp_base_weight: 0.30,

            scan_hard_cap: 5000,
            per_file_candidate_cap: 8,
            exploration_ratio: 0.20,
            exploration_score_scale: 0.10,

            diversity_alpha: 0.50,
            required_too_common_ratio: 0.80,
            required_too_rare_ratio: 0.01,
            required_lambda: 1.00,
            cutoff_score_ratio: 0.15,
            cutoff_min_coverage: 0.20,

            adaptive_stats_path: PathBuf::from("./manual_search_stats.jsonl"),
            adaptive_stats_enabled: true,

            claim_graph_enabled: false,
        }
    }
}

impl SearchConfig {
    /// Load configuration from the environment, falling back to documented
    /// defaults for any key that is absent or fails to parse.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            trace_max_keep: env_usize("TRACE_MAX_KEEP", d.trace_max_keep),
            trace_ttl_sec: env_u64("TRACE_TTL_SEC", d.trace_ttl_sec),

            sem_cache_enabled: env_bool("SEM_CACHE_ENABLED", d.sem_cache_enabled),
            sem_cache_ttl_sec: env_u64("SEM_CACHE_TTL_SEC", d.sem_cache_ttl_sec),
            sem_cache_max_keep: env_usize("SEM_CACHE_MAX_KEEP", d.sem_cache_max_keep),
            sem_cache_embedding_provider: env_string(
                "SEM_CACHE_EMBEDDING_PROVIDER",
                &d.sem_cache_embedding_provider,
            ),
            sem_cache_max_summary_gap: env_i64(
                "SEM_CACHE_MAX_SUMMARY_GAP",
                d.sem_cache_max_summary_gap,
            ),
            sem_cache_max_summary_conflict: env_i64(
                "SEM_CACHE_MAX_SUMMARY_CONFLICT",
                d.sem_cache_max_summary_conflict,
            ),

            sparse_query_coverage_weight: env_f64(
                "SPARSE_QUERY_COVERAGE_WEIGHT",
                d.sparse_query_coverage_weight,
            ),
            lexical_coverage_weight: env_f64("LEXICAL_COVERAGE_WEIGHT", d.lexical_coverage_weight),
            lexical_phrase_weight: env_f64("LEXICAL_PHRASE_WEIGHT", d.lexical_phrase_weight),
            lexical_number_context_bonus: env_f64(
                "LEXICAL_NUMBER_CONTEXT_BONUS",
                d.lexical_number_context_bonus,
            ),
            lexical_proximity_bonus_near: env_f64(
                "LEXICAL_PROXIMITY_BONUS_NEAR",
                d.lexical_proximity_bonus_near,
            ),
            lexical_proximity_bonus_far: env_f64(
                "LEXICAL_PROXIMITY_BONUS_FAR",
                d.lexical_proximity_bonus_far,
            ),
            lexical_length_penalty_weight: env_f64(
                "LEXICAL_LENGTH_PENALTY_WEIGHT",
                d.lexical_length_penalty_weight,
            ),

            query_decomp_enabled: env_bool(
                "MANUAL_FIND_QUERY_DECOMP_ENABLED",
                d.query_decomp_enabled,
            ),
            query_decomp_max_sub_queries: env_usize(
                "MANUAL_FIND_QUERY_DECOMP_MAX_SUB_QUERIES",
                d.query_decomp_max_sub_queries,
            ),
            query_decomp_rrf_k: env_f64("MANUAL_FIND_QUERY_DECOMP_RRF_K", d.query_decomp_rrf_k),
            query_decomp_base_weight: env_f64(
                "MANUAL_FIND_QUERY_DECOMP_BASE_WEIGHT",
                d.query_decomp_base_weight,
            ),

            scan_hard_cap: env_usize("MANUAL_FIND_SCAN_HARD_CAP", d.scan_hard_cap),
            per_file_candidate_cap: env_usize(
                "MANUAL_FIND_PER_FILE_CANDIDATE_CAP",
                d.per_file_candidate_cap,
            ),
            exploration_ratio: env_f64("MANUAL_FIND_EXPLORATION_RATIO", d.exploration_ratio),
            exploration_score_scale: env_f64(
                "MANUAL_FIND_EXPLORATION_SCORE_SCALE",
                d.exploration_score_scale,
            ),

            diversity_alpha: env_f64("MANUAL_FIND_DIVERSITY_ALPHA", d.diversity_alpha),
            required_too_common_ratio: env_f64(
                "MANUAL_FIND_REQUIRED_TOO_COMMON_RATIO",
                d.required_too_common_ratio,
            ),
            required_too_rare_ratio: env_f64(
                "MANUAL_FIND_REQUIRED_TOO_RARE_RATIO",
                d.required_too_rare_ratio,
            ),
            required_lambda: env_f64("MANUAL_FIND_REQUIRED_LAMBDA", d.required_lambda),
            cutoff_score_ratio: env_f64("MANUAL_FIND_CUTOFF_SCORE_RATIO", d.cutoff_score_ratio),
            cutoff_min_coverage: env_f64(
                "MANUAL_FIND_CUTOFF_MIN_COVERAGE",
                d.cutoff_min_coverage,
            ),

            adaptive_stats_path: PathBuf::from(env_string(
                "ADAPTIVE_STATS_PATH",
                &d.adaptive_stats_path.to_string_lossy(),
            )),
            adaptive_stats_enabled: env_bool("ADAPTIVE_STATS_ENABLED", d.adaptive_stats_enabled),

            claim_graph_enabled: env_bool("MANUAL_FIND_CLAIM_GRAPH_ENABLED", d.claim_graph_enabled),
        }
    }
}

// ────────────────────────────────────────────────────────────────────
// Env-value resolution: process env → project .env → user env file
// ────────────────────────────────────────────────────────────────────

static DOTENV_VALUES: OnceLock<HashMap<String, String>> = OnceLock::new();
static USER_ENV_VALUES: OnceLock<HashMap<String, String>> = OnceLock::new();

#[cfg(test)]
thread_local! {
    static TEST_ENV_OVERRIDES: std::cell::RefCell<HashMap<String, String>> =
        std::cell::RefCell::new(HashMap::new());
}

#[cfg(test)]
fn test_env_override_value(key: &str) -> Option<String> {
    TEST_ENV_OVERRIDES.with(|overrides| overrides.borrow().get(key).cloned())
}

#[cfg(not(test))]
fn test_env_override_value(_key: &str) -> Option<String> {
    None
}

/// Test-only escape hatch: set (or clear, with `None`) a fake environment value
/// for the current thread so config-loading tests never depend on real process
/// environment state.
#[cfg(test)]
pub(crate) fn set_test_env_override(key: &str, value: Option<&str>) {
    TEST_ENV_OVERRIDES.with(|overrides| {
        let mut overrides = overrides.borrow_mut();
        match value {
            Some(v) => {
                overrides.insert(key.to_owned(), v.to_owned());
            }
            None => {
                overrides.remove(key);
            }
        }
    });
}

fn dotenv_values() -> &'static HashMap<String, String> {
    DOTENV_VALUES.get_or_init(|| load_dotenv_file(&PathBuf::from(".env")))
}

fn user_env_file_path() -> Option<PathBuf> {
    let home = dirs_home()?;
    let candidates = [
        home.join(".config/manual-search/env"),
        home.join(".manual_search/.env"),
    ];
    candidates.into_iter().find(|p| p.is_file())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn user_env_values() -> &'static HashMap<String, String> {
    USER_ENV_VALUES.get_or_init(|| match user_env_file_path() {
        Some(path) => load_dotenv_file(&path),
        None => HashMap::new(),
    })
}

fn load_dotenv_file(path: &PathBuf) -> HashMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    parse_dotenv_contents(&contents)
}

fn parse_dotenv_contents(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        map.insert(key.to_owned(), parse_dotenv_value(raw_value.trim()));
    }
    map
}

fn parse_dotenv_value(raw: &str) -> String {
    if let Some(inner) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return inner.replace("\\\"", "\"").replace("\\\\", "\\");
    }
    if let Some(inner) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return inner.to_owned();
    }
    // Unquoted: strip a trailing ` # comment` if present.
    match raw.find(" #") {
        Some(idx) => raw[..idx].trim_end().to_owned(),
        None => raw.to_owned(),
    }
}

/// Resolve a single key through the full precedence chain, honoring the
/// test-only override first so tests never race real process environment state.
fn env_value(key: &str) -> Option<String> {
    if let Some(v) = test_env_override_value(key) {
        return Some(v);
    }
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            return Some(v);
        }
    }
    if let Some(v) = dotenv_values().get(key) {
        return Some(v.clone());
    }
    if let Some(v) = user_env_values().get(key) {
        return Some(v.clone());
    }
    None
}

fn env_string(key: &str, default: &str) -> String {
    env_value(key).unwrap_or_else(|| default.to_owned())
}

fn env_bool(key: &str, default: bool) -> bool {
    env_value(key)
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_value(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_value(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env_value(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_value(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_defaults() {
        let cfg = SearchConfig::default();
        assert_eq!(cfg.trace_max_keep, 100);
        assert_eq!(cfg.trace_ttl_sec, 1800);
        assert!(cfg.sem_cache_enabled);
        assert_eq!(cfg.sem_cache_ttl_sec, 1800);
        assert_eq!(cfg.sem_cache_max_keep, 500);
        assert_eq!(cfg.sem_cache_embedding_provider, "none");
        assert_eq!(cfg.sem_cache_max_summary_gap, -1);
        assert!((cfg.sparse_query_coverage_weight - 0.35).abs() < 1e-9);
        assert!((cfg.lexical_proximity_bonus_near - 1.00).abs() < 1e-9);
        assert_eq!(cfg.query_decomp_max_sub_queries, 3);
        assert_eq!(cfg.scan_hard_cap, 5000);
        assert!(!cfg.claim_graph_enabled);
    }

    #[test]
    fn from_env_honors_override_and_falls_back_on_garbage() {
        set_test_env_override("TRACE_MAX_KEEP", Some("250"));
        set_test_env_override("SEM_CACHE_TTL_SEC", Some("not-a-number"));
        let cfg = SearchConfig::from_env();
        assert_eq!(cfg.trace_max_keep, 250);
        assert_eq!(cfg.sem_cache_ttl_sec, SearchConfig::default().sem_cache_ttl_sec);
        set_test_env_override("TRACE_MAX_KEEP", None);
        set_test_env_override("SEM_CACHE_TTL_SEC", None);
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        set_test_env_override("SEM_CACHE_ENABLED", Some("0"));
        assert!(!env_bool("SEM_CACHE_ENABLED", true));
        set_test_env_override("SEM_CACHE_ENABLED", Some("yes"));
        assert!(env_bool("SEM_CACHE_ENABLED", false));
        set_test_env_override("SEM_CACHE_ENABLED", None);
    }

    #[test]
    fn parse_dotenv_contents_handles_quotes_and_export_and_comments() {
        let contents = "export FOO=\"bar baz\"\nBAZ='qux'\n# comment line\nQUX=plain # trailing\n";
        let parsed = parse_dotenv_contents(contents);
        assert_eq!(parsed.get("FOO").map(String::as_str), Some("bar baz"));
        assert_eq!(parsed.get("BAZ").map(String::as_str), Some("qux"));
        assert_eq!(parsed.get("QUX").map(String::as_str), Some("plain"));
        assert_eq!(parsed.len(), 3);
    }
}
