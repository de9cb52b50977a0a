//! Lexical signal detection: the closed set of bonuses gates apply on top of
//! raw BM25 (SPEC_FULL.md §4.5).
//!
//! Every signal is represented as a tagged variant rather than an open string
//! or trait object — the set is closed by the spec, so exhaustive `match`es
//! elsewhere (rank-explain rendering, `required_effect_status` bookkeeping)
//! are a compile error away from staying in sync.

use std::collections::HashSet;

use crate::config::SearchConfig;
use crate::index::SparseIndex;
use crate::tokenizer::{Token, TokenKind};

/// The closed set of lexical signals a candidate can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Exact,
    RequiredTerm,
    RequiredTermAnd,
    RequiredTermsRrf,
    GateRrf,
    Phrase,
    Anchor,
    NumberContext,
    Proximity,
    Exceptions,
    CodeExact,
    Prf,
    Exploration,
    QueryDecompRrf,
    DefinitionTitle,
}

/// One signal firing on one candidate, with the score bonus it contributed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalHit {
    pub signal: Signal,
    pub bonus: f64,
}

/// Tokens within this many positions of each other count as "near" for the
/// proximity signal; within this many (but not nearer) count as "far". Not
/// configuration because SPEC_FULL.md §6 only exposes the bonus magnitudes,
/// not the window sizes, as tunable keys.
const PROXIMITY_NEAR_WINDOW: usize = 5;
const PROXIMITY_FAR_WINDOW: usize = 20;

/// Words that, adjacent to a digit token, mark a "number in context" match
/// (units and preposition-like connectives) rather than a bare digit.
const NUMBER_CONTEXT_NEIGHBORS: &[&str] = &[
    "of", "per", "in", "to", "from", "within", "after", "before", "over", "years", "year", "days",
    "day", "hours", "hour", "minutes", "minute", "percent", "times", "version", "v",
];

fn token_positions<'a>(tokens: &'a [Token], text: &str) -> Vec<&'a Token> {
    tokens.iter().filter(|t| t.text == text).collect()
}

/// Whether every token in `query_tokens` appears in `node_tokens`, in the same
/// order, with consecutive matches within [`PROXIMITY_NEAR_WINDOW`]/phrase
/// adjacency (distance ≤ 1 per SPEC_FULL.md §4.2's phrase definition, widened
/// here to a small window to tolerate normalization artifacts).
fn detect_phrase(query_tokens: &[String], node_tokens: &[Token]) -> bool {
    if query_tokens.is_empty() {
        return false;
    }
    let mut cursor = 0usize;
    let mut last_seq: Option<usize> = None;
    for term in query_tokens {
        let Some(next) = node_tokens[cursor..]
            .iter()
            .position(|t| &t.text == term)
            .map(|idx| cursor + idx)
        else {
            return false;
        };
        let seq = node_tokens[next].seq;
        if let Some(prev_seq) = last_seq {
            if seq < prev_seq || seq - prev_seq > 2 {
                return false;
            }
        }
        last_seq = Some(seq);
        cursor = next + 1;
    }
    true
}

/// Near/far proximity classification between any two distinct query tokens
/// that both occur in the node.
fn detect_proximity(query_tokens: &[String], node_tokens: &[Token]) -> Option<bool> {
    let unique: Vec<&String> = {
        let mut seen = HashSet::new();
        query_tokens.iter().filter(|t| seen.insert(t.as_str())).collect()
    };
    if unique.len() < 2 {
        return None;
    }
    let mut best_distance = usize::MAX;
    for i in 0..unique.len() {
        for j in (i + 1)..unique.len() {
            let positions_a = token_positions(node_tokens, unique[i]);
            let positions_b = token_positions(node_tokens, unique[j]);
            for a in &positions_a {
                for b in &positions_b {
                    best_distance = best_distance.min(a.seq.abs_diff(b.seq));
                }
            }
        }
    }
    if best_distance == usize::MAX {
        None
    } else if best_distance <= PROXIMITY_NEAR_WINDOW {
        Some(true)
    } else if best_distance <= PROXIMITY_FAR_WINDOW {
        Some(false)
    } else {
        None
    }
}

fn detect_number_context(node_tokens: &[Token]) -> bool {
    for (idx, token) in node_tokens.iter().enumerate() {
        if token.kind != TokenKind::Digits {
            continue;
        }
        let neighbors = [idx.checked_sub(1), Some(idx + 1)];
        for neighbor in neighbors.into_iter().flatten() {
            if let Some(other) = node_tokens.get(neighbor) {
                if NUMBER_CONTEXT_NEIGHBORS.contains(&other.text.as_str()) {
                    return true;
                }
            }
        }
    }
    false
}

fn detect_code_exact(query_tokens: &[String], node_tokens: &[Token]) -> bool {
    node_tokens
        .iter()
        .any(|t| t.kind == TokenKind::CodeExact && query_tokens.iter().any(|q| q == &t.text))
}

fn detect_definition_title(query_tokens: &[String], title_tokens: &[String]) -> bool {
    if query_tokens.is_empty() || title_tokens.is_empty() {
        return false;
    }
    let head_len = query_tokens.len().min(title_tokens.len());
    query_tokens[..head_len] == title_tokens[..head_len]
}

fn detect_exceptions(node_tokens: &[Token], exceptions_vocab: &[String]) -> bool {
    if exceptions_vocab.is_empty() {
        return false;
    }
    let node_text: HashSet<&str> = node_tokens.iter().map(|t| t.text.as_str()).collect();
    exceptions_vocab.iter().any(|term| node_text.contains(term.as_str()))
}

/// Inputs a gate passes to [`compute_signals`] for a single candidate node.
pub struct SignalContext<'a> {
    pub query_tokens: &'a [String],
    pub node_tokens: &'a [Token],
    pub title_tokens: &'a [String],
    pub exceptions_vocab: &'a [String],
}

/// Compute every signal that fires for one candidate. `exact` fires whenever
/// every query token is found verbatim in the node (the strongest, simplest
/// signal); the rest are additive refinements on top of it.
#[must_use]
pub fn compute_signals(ctx: &SignalContext<'_>, config: &SearchConfig) -> Vec<SignalHit> {
    let mut hits = Vec::new();

    let all_present = !ctx.query_tokens.is_empty()
        && ctx
            .query_tokens
            .iter()
            .all(|term| ctx.node_tokens.iter().any(|t| &t.text == term));
    if all_present {
        hits.push(SignalHit { signal: Signal::Exact, bonus: 0.0 });
    }

    if detect_phrase(ctx.query_tokens, ctx.node_tokens) {
        hits.push(SignalHit {
            signal: Signal::Phrase,
            bonus: config.lexical_phrase_weight,
        });
    }

    match detect_proximity(ctx.query_tokens, ctx.node_tokens) {
        Some(true) => hits.push(SignalHit {
            signal: Signal::Proximity,
            bonus: config.lexical_proximity_bonus_near,
        }),
        Some(false) => hits.push(SignalHit {
            signal: Signal::Proximity,
            bonus: config.lexical_proximity_bonus_far,
        }),
        None => {}
    }

    if detect_number_context(ctx.node_tokens) {
        hits.push(SignalHit {
            signal: Signal::NumberContext,
            bonus: config.lexical_number_context_bonus,
        });
    }

    if detect_code_exact(ctx.query_tokens, ctx.node_tokens) {
        hits.push(SignalHit {
            signal: Signal::CodeExact,
            bonus: 0.0, // realized as a tf doubling in the index score, not an additive bonus
        });
    }

    if detect_definition_title(ctx.query_tokens, ctx.title_tokens) {
        hits.push(SignalHit {
            signal: Signal::DefinitionTitle,
            bonus: config.lexical_coverage_weight,
        });
    }

    if detect_exceptions(ctx.node_tokens, ctx.exceptions_vocab) {
        hits.push(SignalHit { signal: Signal::Exceptions, bonus: 0.0 });
    }

    hits
}

/// True if `hits` contains at least one signal that is not [`Signal::Exceptions`]
/// alone — `g0`'s acceptance rule (SPEC_FULL.md §4.4).
#[must_use]
pub fn has_non_exceptions_signal(hits: &[SignalHit]) -> bool {
    hits.iter().any(|h| h.signal != Signal::Exceptions)
}

/// Pseudo-relevance feedback: pull the `top_n` highest-IDF terms out of the
/// top-ranked nodes' own vocabulary, excluding terms already in the query.
/// Strictly optional (SPEC_FULL.md §4.5) — callers may ignore the result.
#[must_use]
pub fn prf_terms(index: &SparseIndex, top_node_ids: &[String], query_tokens: &[String], top_n: usize) -> Vec<String> {
    let mut candidates: Vec<(String, f64)> = Vec::new();
    let mut seen = HashSet::new();
    for node_id in top_node_ids {
        let Some(tokens) = index.node_tokens(node_id) else {
            continue;
        };
        for token in tokens {
            if query_tokens.contains(&token.text) || !seen.insert(token.text.clone()) {
                continue;
            }
            let idf = index.idf(&token.text);
            candidates.push((token.text.clone(), idf));
        }
    }
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    candidates.into_iter().take(top_n).map(|(term, _)| term).collect()
}

/// Additive score applied to an exploration-sourced candidate (SPEC_FULL.md
/// §4.5): low-prior candidates are injected at a scaled-down score so they
/// cannot outrank genuinely relevant gate output.
#[must_use]
pub fn exploration_bonus(base_score: f64, config: &SearchConfig) -> f64 {
    base_score * config.exploration_score_scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::normalize;
    use crate::tokenizer::tokenize;

    fn tok(text: &str) -> Vec<Token> {
        tokenize(&normalize(text))
    }

    fn q(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn phrase_detected_for_adjacent_in_order_tokens() {
        let node = tok("the quick brown fox jumps");
        assert!(detect_phrase(&q(&["quick", "brown", "fox"]), &node));
        assert!(!detect_phrase(&q(&["fox", "quick"]), &node));
    }

    #[test]
    fn proximity_near_vs_far_vs_none() {
        let near = tok("alpha beta");
        assert_eq!(detect_proximity(&q(&["alpha", "beta"]), &near), Some(true));

        let far_text = format!("alpha {} beta", "filler ".repeat(15));
        let far = tok(&far_text);
        assert_eq!(detect_proximity(&q(&["alpha", "beta"]), &far), Some(false));

        let too_far_text = format!("alpha {} beta", "filler ".repeat(30));
        let too_far = tok(&too_far_text);
        assert_eq!(detect_proximity(&q(&["alpha", "beta"]), &too_far), None);
    }

    #[test]
    fn number_context_requires_a_unit_neighbor() {
        let with_unit = tok("wait 3 days before retry");
        assert!(detect_number_context(&with_unit));
        let bare = tok("room 304 is empty");
        assert!(!detect_number_context(&bare));
    }

    #[test]
    fn code_exact_matches_verbatim_only() {
        let node = tok("run foo_bar now");
        assert!(detect_code_exact(&q(&["foo_bar"]), &node));
        assert!(!detect_code_exact(&q(&["foobar"]), &node));
    }

    #[test]
    fn definition_title_matches_query_head() {
        let title = q(&["install", "guide"]);
        assert!(detect_definition_title(&q(&["install", "guide", "steps"]), &title));
        assert!(!detect_definition_title(&q(&["uninstall"]), &title));
    }

    #[test]
    fn exceptions_vocab_matches_node_tokens() {
        let node = tok("deprecated legacy_flag still supported");
        assert!(detect_exceptions(&node, &[String::from("legacy_flag")]));
        assert!(!detect_exceptions(&node, &[String::from("unrelated")]));
    }

    #[test]
    fn g0_rejects_exceptions_only_hits() {
        let hits = vec![SignalHit { signal: Signal::Exceptions, bonus: 0.0 }];
        assert!(!has_non_exceptions_signal(&hits));
        let hits_with_phrase = vec![
            SignalHit { signal: Signal::Exceptions, bonus: 0.0 },
            SignalHit { signal: Signal::Phrase, bonus: 0.5 },
        ];
        assert!(has_non_exceptions_signal(&hits_with_phrase));
    }

    #[test]
    fn exploration_bonus_scales_down_base_score() {
        let cfg = SearchConfig::default();
        let scaled = exploration_bonus(10.0, &cfg);
        assert!(scaled < 10.0);
        assert!((scaled - 10.0 * cfg.exploration_score_scale).abs() < 1e-9);
    }
}
