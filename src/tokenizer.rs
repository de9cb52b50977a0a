//! Tokenization over already-[`normalize`](crate::canonical::normalize)d text:
//! ASCII word/digit runs, Japanese character n-grams, and code-exact tokens
//! (SPEC_FULL.md §4.2).
//!
//! Tokens carry a node-wide sequence number (`seq`) so that phrase and
//! proximity signals can test adjacency (`seq` distance ≤ 1) without
//! re-scanning the source text.

/// The coarse class a token was extracted as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// An ASCII alphabetic run, e.g. `hello`.
    Word,
    /// An ASCII digit run, e.g. `2026`.
    Digits,
    /// A CJK bigram produced by the sliding-window n-gram pass.
    CjkGram,
    /// An ASCII run containing interior punctuation, matched verbatim against
    /// the query (e.g. `foo_bar`, `v1.2.3`, `--flag`).
    CodeExact,
}

/// A single token extracted from a node's normalized text.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    /// 0-based line number within the node, for proximity/context signals.
    pub line: usize,
    /// Byte offset of the token's first character within its line.
    pub char_offset: usize,
    /// Node-wide monotonic position, used for phrase/proximity adjacency.
    pub seq: usize,
    pub kind: TokenKind,
}

fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3040..=0x30FF   // hiragana, katakana
        | 0x3400..=0x4DBF // CJK ext A
        | 0x4E00..=0x9FFF // CJK unified ideographs
        | 0xF900..=0xFAFF // CJK compat ideographs
        | 0xFF66..=0xFF9F // halfwidth katakana
    )
}

fn is_ascii_run_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '/' | ':' | '@')
}

/// Classify a trimmed ASCII run as `Word`, `Digits`, or `CodeExact`.
///
/// Leading/trailing punctuation is trimmed before classification so ordinary
/// sentence punctuation (a trailing `.`, a wrapping pair of `()`) never turns a
/// plain word into a spurious code-exact token; only *interior* punctuation
/// (`foo_bar`, `v1.2.3`) marks a run as code-exact.
fn classify_ascii_run(run: &str) -> Option<(TokenKind, &str)> {
    let trimmed = run.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some((TokenKind::Digits, trimmed));
    }
    if trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some((TokenKind::Word, trimmed));
    }
    Some((TokenKind::CodeExact, trimmed))
}

/// Tokenize a single node's normalized text.
///
/// ASCII content is split into maximal runs of
/// `[a-z0-9_./:@-]` and classified; CJK content is split into overlapping
/// bigrams over consecutive CJK characters. A lone trailing CJK character (a
/// run of length 1) is still emitted as a unigram so no character is dropped.
#[must_use]
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut seq = 0usize;

    for (line_idx, line) in text.split('\n').enumerate() {
        let chars: Vec<(usize, char)> = line.char_indices().collect();
        let mut i = 0usize;
        while i < chars.len() {
            let (offset, ch) = chars[i];
            if is_ascii_run_char(ch) && ch.is_ascii() {
                let start = i;
                let mut end = i;
                while end < chars.len() && is_ascii_run_char(chars[end].1) && chars[end].1.is_ascii() {
                    end += 1;
                }
                let run_start_byte = chars[start].0;
                let run_end_byte = if end < chars.len() { chars[end].0 } else { line.len() };
                let run = &line[run_start_byte..run_end_byte];
                if let Some((kind, word)) = classify_ascii_run(run) {
                    tokens.push(Token {
                        text: word.to_owned(),
                        line: line_idx,
                        char_offset: offset,
                        seq,
                        kind,
                    });
                    seq += 1;
                }
                i = end;
            } else if is_cjk(ch) {
                let start = i;
                let mut end = i;
                while end < chars.len() && is_cjk(chars[end].1) {
                    end += 1;
                }
                emit_cjk_grams(&chars, start, end, line, line_idx, &mut seq, &mut tokens);
                i = end;
            } else {
                i += 1;
            }
        }
    }
    tokens
}

fn emit_cjk_grams(
    chars: &[(usize, char)],
    start: usize,
    end: usize,
    line: &str,
    line_idx: usize,
    seq: &mut usize,
    tokens: &mut Vec<Token>,
) {
    if end - start == 1 {
        let (offset, ch) = chars[start];
        tokens.push(Token {
            text: ch.to_string(),
            line: line_idx,
            char_offset: offset,
            seq: *seq,
            kind: TokenKind::CjkGram,
        });
        *seq += 1;
        return;
    }
    for idx in start..end.saturating_sub(1) {
        let (offset, a) = chars[idx];
        let (_, b) = chars[idx + 1];
        let _ = line;
        let mut gram = String::with_capacity(a.len_utf8() + b.len_utf8());
        gram.push(a);
        gram.push(b);
        tokens.push(Token {
            text: gram,
            line: line_idx,
            char_offset: offset,
            seq: *seq,
            kind: TokenKind::CjkGram,
        });
        *seq += 1;
    }
}

/// Whether two tokens are adjacent in source order, per the phrase/proximity
/// `seq` distance rule (SPEC_FULL.md §4.2, §4.5).
#[must_use]
pub fn are_adjacent(a: &Token, b: &Token) -> bool {
    a.seq.abs_diff(b.seq) <= 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::normalize;

    fn words(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn splits_ascii_words_and_digits() {
        let tokens = tokenize(&normalize("hello world 2026"));
        assert_eq!(words(&tokens), vec!["hello", "world", "2026"]);
        assert_eq!(tokens[2].kind, TokenKind::Digits);
    }

    #[test]
    fn trims_sentence_punctuation_without_code_exact() {
        let tokens = tokenize(&normalize("Is this right? (Yes.)"));
        assert_eq!(words(&tokens), vec!["is", "this", "right", "yes"]);
        assert!(tokens.iter().all(|t| t.kind != TokenKind::CodeExact));
    }

    #[test]
    fn interior_punctuation_marks_code_exact() {
        let tokens = tokenize(&normalize("set foo_bar to v1.2.3 now"));
        let code_exact: Vec<&Token> = tokens.iter().filter(|t| t.kind == TokenKind::CodeExact).collect();
        assert_eq!(code_exact.len(), 2);
        assert_eq!(code_exact[0].text, "foo_bar");
        assert_eq!(code_exact[1].text, "v1.2.3");
    }

    #[test]
    fn cjk_bigrams_slide_over_consecutive_characters() {
        let tokens = tokenize(&normalize("有給休暇"));
        assert_eq!(words(&tokens), vec!["有給", "給休", "休暇"]);
        assert!(tokens.iter().all(|t| t.kind == TokenKind::CjkGram));
    }

    #[test]
    fn single_trailing_cjk_char_is_a_unigram() {
        let tokens = tokenize(&normalize("foo 年"));
        assert_eq!(words(&tokens), vec!["foo", "年"]);
    }

    #[test]
    fn mixed_ascii_and_cjk_sequence_numbers_are_contiguous() {
        let tokens = tokenize(&normalize("2026年7月28日"));
        let seqs: Vec<usize> = tokens.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, (0..seqs.len()).collect::<Vec<_>>());
    }

    #[test]
    fn adjacent_tokens_within_distance_one() {
        let tokens = tokenize(&normalize("alpha beta gamma"));
        assert!(are_adjacent(&tokens[0], &tokens[1]));
        assert!(!are_adjacent(&tokens[0], &tokens[2]));
    }

    #[test]
    fn line_and_char_offset_are_tracked() {
        let tokens = tokenize("first line\nsecond line");
        assert_eq!(tokens[0].line, 0);
        assert_eq!(tokens[2].line, 1);
        assert_eq!(tokens[2].char_offset, 0);
    }

    #[test]
    fn empty_text_yields_no_tokens() {
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn pure_punctuation_run_is_dropped() {
        let tokens = tokenize(&normalize("--- *** ==="));
        assert!(tokens.is_empty());
    }
}
