//! Text normalization: NFKC, width unification, casefold, whitespace/newline
//! collapse, and symbol-variant folding (SPEC_FULL.md §4.1).
//!
//! `normalize` is the single entry point every other component builds on: the
//! tokenizer, the sparse index, and the cache key all normalize their inputs
//! through this function so that two spellings of the same logical text
//! (different width, case, or newline convention) always compare equal.

use std::sync::LazyLock;

use unicode_normalization::UnicodeNormalization;

/// Hyphen-class characters folded to ASCII `-`: hyphen-minus, hyphen, non-breaking
/// hyphen, figure dash, en dash, em dash, minus sign. NFKC does not unify these
/// (they are not compatibility-equivalent to `-`), so they are folded explicitly.
const HYPHEN_CLASS: &[char] = &['\u{2010}', '\u{2011}', '\u{2012}', '\u{2013}', '\u{2014}', '\u{2212}'];

/// Middle-dot class characters folded to U+30FB KATAKANA MIDDLE DOT.
const MIDDLE_DOT_CLASS: &[char] = &['\u{30FB}', '\u{FF65}'];

/// Representative bracket/slash pairs not already unified by NFKC, folded to a
/// canonical ASCII form. NFKC already folds full-width brackets (e.g. U+FF08/09)
/// to ASCII; this table covers the remaining typographic variants.
const BRACKET_SLASH_PAIRS: &[(char, char)] = &[
    ('\u{2018}', '\''), // left single quote
    ('\u{2019}', '\''), // right single quote
    ('\u{201C}', '"'),  // left double quote
    ('\u{201D}', '"'),  // right double quote
    ('\u{2044}', '/'),  // fraction slash
    ('\u{2215}', '/'),  // division slash
];

fn fold_char(ch: char) -> char {
    if HYPHEN_CLASS.contains(&ch) {
        return '-';
    }
    if MIDDLE_DOT_CLASS.contains(&ch) {
        return '\u{30FB}';
    }
    if let Some((_, to)) = BRACKET_SLASH_PAIRS.iter().find(|(from, _)| *from == ch) {
        return *to;
    }
    match ch {
        '\u{3000}' => ' ', // ideographic (full-width) space
        '\t' => ' ',
        _ => ch,
    }
}

/// Collapse a run of ASCII spaces within a single line to one space, trimming
/// the line's leading and trailing whitespace. Only intra-line whitespace is
/// collapsed; newlines themselves are never touched here, which is what keeps
/// `normalize` line-count-preserving.
fn collapse_line_whitespace(line: &str) -> String {
    static RUN: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"[ ]{2,}").unwrap());
    RUN.replace_all(line.trim(), " ").into_owned()
}

/// Normalize raw document or query text.
///
/// Pipeline: Unicode NFKC → symbol-variant folding (hyphen/middle-dot/bracket/
/// digit classes; NFKC itself already folds full-width ASCII, full-width digits,
/// and compatibility-equivalent Roman numerals) → `\r\n`/`\r` → `\n` → per-line
/// whitespace collapse and trim → casefold.
///
/// `normalize(normalize(x)) == normalize(x)` for all `x` (SPEC_FULL.md §8,
/// invariant 1), and the number of `\n`-delimited lines is preserved.
#[must_use]
pub fn normalize(input: &str) -> String {
    let nfkc: String = input.nfkc().collect();
    let folded: String = nfkc.chars().map(fold_char).collect();
    let newlines_unified = folded.replace("\r\n", "\n").replace('\r', "\n");
    let collapsed: Vec<String> = newlines_unified
        .split('\n')
        .map(|line| collapse_line_whitespace(line))
        .collect();
    collapsed.join("\n").to_lowercase()
}

/// Number of `\n`-delimited lines in `text` (used by the idempotence/line-count
/// invariant tests and by callers that want to sanity-check a normalization).
#[must_use]
pub fn line_count(text: &str) -> usize {
    text.split('\n').count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_on_plain_ascii() {
        let input = "  Hello   World  \n\n  Foo ";
        let once = normalize(input);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn idempotent_on_mixed_width_and_symbols() {
        let inputs = [
            "Ｈｅｌｌｏ－Ｗｏｒｌｄ",
            "価格：１２３円・税込",
            "café — naïve résumé",
            "2026年7月28日",
        ];
        for input in inputs {
            let once = normalize(input);
            let twice = normalize(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn casefolds_to_lowercase() {
        assert_eq!(normalize("HELLO World"), "hello world");
    }

    #[test]
    fn collapses_crlf_and_cr_to_lf() {
        let a = normalize("line1\r\nline2");
        let b = normalize("line1\rline2");
        let c = normalize("line1\nline2");
        assert_eq!(a, c);
        assert_eq!(b, c);
    }

    #[test]
    fn collapses_tabs_and_fullwidth_space() {
        assert_eq!(normalize("a\tb"), "a b");
        assert_eq!(normalize("a\u{3000}b"), "a b");
    }

    #[test]
    fn collapses_whitespace_runs_within_a_line() {
        assert_eq!(normalize("a     b"), "a b");
    }

    #[test]
    fn preserves_line_count() {
        let input = "one\n\ntwo\nthree\r\nfour\r\rfive";
        let normalized = normalize(input);
        // \r\n and lone \r both fold to a single \n, matching the original
        // break count for this input.
        assert_eq!(line_count(&normalized), line_count("one\n\ntwo\nthree\nfour\nfive"));
    }

    #[test]
    fn fullwidth_ascii_unified_by_nfkc() {
        assert_eq!(normalize("ＡＢＣ"), "abc");
    }

    #[test]
    fn fullwidth_digits_unified_by_nfkc() {
        assert_eq!(normalize("１２３"), "123");
    }

    #[test]
    fn hyphen_class_folds_to_ascii_hyphen() {
        for ch in HYPHEN_CLASS {
            let input = format!("foo{ch}bar");
            assert_eq!(normalize(&input), "foo-bar", "failed for {ch:?}");
        }
    }

    #[test]
    fn middle_dot_class_folds_to_katakana_middle_dot() {
        assert_eq!(normalize("あ・い"), "あ\u{30fb}い");
        assert_eq!(normalize("あ\u{ff65}い"), "あ\u{30fb}い");
    }

    #[test]
    fn curly_quotes_fold_to_straight() {
        assert_eq!(normalize("\u{2018}hi\u{2019}"), "'hi'");
        assert_eq!(normalize("\u{201c}hi\u{201d}"), "\"hi\"");
    }

    #[test]
    fn japanese_text_is_preserved() {
        assert_eq!(normalize("年次有給休暇の付与日数"), "年次有給休暇の付与日数");
    }

    #[test]
    fn empty_and_whitespace_only() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \n\t  "), "\n");
    }

    #[test]
    fn roman_numeral_compatibility_decomposition() {
        // U+2163 ROMAN NUMERAL FOUR NFKC-decomposes to "IV".
        assert_eq!(normalize("\u{2163}"), "iv");
    }
}
