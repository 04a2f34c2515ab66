//! Text normalization that defeats common filter evasion
//!
//! Every normalized character remembers the byte span of the original
//! characters it was produced from, so match positions found in the
//! normalized text can be reported against the original string.

use std::ops::Range;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Runs of identical characters are capped at this length by default
pub const DEFAULT_REPEAT_THRESHOLD: usize = 2;

/// Normalized text plus the offset table back into the original
#[derive(Debug, Clone)]
pub struct Normalized {
    text: String,
    /// Original byte span of each normalized char
    spans: Vec<Range<usize>>,
    /// Char index for every byte offset of `text`, plus one entry for `text.len()`
    char_at_byte: Vec<usize>,
}

impl Normalized {
    /// The normalized text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Map a byte range of the normalized text to a byte range of the original
    ///
    /// Returns `None` for empty ranges or ranges outside the text.
    #[must_use]
    pub fn original_range(&self, range: Range<usize>) -> Option<Range<usize>> {
        if range.start >= range.end || range.end > self.text.len() {
            return None;
        }
        let first = self.char_at_byte[range.start];
        let last = self.char_at_byte[range.end] - 1;
        Some(self.spans[first].start..self.spans[last].end)
    }
}

/// Characters that render as nothing and are inserted to split words
fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{034F}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{FEFF}'
    )
}

/// Punctuation dropped entirely so "h.e.l.l.o" reads as "hello"
fn is_filler(c: char) -> bool {
    matches!(c, '.' | '-' | '_' | '*' | '~' | '\'' | '"' | '`')
}

/// Map leetspeak and homoglyphs to the ASCII letter they imitate
fn fold_confusable(c: char) -> char {
    match c {
        '0' | 'ο' | 'о' => 'o',
        '1' | '!' | '|' | 'ι' | 'і' => 'i',
        '3' | 'ε' | 'е' => 'e',
        '4' | '@' | 'α' | 'а' => 'a',
        '5' | '$' | 'ѕ' => 's',
        '7' | '+' | 'τ' | 'т' => 't',
        '8' | 'β' | 'в' => 'b',
        '9' => 'g',
        'κ' | 'к' => 'k',
        'ν' => 'v',
        'ρ' | 'р' => 'p',
        'υ' => 'u',
        'χ' | 'х' => 'x',
        'с' => 'c',
        'у' => 'y',
        'м' => 'm',
        'н' => 'h',
        'ј' => 'j',
        other => other,
    }
}

/// Normalize `input`, capping runs of identical chars at `repeat_threshold`
#[must_use]
pub fn normalize(input: &str, repeat_threshold: usize) -> Normalized {
    let folded = fold(input);
    let spaced = collapse_whitespace(folded);
    let joined = join_spaced_letters(spaced);
    let squeezed = squeeze_repeats(joined, repeat_threshold.max(2));
    build(squeezed)
}

type Pieces = Vec<(char, Range<usize>)>;

fn fold(input: &str) -> Pieces {
    let mut out = Vec::with_capacity(input.len());
    for (offset, c) in input.char_indices() {
        let span = offset..offset + c.len_utf8();
        for decomposed in std::iter::once(c).nfkd() {
            if is_combining_mark(decomposed) || is_invisible(decomposed) {
                continue;
            }
            for lower in decomposed.to_lowercase() {
                let folded = fold_confusable(lower);
                if is_filler(folded) {
                    continue;
                }
                let folded = if folded.is_alphanumeric() { folded } else { ' ' };
                out.push((folded, span.clone()));
            }
        }
    }
    out
}

fn collapse_whitespace(pieces: Pieces) -> Pieces {
    let mut out: Pieces = Vec::with_capacity(pieces.len());
    for (c, span) in pieces {
        if c == ' ' && out.last().is_none_or(|(prev, _)| *prev == ' ') {
            continue;
        }
        out.push((c, span));
    }
    if out.last().is_some_and(|(c, _)| *c == ' ') {
        out.pop();
    }
    out
}

/// Drop the spaces of "h e l l o" style spelling
fn join_spaced_letters(pieces: Pieces) -> Pieces {
    let is_single = |i: usize| {
        let before = i == 0 || pieces[i - 1].0 == ' ';
        let after = i + 1 >= pieces.len() || pieces[i + 1].0 == ' ';
        pieces[i].0 != ' ' && before && after
    };

    let mut keep = vec![true; pieces.len()];
    for i in 1..pieces.len().saturating_sub(1) {
        if pieces[i].0 == ' ' && is_single(i - 1) && is_single(i + 1) {
            keep[i] = false;
        }
    }

    pieces
        .into_iter()
        .zip(keep)
        .filter_map(|(piece, keep)| keep.then_some(piece))
        .collect()
}

/// Cap runs of identical chars at `threshold`, the last kept char absorbing the rest
fn squeeze_repeats(pieces: Pieces, threshold: usize) -> Pieces {
    let mut out: Pieces = Vec::with_capacity(pieces.len());
    let mut i = 0;
    while i < pieces.len() {
        let c = pieces[i].0;
        let mut end = i + 1;
        while end < pieces.len() && pieces[end].0 == c {
            end += 1;
        }
        if end - i > threshold {
            let last = i + threshold - 1;
            out.extend(pieces[i..last].iter().cloned());
            out.push((c, pieces[last].1.start..pieces[end - 1].1.end));
        } else {
            out.extend(pieces[i..end].iter().cloned());
        }
        i = end;
    }
    out
}

fn build(pieces: Pieces) -> Normalized {
    let mut text = String::with_capacity(pieces.len());
    let mut spans = Vec::with_capacity(pieces.len());
    let mut char_at_byte = Vec::with_capacity(pieces.len() + 1);

    for (index, (c, span)) in pieces.into_iter().enumerate() {
        text.push(c);
        spans.push(span);
        char_at_byte.extend(std::iter::repeat_n(index, c.len_utf8()));
    }
    char_at_byte.push(spans.len());

    Normalized {
        text,
        spans,
        char_at_byte,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(input: &str) -> String {
        normalize(input, DEFAULT_REPEAT_THRESHOLD).as_str().to_string()
    }

    #[test]
    fn test_leetspeak_and_case() {
        assert_eq!(norm("H3LL0 W0rld"), "hello world");
        assert_eq!(norm("$h!7"), "shit");
        assert_eq!(norm("@ss"), "ass");
    }

    #[test]
    fn test_strips_diacritics_and_zero_width() {
        assert_eq!(norm("hé\u{200B}llo"), "hello");
        assert_eq!(norm("ｈｅｌｌｏ"), "hello");
        // De-hoist prefix is a combining mark
        assert_eq!(norm("\u{0358}abc"), "abc");
    }

    #[test]
    fn test_homoglyphs() {
        // Cyrillic а, е, о
        assert_eq!(norm("hаllе wоrld"), "halle world");
    }

    #[test]
    fn test_spacing_and_fillers() {
        assert_eq!(norm("h e l l o"), "hello");
        assert_eq!(norm("h.e.l.l.o"), "hello");
        assert_eq!(norm("a cat"), "a cat");
        assert_eq!(norm("  spaced   out,  text  "), "spaced out text");
    }

    #[test]
    fn test_repeat_threshold() {
        assert_eq!(normalize("heeeeeello", 2).as_str(), "heello");
        assert_eq!(normalize("heeeeeello", 3).as_str(), "heeello");
        assert_eq!(normalize("heello", 3).as_str(), "heello");
    }

    #[test]
    fn test_squeezed_run_keeps_full_span() {
        let input = "heeeeeey";
        let normalized = normalize(input, 2);
        assert_eq!(normalized.as_str(), "heey");
        assert_eq!(normalized.original_range(0..4).unwrap(), 0..input.len());
        assert_eq!(normalized.original_range(2..3).unwrap(), 2..7);
    }

    #[test]
    fn test_original_range_maps_back() {
        let input = "h3ll0 w0rld";
        let normalized = normalize(input, DEFAULT_REPEAT_THRESHOLD);
        assert_eq!(normalized.as_str(), "hello world");

        let range = normalized.original_range(0..5).unwrap();
        assert_eq!(range, 0..5);
        assert_eq!(&input[range], "h3ll0");

        let range = normalized.original_range(6..11).unwrap();
        assert_eq!(&input[range], "w0rld");
    }

    #[test]
    fn test_original_range_multibyte() {
        let input = "ça\u{200B}ва";
        let normalized = normalize(input, DEFAULT_REPEAT_THRESHOLD);
        assert_eq!(normalized.as_str(), "caba");
        let range = normalized.original_range(0..normalized.as_str().len()).unwrap();
        assert_eq!(range, 0..input.len());
        assert!(input.is_char_boundary(range.start) && input.is_char_boundary(range.end));
    }

    #[test]
    fn test_original_range_rejects_empty() {
        let normalized = normalize("abc", DEFAULT_REPEAT_THRESHOLD);
        assert!(normalized.original_range(1..1).is_none());
        assert!(normalized.original_range(0..10).is_none());
    }
}
