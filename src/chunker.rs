//! Sentence-aware overlapping windows over raw document text.

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Character ceiling per chunk unless the embedder asks for less.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 30_000;

/// Window size and overlap in whitespace tokens, plus a hard character ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingPolicy {
    /// Maximum tokens per chunk.
    pub chunk_tokens: usize,
    /// Desired tail overlap between adjacent chunks.
    pub overlap_tokens: usize,
    /// Maximum characters per chunk; longer windows are cut, long tokens split.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
}

fn default_max_chunk_chars() -> usize {
    DEFAULT_MAX_CHUNK_CHARS
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            chunk_tokens: 800,
            overlap_tokens: 100,
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
        }
    }
}

impl ChunkingPolicy {
    /// Builds a policy, rejecting a zero window.
    pub fn new(chunk_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        if chunk_tokens == 0 {
            return Err(RagError::InvalidInput(
                "chunk size must be at least one token".into(),
            ));
        }
        Ok(Self {
            chunk_tokens,
            overlap_tokens,
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
        })
    }

    /// Caps chunk length in characters, typically at the embedder's per-input limit.
    pub fn with_max_chars(mut self, max_chunk_chars: usize) -> Result<Self> {
        if max_chunk_chars == 0 {
            return Err(RagError::InvalidInput(
                "chunk character limit must be positive".into(),
            ));
        }
        self.max_chunk_chars = max_chunk_chars;
        Ok(self)
    }

    fn effective_overlap(&self) -> usize {
        self.overlap_tokens.min(self.chunk_tokens.saturating_sub(1))
    }
}

/// Chunk boundaries before the store assigns identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Zero-based position.
    pub ordinal: usize,
    /// Text slice covered by the window.
    pub text: String,
    /// Byte offset into the source text.
    pub char_start: usize,
    /// Exclusive byte end offset.
    pub char_end: usize,
    /// Whitespace tokens in the window.
    pub token_count: usize,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
    // Character offsets, for the per-chunk ceiling.
    char_start: usize,
    char_end: usize,
    ends_sentence: bool,
}

/// Rough token count (whitespace-delimited words, minimum one).
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count().max(1)
}

/// Splits `text` into overlapping windows. Deterministic for a given text and policy.
///
/// No window exceeds `max_chunk_chars` characters; a single token longer than
/// that is cut into pieces that count as separate tokens.
pub fn split(text: &str, policy: &ChunkingPolicy) -> Vec<ChunkSpan> {
    let max_chars = policy.max_chunk_chars.max(1);
    let tokens = tokenize(text, max_chars);
    if tokens.is_empty() {
        return Vec::new();
    }

    let window = policy.chunk_tokens.max(1);
    let overlap = policy.effective_overlap();
    let total = tokens.len();
    let mut spans = Vec::new();
    let mut start = 0usize;

    loop {
        let limit = char_limit(&tokens, start, (start + window).min(total), max_chars);
        let end = if limit == total {
            total
        } else {
            sentence_boundary(&tokens, start, limit).unwrap_or(limit)
        };

        let char_start = tokens[start].start;
        let char_end = tokens[end - 1].end;
        spans.push(ChunkSpan {
            ordinal: spans.len(),
            text: text[char_start..char_end].to_string(),
            char_start,
            char_end,
            token_count: end - start,
        });

        if end == total {
            break;
        }
        start = next_start(&tokens, start, end, overlap);
    }

    spans
}

// Shrinks the window end until its text fits in `max_chars`; never below one token.
fn char_limit(tokens: &[Token], start: usize, limit: usize, max_chars: usize) -> usize {
    let first = tokens[start].char_start;
    let mut end = limit;
    while end > start + 1 && tokens[end - 1].char_end - first > max_chars {
        end -= 1;
    }
    end
}

// Largest cut point in (start, limit] that lands right after a sentence terminator.
fn sentence_boundary(tokens: &[Token], start: usize, limit: usize) -> Option<usize> {
    (start + 1..=limit)
        .rev()
        .find(|&cut| tokens[cut - 1].ends_sentence)
}

fn next_start(tokens: &[Token], start: usize, end: usize, overlap: usize) -> usize {
    if overlap == 0 || end.saturating_sub(overlap) <= start {
        return end;
    }
    let candidate = end - overlap;
    // Prefer overlap that begins on a sentence start.
    (candidate..end)
        .find(|&idx| idx > 0 && tokens[idx - 1].ends_sentence)
        .unwrap_or(candidate)
}

fn tokenize(text: &str, max_chars: usize) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut chars = 0usize;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some((begin, char_begin)) = current.take() {
                push_word(&mut tokens, text, (begin, idx), (char_begin, chars), max_chars);
            }
            if ch == '\n' {
                if let Some(last) = tokens.last_mut() {
                    last.ends_sentence = true;
                }
            }
        } else if current.is_none() {
            current = Some((idx, chars));
        }
        chars += 1;
    }
    if let Some((begin, char_begin)) = current {
        push_word(&mut tokens, text, (begin, text.len()), (char_begin, chars), max_chars);
    }
    tokens
}

// Emits one token per word, or several `max_chars`-sized pieces for an oversized word.
fn push_word(
    tokens: &mut Vec<Token>,
    text: &str,
    (start, end): (usize, usize),
    (char_start, char_end): (usize, usize),
    max_chars: usize,
) {
    let word = &text[start..end];
    let trimmed = word.trim_end_matches(['"', '\'', ')', ']', '”', '’']);
    let ends_sentence = trimmed.ends_with(['.', '!', '?', '。', '！', '？']);
    if char_end - char_start <= max_chars {
        tokens.push(Token {
            start,
            end,
            char_start,
            char_end,
            ends_sentence,
        });
        return;
    }
    let mut piece_start = start;
    let mut piece_chars = char_start;
    let mut offsets = word.char_indices().map(|(i, _)| start + i).skip(max_chars).step_by(max_chars);
    loop {
        let piece_end = offsets.next().unwrap_or(end);
        let piece_char_end = (piece_chars + max_chars).min(char_end);
        let last = piece_end == end;
        tokens.push(Token {
            start: piece_start,
            end: piece_end,
            char_start: piece_chars,
            char_end: piece_char_end,
            ends_sentence: last && ends_sentence,
        });
        if last {
            break;
        }
        piece_start = piece_end;
        piece_chars = piece_char_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_text_fits_one_chunk() {
        let text = "The sky is blue. Water is wet.";
        let spans = split(text, &ChunkingPolicy::new(16, 4).unwrap());
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, text);
        assert_eq!(spans[0].token_count, 7);
        assert_eq!((spans[0].char_start, spans[0].char_end), (0, text.len()));
    }

    #[test]
    fn cuts_at_sentence_terminator_inside_window() {
        let text = "One two three. Four five six seven eight.";
        let spans = split(text, &ChunkingPolicy::new(5, 0).unwrap());
        assert_eq!(spans[0].text, "One two three.");
        assert_eq!(spans[1].text, "Four five six seven eight.");
    }

    #[test]
    fn hard_cuts_when_no_terminator() {
        let text = "a b c d e f g";
        let spans = split(text, &ChunkingPolicy::new(3, 0).unwrap());
        let texts: Vec<&str> = spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["a b c", "d e f", "g"]);
    }

    #[test]
    fn overlapping_windows_make_progress() {
        let text = "a b c d e f g h i j";
        let spans = split(text, &ChunkingPolicy::new(4, 2).unwrap());
        let texts: Vec<&str> = spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["a b c d", "c d e f", "e f g h", "g h i j"]);
        assert!(spans.windows(2).all(|w| w[0].char_end > w[1].char_start));
    }

    #[test]
    fn overlap_snaps_to_sentence_start() {
        let text = "Alpha beta. Gamma delta epsilon. Zeta eta theta.";
        let spans = split(text, &ChunkingPolicy::new(5, 3).unwrap());
        assert_eq!(spans[0].text, "Alpha beta. Gamma delta epsilon.");
        assert!(spans[1].text.starts_with("Gamma"));
    }

    #[test]
    fn newline_counts_as_terminator() {
        let text = "heading line\nbody text continues here";
        let spans = split(text, &ChunkingPolicy::new(4, 0).unwrap());
        assert_eq!(spans[0].text, "heading line");
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Sentence one is here. Sentence two follows! Does three ask? Four ends.\nFive.";
        let policy = ChunkingPolicy::new(6, 2).unwrap();
        assert_eq!(split(text, &policy), split(text, &policy));
    }

    #[test]
    fn blank_text_yields_nothing() {
        assert!(split("   \n\t ", &ChunkingPolicy::default()).is_empty());
    }

    #[test]
    fn zero_window_rejected() {
        assert!(ChunkingPolicy::new(0, 0).is_err());
        assert!(ChunkingPolicy::default().with_max_chars(0).is_err());
    }

    #[test]
    fn long_words_respect_default_character_ceiling() {
        let word = "x".repeat(40);
        let text = vec![word; 800].join(" ");
        let spans = split(&text, &ChunkingPolicy::default());
        assert!(spans.len() > 1);
        assert!(spans
            .iter()
            .all(|s| s.text.chars().count() <= DEFAULT_MAX_CHUNK_CHARS));
        assert_eq!(spans.last().unwrap().char_end, text.len());
    }

    #[test]
    fn character_ceiling_cuts_windows_before_token_limit() {
        let text = "alpha beta gamma delta epsilon";
        let policy = ChunkingPolicy::new(10, 0).unwrap().with_max_chars(11).unwrap();
        let texts: Vec<String> = split(text, &policy).into_iter().map(|s| s.text).collect();
        assert_eq!(texts, vec!["alpha beta", "gamma delta", "epsilon"]);
    }

    #[test]
    fn oversized_token_is_split_into_pieces() {
        let text = "短".repeat(25);
        let policy = ChunkingPolicy::new(800, 0).unwrap().with_max_chars(10).unwrap();
        let spans = split(&text, &policy);
        let sizes: Vec<usize> = spans.iter().map(|s| s.text.chars().count()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        let rebuilt: String = spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(rebuilt, text);
    }
}
