//! Recursive separator text chunker.
//!
//! Splits document text into overlapping passages of at most `chunk_size`
//! characters. The coarsest separator present in the text is tried first
//! (paragraph, then line, then sentence punctuation, then space); pieces that
//! are still too long are split again with the next separator, down to single
//! characters.
//!
//! Adjacent pieces are greedily merged into chunks. When a chunk is emitted,
//! its trailing pieces (up to `chunk_overlap` characters) are carried into the
//! next chunk so context survives the boundary.
//!
//! Lengths are counted in `char`s, never bytes, so multi-byte text is never
//! split inside a code point.

use std::collections::VecDeque;

/// Separators in the order they are tried. Each separator stays attached to
/// the end of the piece it terminates.
pub const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", " ", ""];

/// Split `text` into chunks. Empty or whitespace-only input yields no chunks.
pub fn split(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    if chunk_size == 0 || text.trim().is_empty() {
        return Vec::new();
    }
    let overlap = chunk_overlap.min(chunk_size - 1);

    let mut chunks = Vec::new();
    split_recursive(text, SEPARATORS, chunk_size, overlap, &mut chunks);
    chunks
}

fn split_recursive(
    text: &str,
    separators: &[&str],
    chunk_size: usize,
    overlap: usize,
    out: &mut Vec<String>,
) {
    let mut separator = "";
    let mut finer: &[&str] = &[];
    for (i, sep) in separators.iter().enumerate() {
        if sep.is_empty() {
            break;
        }
        if text.contains(sep) {
            separator = sep;
            finer = &separators[i + 1..];
            break;
        }
    }

    let mut fitting: Vec<&str> = Vec::new();
    for piece in split_keep(text, separator) {
        if char_len(piece) <= chunk_size {
            fitting.push(piece);
            continue;
        }

        if !fitting.is_empty() {
            merge(&fitting, chunk_size, overlap, out);
            fitting.clear();
        }
        if finer.is_empty() {
            push_chunk(piece, out);
        } else {
            split_recursive(piece, finer, chunk_size, overlap, out);
        }
    }

    if !fitting.is_empty() {
        merge(&fitting, chunk_size, overlap, out);
    }
}

/// Split on `separator`, keeping it at the end of each piece. An empty
/// separator splits into single characters.
fn split_keep<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        let end = idx + separator.len();
        pieces.push(&text[start..end]);
        start = end;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn merge(pieces: &[&str], chunk_size: usize, overlap: usize, out: &mut Vec<String>) {
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let len = char_len(piece);
        if total + len > chunk_size && !window.is_empty() {
            push_chunk(&window.iter().copied().collect::<String>(), out);

            // Keep at most `overlap` chars, and make room for the next piece
            while total > overlap || (total > 0 && total + len > chunk_size) {
                match window.pop_front() {
                    Some(front) => total -= char_len(front),
                    None => break,
                }
            }
        }
        window.push_back(piece);
        total += len;
    }

    if !window.is_empty() {
        push_chunk(&window.iter().copied().collect::<String>(), out);
    }
}

fn push_chunk(text: &str, out: &mut Vec<String>) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split("Hello, world!", 100, 10);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(split("", 100, 10).is_empty());
        assert!(split("   \n\n\t  ", 100, 10).is_empty());
    }

    #[test]
    fn test_paragraph_split() {
        let chunks = split("Paragraph 1.\n\nParagraph 2 about cats.", 20, 5);
        assert!(chunks.len() >= 2, "got {:?}", chunks);
        assert_eq!(chunks[0], "Paragraph 1.");
        assert!(chunks.iter().any(|c| c.contains("cats")));
    }

    #[test]
    fn test_chunks_respect_size() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} is here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        for chunk in split(&text, 60, 15) {
            assert!(chunk.chars().count() <= 60, "too long: {:?}", chunk);
        }
    }

    #[test]
    fn test_every_sentence_survives() {
        let sentences: Vec<String> = (0..12)
            .map(|i| format!("Fact {} concerns topic {}.", i, i * 7))
            .collect();
        let text = sentences.join(" ");
        let chunks = split(&text, 80, 20);
        for s in &sentences {
            assert!(
                chunks.iter().any(|c| c.contains(s.as_str())),
                "sentence {:?} missing from {:?}",
                s,
                chunks
            );
        }
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let text = (0..60)
            .map(|i| format!("w{:02}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = split(&text, 30, 10);
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let first_word = pair[1].split(' ').next().unwrap();
            assert!(
                pair[0].contains(first_word),
                "{:?} does not overlap {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_no_separator_hard_splits() {
        let text = "x".repeat(95);
        let chunks = split(&text, 20, 0);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.len() <= 20));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_multibyte_text() {
        let text = "héllo wörld ñandú ".repeat(20);
        let chunks = split(&text, 7, 2);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 7));
    }

    #[test]
    fn test_overlap_larger_than_size_is_clamped() {
        let chunks = split("a b c d e f g h i j", 4, 100);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta.\n\nGamma delta! Epsilon? Zeta eta theta.";
        assert_eq!(split(text, 15, 4), split(text, 15, 4));
    }
}
