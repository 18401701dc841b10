//! Overlapping fixed-size text chunker.
//!
//! Splits extracted document text into [`Chunk`]s of at most `chunk_size`
//! characters where every chunk after the first starts with exactly
//! `overlap` characters copied from the end of its predecessor. Splits
//! prefer a whitespace boundary close to the size limit so words are not
//! cut mid-token; when no whitespace is near the limit the split is hard.
//!
//! Sizes are measured in Unicode scalar values, not bytes, so multi-byte
//! text never splits inside a character.
//!
//! The output is a pure function of `(text, chunk_size, overlap)`, which is
//! what makes re-indexing the same content idempotent.

use crate::error::{KbError, KbResult};
use crate::models::Chunk;

/// Fraction of `chunk_size` to search backwards for a whitespace split.
const LOOKBACK_DIVISOR: usize = 5;

/// Split `text` into overlapping chunks for `document`.
///
/// Returns [`KbError::EmptyInput`] when `text` has no non-whitespace
/// characters. `overlap` is clamped below `chunk_size`.
pub fn chunk_text(
    document: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> KbResult<Vec<Chunk>> {
    if text.trim().is_empty() || chunk_size == 0 {
        return Err(KbError::EmptyInput);
    }
    let overlap = overlap.min(chunk_size - 1);
    let lookback = (chunk_size / LOOKBACK_DIVISOR).max(1);

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let limit = (start + chunk_size).min(len);
        let end = if limit == len {
            len
        } else {
            // A chunk must be longer than the overlap or the next start
            // would not advance.
            let min_end = start + overlap + 1;
            let floor = min_end.max(limit.saturating_sub(lookback));
            split_point(&chars, floor, limit)
        };

        chunks.push(Chunk {
            document: document.to_string(),
            sequence: chunks.len() as i64,
            text: chars[start..end].iter().collect(),
            start_offset: start,
            overlap: if start == 0 { 0 } else { overlap },
        });

        if end == len {
            break;
        }
        start = end - overlap;
    }

    Ok(chunks)
}

/// Pick the chunk end in `floor..=limit`: the latest position whose
/// preceding character is whitespace, or `limit` if there is none.
fn split_point(chars: &[char], floor: usize, limit: usize) -> usize {
    (floor..=limit)
        .rev()
        .find(|&end| end > 0 && chars[end - 1].is_whitespace())
        .unwrap_or(limit)
}

/// Rebuild the original text from a chunk sequence by dropping each
/// chunk's declared overlap.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.extend(chunk.text.chars().skip(chunk.overlap));
    }
    out
}
