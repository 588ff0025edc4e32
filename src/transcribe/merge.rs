//! Overlap-aware merge of sequential chunk transcriptions.
//!
//! Adjacent chunks share `overlap_secs` of audio, so the head of each chunk
//! usually re-transcribes the tail of the previous one. The merge estimates
//! the overlap in tokens (~2.5 tokens per second of speech), scans candidate
//! alignment windows at the head of the new chunk, and skips past the best
//! match before appending.
//!
//! When no window reaches two matching tokens the new chunk is appended
//! verbatim, even if its head still shares words with the accumulated tail.
//! Duplicated words at a join are cheap; deleting real speech is not.

/// Estimated spoken tokens per second, for sizing the overlap window.
const TOKENS_PER_SEC: f64 = 2.5;

/// Minimum matching tokens for an alignment to be trusted.
const MIN_MATCHING_TOKENS: usize = 2;

fn normalize(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Merge chunk texts transcribed with `overlap_secs` of shared audio.
///
/// The first chunk is accepted verbatim; each later chunk is aligned against
/// the accumulated tail. Whitespace runs collapse to single spaces and the
/// result is trimmed, so a single-chunk merge yields the trimmed input.
pub fn merge_chunks(chunks: &[String], overlap_secs: f64) -> String {
    let mut merged: Vec<String> = Vec::new();

    // Estimated overlap token count.
    let k = (TOKENS_PER_SEC * overlap_secs).ceil() as usize;

    for (i, chunk) in chunks.iter().enumerate() {
        let tokens: Vec<&str> = chunk.split_whitespace().collect();
        if i == 0 || k == 0 {
            merged.extend(tokens.iter().map(|t| (*t).to_owned()));
            continue;
        }

        let skip = overlap_skip(&merged, &tokens, k);
        merged.extend(tokens.iter().skip(skip).map(|t| (*t).to_owned()));
    }

    merged.join(" ").trim().to_owned()
}

/// Number of leading tokens of `new_tokens` to skip as re-transcribed
/// overlap, or 0 when no alignment is trusted.
///
/// Compares the normalized last `2k` tokens of the accumulated text against
/// windows starting at positions `0..=3k` of the new chunk; each window is
/// scored by position-wise matches against the tail suffix of equal length.
/// The best window wins as `start + compared length`.
fn overlap_skip(merged: &[String], new_tokens: &[&str], k: usize) -> usize {
    let tail_len = (2 * k).min(merged.len());
    if tail_len == 0 || new_tokens.is_empty() {
        return 0;
    }
    let tail: Vec<String> = merged[merged.len() - tail_len..]
        .iter()
        .map(|t| normalize(t))
        .collect();
    let head: Vec<String> = new_tokens.iter().map(|t| normalize(t)).collect();

    let max_start = (3 * k).min(head.len());
    let mut best_matches = 0usize;
    let mut best_overlap_index = 0usize;

    for start in 0..=max_start {
        let compared = k.min(head.len() - start).min(tail.len());
        if compared == 0 {
            break;
        }
        let tail_suffix = &tail[tail.len() - compared..];
        let window = &head[start..start + compared];

        let matches = tail_suffix
            .iter()
            .zip(window.iter())
            .filter(|(a, b)| a == b)
            .count();
        if matches > best_matches {
            best_matches = matches;
            best_overlap_index = start + compared;
        }
    }

    if best_matches >= MIN_MATCHING_TOKENS {
        best_overlap_index
    } else {
        0
    }
}
