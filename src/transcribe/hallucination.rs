//! Hallucination detection for speech-tool output.
//!
//! Whisper-style models degrade in characteristic ways on silence or noise:
//! empty output, far too little text for the audio length, a phrase looping
//! back-to-back, or a single token dominating the output. Each rule reports
//! a confidence and a human-readable reason; the first matching rule wins.

/// Expected character production for normal speech, chars per second.
const BASELINE_CHARS_PER_SEC: f64 = 5.0;

/// Fraction of the baseline below which output counts as under-production.
const UNDERPRODUCTION_RATIO: f64 = 0.3;

/// Longest phrase length considered by the repetition rule.
const MAX_PHRASE_TOKENS: usize = 12;

/// Minimum back-to-back repeats for the repetition rule.
const MIN_PHRASE_REPEATS: usize = 3;

/// Share of total tokens a single token must exceed to count as dominating.
const DOMINANT_TOKEN_SHARE: f64 = 0.2;

/// Occurrences a dominating token must exceed.
const DOMINANT_TOKEN_COUNT: usize = 10;

/// A tripped detector rule.
#[derive(Debug, Clone, PartialEq)]
pub struct HallucinationFlag {
    pub confidence: f32,
    pub reason: String,
}

fn normalize_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Check `text` transcribed from `duration_secs` of audio. All rules are
/// evaluated; the highest-confidence tripped rule is reported, so a looping
/// phrase outranks mere under-production.
pub fn check(text: &str, duration_secs: f64) -> Option<HallucinationFlag> {
    let trimmed = text.trim();

    // Rule 1: empty output. Nothing else applies.
    if trimmed.is_empty() {
        return Some(HallucinationFlag {
            confidence: 1.0,
            reason: "empty transcription".to_owned(),
        });
    }

    let mut flags: Vec<HallucinationFlag> = Vec::new();

    // Rule 2: under-production for the audio length.
    let expected = UNDERPRODUCTION_RATIO * BASELINE_CHARS_PER_SEC * duration_secs;
    if (trimmed.len() as f64) < expected {
        flags.push(HallucinationFlag {
            confidence: 0.8,
            reason: format!(
                "suspiciously short output: {} chars for {duration_secs:.0}s of audio",
                trimmed.len()
            ),
        });
    }

    let tokens: Vec<String> = trimmed.split_whitespace().map(normalize_token).collect();

    // Rule 3: a contiguous phrase looping back-to-back.
    if let Some((phrase_len, repeats)) = find_phrase_loop(&tokens) {
        flags.push(HallucinationFlag {
            confidence: 0.95,
            reason: format!("phrase of {phrase_len} token(s) repeated {repeats} times in a row"),
        });
    }

    // Rule 4: a single token dominating the output.
    if let Some((token, count)) = find_dominant_token(&tokens) {
        flags.push(HallucinationFlag {
            confidence: 0.7,
            reason: format!(
                "token {token:?} accounts for {count} of {} tokens",
                tokens.len()
            ),
        });
    }

    flags
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Find a phrase (up to [`MAX_PHRASE_TOKENS`] tokens) repeated at least
/// [`MIN_PHRASE_REPEATS`] times back-to-back. Returns (phrase length,
/// repeat count) for the longest-repeating hit.
fn find_phrase_loop(tokens: &[String]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;

    for phrase_len in 1..=MAX_PHRASE_TOKENS.min(tokens.len() / MIN_PHRASE_REPEATS) {
        for start in 0..tokens.len().saturating_sub(phrase_len * MIN_PHRASE_REPEATS - 1) {
            let phrase = &tokens[start..start + phrase_len];
            let mut repeats = 1;
            let mut pos = start + phrase_len;
            while pos + phrase_len <= tokens.len() && &tokens[pos..pos + phrase_len] == phrase {
                repeats += 1;
                pos += phrase_len;
            }
            if repeats >= MIN_PHRASE_REPEATS
                && best.is_none_or(|(_, prev_repeats)| repeats > prev_repeats)
            {
                best = Some((phrase_len, repeats));
            }
        }
    }
    best
}

/// Find a normalized token of length > 2 that exceeds both the share and the
/// absolute occurrence thresholds.
fn find_dominant_token(tokens: &[String]) -> Option<(String, usize)> {
    if tokens.is_empty() {
        return None;
    }
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for token in tokens {
        if token.len() > 2 {
            *counts.entry(token.as_str()).or_default() += 1;
        }
    }

    let total = tokens.len() as f64;
    counts
        .into_iter()
        .filter(|(_, count)| *count > DOMINANT_TOKEN_COUNT)
        .find(|(_, count)| (*count as f64) / total > DOMINANT_TOKEN_SHARE)
        .map(|(token, count)| (token.to_owned(), count))
}
