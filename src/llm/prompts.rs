//! Prompt assembly per entry kind.

use crate::store::{PromptAnswer, PROMPT_KEYS};
use std::collections::HashMap;

/// The fixed section skeleton of the brain-dump journal body, in order.
pub const JOURNAL_SECTIONS: [&str; 14] = [
    "TL;DR",
    "Today in 6 Bullets",
    "What Actually Mattered",
    "Distractions vs Leverage",
    "Decisions",
    "Friction",
    "Emotional State",
    "Money",
    "90-day Extrapolation",
    "Identity Continuation",
    "Three Non-Negotiables",
    "Open Loops",
    "Identity Check",
    "Tags",
];

/// Reviewer-facing labels for the four reflection prompts.
const PROMPT_LABELS: [(&str, &str); 4] = [
    ("gratitude", "What I'm grateful for"),
    ("accomplishments", "What I accomplished"),
    ("challenges", "What challenged me"),
    ("tomorrow", "What I want from tomorrow"),
];

/// Build the long-form prompt that turns a free-voice transcript into the
/// Daily Strategic Journal skeleton. The transcript is interpolated verbatim
/// inside triple-quoted fences so the model cannot confuse speech with
/// instructions.
pub fn brain_dump_prompt(transcript: &str, user_name: &str) -> String {
    let mut prompt = String::with_capacity(transcript.len() + 1024);

    prompt.push_str(
        "You are a precise journaling assistant. Rewrite the voice transcript \
         below into a Daily Strategic Journal in Markdown.\n\n",
    );
    if !user_name.trim().is_empty() {
        prompt.push_str(&format!(
            "The author's name is {}. Write in their first-person voice.\n\n",
            user_name.trim()
        ));
    }
    prompt.push_str("Produce exactly these sections, in this order, each as a `## ` heading:\n");
    for section in JOURNAL_SECTIONS {
        prompt.push_str(&format!("- {section}\n"));
    }
    prompt.push_str(
        "\nRules:\n\
         - Use only information present in the transcript; never invent events.\n\
         - Keep the author's words where they are vivid; tighten rambling.\n\
         - \"Today in 6 Bullets\" is at most six short bullets.\n\
         - \"Tags\" is a single line of lowercase hashtags.\n\
         - If a section has no supporting material, write a single line: n/a.\n\
         - Output only the journal body, no preamble.\n\n",
    );
    prompt.push_str("Transcript:\n\"\"\"\n");
    prompt.push_str(transcript.trim());
    prompt.push_str("\n\"\"\"\n");
    prompt
}

/// Build the short prompt for the daily-reflection paragraph from whichever
/// of the four guided answers are non-empty.
pub fn reflection_prompt(answers: &HashMap<String, PromptAnswer>) -> String {
    let mut prompt = String::from(
        "Write a reflective journal paragraph from today's notes. \
         2 to 4 sentences, first person, warm but honest, no lists, \
         no preamble.\n\nToday's notes:\n",
    );

    for key in PROMPT_KEYS {
        let Some(answer) = answers.get(key) else {
            continue;
        };
        let text = answer.effective_text();
        if text.is_empty() {
            continue;
        }
        let label = PROMPT_LABELS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, l)| *l)
            .unwrap_or(key);
        prompt.push_str(&format!("{label}: {text}\n"));
    }
    prompt
}
