//! Rule-based compression pass (no backend call)

use regex::Regex;
use std::sync::LazyLock;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static SENTENCE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+").expect("valid regex"));

static CLAUSE_PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[,;]+").expect("valid regex"));

const FILLER_WORDS: &[&str] = &[
    "please",
    "kindly",
    "if you could",
    "would you mind",
    "i would like to",
    "i want to",
    "i need to",
    "in order to",
    "so that",
    "in such a way that",
    "very",
    "really",
    "quite",
    "rather",
    "basically",
    "essentially",
    "fundamentally",
    "as a matter of fact",
    "in fact",
    "actually",
    "you know",
    "i mean",
    "like",
    "sort of",
    "kind of",
];

/// Applied in order; longer phrases come before the ones they contain
const WORDY_PHRASES: &[(&str, &str)] = &[
    ("it is important to note that", ""),
    ("it should be noted that", ""),
    ("it is worth mentioning that", ""),
    ("in spite of the fact that", "although"),
    ("due to the fact that", "because"),
    ("in the event that", "if"),
    ("at this point in time", "now"),
    ("as far as [^.!?]*? is concerned", "regarding"),
    ("with regard to", "regarding"),
    ("with respect to", "regarding"),
    ("in terms of", "regarding"),
];

static FILLERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    FILLER_WORDS
        .iter()
        .map(|word| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))).expect("valid regex"))
        .collect()
});

static PHRASES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    WORDY_PHRASES
        .iter()
        .map(|(phrase, replacement)| {
            (
                Regex::new(&format!("(?i){}", phrase)).expect("valid regex"),
                *replacement,
            )
        })
        .collect()
});

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Deterministic rewrite; returns the input unchanged when no rule applies
pub fn apply_rules(text: &str) -> String {
    let mut optimized = collapse_whitespace(text);
    optimized = SENTENCE_PUNCT.replace_all(&optimized, ".").into_owned();
    optimized = CLAUSE_PUNCT.replace_all(&optimized, ",").into_owned();

    for filler in FILLERS.iter() {
        optimized = filler.replace_all(&optimized, "").into_owned();
    }

    for (pattern, replacement) in PHRASES.iter() {
        optimized = pattern.replace_all(&optimized, *replacement).into_owned();
    }

    collapse_whitespace(&optimized)
}
