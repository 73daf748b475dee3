//! Topic detection and textual similarity for duplicate convergence
//!
//! When no embedding provider is available, candidate memories are matched
//! by a regex topic detector over `my <attr> is <value>` and
//! `I <verb> <object>` shapes, then scored with a textual blend.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::types::Memory;

// "my favorite color is blue" -> topic "favorite color"
static ATTR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^my\s+((?:[a-z]+\s+){0,3}?[a-z]+)\s+(?:is|are)\s+(.+)$").unwrap()
});

// "I like deep dish pizza" -> topic "like deep dish pizza"
static VERB_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^i\s+(?:really\s+|also\s+)?(like|love|prefer|enjoy|hate|dislike|use|want|need)\s+(.+)$")
        .unwrap()
});

static UPDATE_CUES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["now", "changed", "updated", "instead", "no longer", "anymore", "switched"]
});

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract the topic of a statement, if it has a recognizable shape
pub fn detect_topic(content: &str) -> Option<String> {
    let trimmed = content.trim().trim_end_matches(['.', '!']);

    if let Some(caps) = ATTR_PATTERN.captures(trimmed) {
        return Some(normalize(&caps[1]));
    }
    if let Some(caps) = VERB_PATTERN.captures(trimmed) {
        let object = normalize(&caps[2]);
        let verb = caps[1].to_lowercase();
        if !object.is_empty() {
            return Some(format!("{verb} {object}"));
        }
    }
    None
}

fn word_set(text: &str) -> HashSet<String> {
    normalize(text).split_whitespace().map(|w| w.to_string()).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Textual similarity: exact = 1.0, containment = 0.9, else a blend of
/// keyword Jaccard (0.7) and length ratio (0.3)
pub fn text_similarity(a: &str, b: &str) -> f32 {
    let na = normalize(a);
    let nb = normalize(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }
    if na.contains(&nb) || nb.contains(&na) {
        return 0.9;
    }

    let keywords = jaccard(&word_set(a), &word_set(b));
    let len_a = na.chars().count() as f32;
    let len_b = nb.chars().count() as f32;
    let length_ratio = len_a.min(len_b) / len_a.max(len_b);
    0.7 * keywords + 0.3 * length_ratio
}

/// An unfinished statement, e.g. "my favorite color" with no value.
/// These are filtered out of recall results.
pub fn is_incomplete(content: &str) -> bool {
    let trimmed = normalize(content);
    if trimmed.is_empty() {
        return false;
    }
    if !trimmed.starts_with("my ") {
        return false;
    }
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    // "my favorite color is" trails off; "my favorite color" never arrives
    match words.iter().position(|w| *w == "is" || *w == "are") {
        Some(pos) => pos == words.len() - 1,
        None => words.len() <= 4,
    }
}

fn has_update_language(content: &str) -> bool {
    let lower = content.to_lowercase();
    UPDATE_CUES.iter().any(|cue| lower.contains(cue))
}

/// Between two duplicates, decide which memory survives.
/// Order: tier, then update language, then a clear priority gap, then
/// recency.
pub fn should_keep<'a>(a: &'a Memory, b: &'a Memory) -> &'a Memory {
    if a.tier.rank() != b.tier.rank() {
        return if a.tier.rank() < b.tier.rank() { a } else { b };
    }

    let a_update = has_update_language(&a.content);
    let b_update = has_update_language(&b.content);
    if a_update != b_update {
        return if a_update { a } else { b };
    }

    if (a.priority - b.priority).abs() >= 0.1 {
        return if a.priority > b.priority { a } else { b };
    }

    if a.updated_at >= b.updated_at {
        a
    } else {
        b
    }
}
