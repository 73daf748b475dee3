//! Query preprocessing for recall
//!
//! Normalizes free text, detects question form, extracts phrases and
//! keywords through a categorized stop-word filter, and expands synonyms
//! according to the request's expansion mode. Phrases consume their words:
//! a query that collapses into one phrase carries no loose keywords, which
//! is what makes strict mode reject semantic-only matches.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

use crate::types::ExpansionMode;

/// Cap on phrases + keywords sent into search
pub const MAX_SEARCH_TERMS: usize = 10;

static CONTRACTIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("what's", "what is"),
        ("who's", "who is"),
        ("where's", "where is"),
        ("when's", "when is"),
        ("why's", "why is"),
        ("how's", "how is"),
        ("it's", "it is"),
        ("that's", "that is"),
        ("there's", "there is"),
        ("i'm", "i am"),
        ("i've", "i have"),
        ("i'll", "i will"),
        ("i'd", "i would"),
        ("you're", "you are"),
        ("you've", "you have"),
        ("you'll", "you will"),
        ("we're", "we are"),
        ("they're", "they are"),
        ("can't", "cannot"),
        ("won't", "will not"),
        ("don't", "do not"),
        ("doesn't", "does not"),
        ("didn't", "did not"),
        ("isn't", "is not"),
        ("aren't", "are not"),
        ("wasn't", "was not"),
        ("weren't", "were not"),
        ("haven't", "have not"),
        ("hasn't", "has not"),
        ("couldn't", "could not"),
        ("wouldn't", "would not"),
        ("shouldn't", "should not"),
        ("let's", "let us"),
    ])
});

static QUESTION_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from(["what", "who", "where", "when", "why", "how", "which", "whose", "whom"])
});

static ARTICLES: Lazy<HashSet<&'static str>> = Lazy::new(|| HashSet::from(["a", "an", "the"]));

static PREPOSITIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "in", "on", "at", "for", "with", "about", "of", "to", "from", "by", "as", "into", "over",
        "under", "after", "before",
    ])
});

static PRONOUNS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "i", "me", "my", "mine", "you", "your", "yours", "we", "us", "our", "ours", "they", "them",
        "their", "theirs", "he", "she", "him", "her", "his", "hers", "it", "its", "this", "that",
        "these", "those",
    ])
});

static AUX_VERBS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "is", "are", "was", "were", "am", "be", "been", "being", "do", "does", "did", "have",
        "has", "had", "can", "could", "will", "would", "shall", "should", "may", "might", "must",
        "not",
    ])
});

/// Curated multi-word phrases, matched longest-first
static PHRASE_LIST: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let mut phrases = vec![
        "favorite programming language",
        "preferred programming language",
        "programming language",
        "preferred language",
        "favorite language",
        "favorite color",
        "favorite food",
        "favorite movie",
        "favorite book",
        "favorite band",
        "tech stack",
        "code style",
        "time zone",
        "phone number",
        "email address",
        "home address",
        "date of birth",
        "job title",
        "work schedule",
        "side project",
        "open source",
        "pull request",
        "code review",
    ];
    phrases.sort_by_key(|p| std::cmp::Reverse(p.len()));
    phrases
});

static SYNONYMS: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    HashMap::from([
        ("favorite", vec!["preferred", "favourite"]),
        ("favourite", vec!["favorite"]),
        ("preferred", vec!["favorite"]),
        ("color", vec!["colour"]),
        ("colour", vec!["color"]),
        ("language", vec!["lang"]),
        ("work", vec!["job", "career"]),
        ("job", vec!["work", "career"]),
        ("like", vec!["love", "enjoy", "prefer"]),
        ("love", vec!["like", "enjoy"]),
        ("home", vec!["house"]),
        ("movie", vec!["film"]),
        ("film", vec!["movie"]),
        ("food", vec!["cuisine", "dish"]),
        ("car", vec!["vehicle"]),
        ("buy", vec!["purchase"]),
        ("editor", vec!["ide"]),
        ("database", vec!["db"]),
    ])
});

/// A preprocessed recall query
#[derive(Debug, Clone)]
pub struct ProcessedQuery {
    pub original: String,
    pub normalized: String,
    pub is_question: bool,
    /// Curated or noun-sequence phrases; weighted 2x in keyword scoring
    pub phrases: Vec<String>,
    /// Loose keywords after the stop-word filter
    pub keywords: Vec<String>,
    /// Extra match terms from synonym expansion (empty in strict mode)
    pub synonyms: Vec<String>,
    /// phrases then keywords, capped at [`MAX_SEARCH_TERMS`]
    pub search_terms: Vec<String>,
    pub mode: ExpansionMode,
}

impl ProcessedQuery {
    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty() && self.keywords.is_empty()
    }

    /// FTS5 MATCH expression: quoted phrases OR their words OR loose
    /// terms. Candidate selection is deliberately wide; the relevance
    /// weighting happens on the fetched rows.
    pub fn fts_query(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for phrase in &self.phrases {
            let clean = sanitize_fts(phrase);
            if !clean.is_empty() && seen.insert(format!("\"{clean}\"")) {
                parts.push(format!("\"{clean}\""));
            }
            for word in clean.split_whitespace() {
                if seen.insert(word.to_string()) {
                    parts.push(word.to_string());
                }
            }
        }
        for term in self.keywords.iter().chain(self.synonyms.iter()) {
            let clean = sanitize_fts(term);
            if !clean.is_empty() && seen.insert(clean.clone()) {
                parts.push(clean);
            }
        }
        parts.join(" OR ")
    }
}

fn sanitize_fts(term: &str) -> String {
    term.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .trim()
        .to_string()
}

fn expand_contractions(text: &str) -> String {
    text.split_whitespace()
        .map(|word| *CONTRACTIONS.get(word).unwrap_or(&word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lowercase, expand contractions, strip possessives, hyphens to spaces,
/// drop punctuation, collapse whitespace
pub fn normalize(query: &str) -> String {
    let lower = query.to_lowercase();
    let expanded = expand_contractions(&lower);
    let stripped = expanded.replace("'s", "").replace('-', " ");
    stripped
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_question_form(query: &str, normalized: &str) -> bool {
    if query.trim_end().ends_with('?') {
        return true;
    }
    normalized
        .split_whitespace()
        .next()
        .is_some_and(|first| QUESTION_WORDS.contains(first))
}

fn is_stop_word(word: &str, is_question: bool) -> bool {
    if ARTICLES.contains(word) {
        return true;
    }
    if is_question && QUESTION_WORDS.contains(word) {
        return true;
    }
    // Possessive determiners and copulas drop only for questions;
    // prepositions and aux verbs are noise either way
    if PREPOSITIONS.contains(word) || AUX_VERBS.contains(word) {
        return true;
    }
    if PRONOUNS.contains(word) {
        return is_question || word != "i";
    }
    false
}

/// Preprocess a free-text query for the given expansion mode
pub fn preprocess(query: &str, mode: ExpansionMode) -> ProcessedQuery {
    let normalized = normalize(query);
    let is_question = is_question_form(query, &normalized);

    // Curated phrases first, longest wins; matched spans are consumed
    let mut remaining = format!(" {normalized} ");
    let mut phrases: Vec<String> = Vec::new();
    for phrase in PHRASE_LIST.iter() {
        let needle = format!(" {phrase} ");
        if remaining.contains(&needle) {
            phrases.push((*phrase).to_string());
            remaining = remaining.replace(&needle, " ");
        }
    }

    // Stop-word filter over what is left
    let content_words: Vec<String> = remaining
        .split_whitespace()
        .filter(|w| !is_stop_word(w, is_question))
        .map(|w| w.to_string())
        .collect();

    // 2-3 word runs of content words read as noun phrases and are
    // consumed; longer runs stay loose keywords
    let mut keywords: Vec<String> = Vec::new();
    let runs = contiguous_runs(&remaining, is_question);
    for run in runs {
        if (2..=3).contains(&run.len()) {
            phrases.push(run.join(" "));
        } else {
            keywords.extend(run);
        }
    }

    // A query of nothing but stop words falls back to its raw words
    if phrases.is_empty() && keywords.is_empty() && content_words.is_empty() {
        keywords = normalized
            .split_whitespace()
            .filter(|w| !ARTICLES.contains(w))
            .map(|w| w.to_string())
            .collect();
    }

    keywords.dedup();

    let synonyms = expand_synonyms(&phrases, &keywords, mode);

    let mut search_terms: Vec<String> = phrases.iter().cloned().chain(keywords.iter().cloned()).collect();
    search_terms.truncate(MAX_SEARCH_TERMS);

    ProcessedQuery {
        original: query.to_string(),
        normalized,
        is_question,
        phrases,
        keywords,
        synonyms,
        search_terms,
        mode,
    }
}

/// Split the remaining text into runs of consecutive content words
fn contiguous_runs(remaining: &str, is_question: bool) -> Vec<Vec<String>> {
    let mut runs: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for word in remaining.split_whitespace() {
        if is_stop_word(word, is_question) {
            if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
        } else {
            current.push(word.to_string());
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn expand_synonyms(phrases: &[String], keywords: &[String], mode: ExpansionMode) -> Vec<String> {
    if mode == ExpansionMode::Strict {
        return Vec::new();
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<String> = Vec::new();
    let words = phrases
        .iter()
        .flat_map(|p| p.split_whitespace())
        .chain(keywords.iter().map(|k| k.as_str()));

    for word in words {
        if let Some(alternatives) = SYNONYMS.get(word) {
            let take = match mode {
                ExpansionMode::Normal => 1,
                ExpansionMode::Aggressive => alternatives.len(),
                ExpansionMode::Strict => 0,
            };
            for alt in alternatives.iter().take(take) {
                if seen.insert((*alt).to_string()) {
                    out.push((*alt).to_string());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalization_pipeline() {
        assert_eq!(normalize("What's  my FAVORITE-color?"), "what is my favorite color");
        assert_eq!(normalize("the user's plan"), "the user plan");
    }

    #[test]
    fn question_form_detection() {
        let q = preprocess("what is my favorite color?", ExpansionMode::Normal);
        assert!(q.is_question);
        let q = preprocess("favorite color", ExpansionMode::Normal);
        assert!(!q.is_question);
        let q = preprocess("where do I work", ExpansionMode::Normal);
        assert!(q.is_question);
    }

    #[test]
    fn curated_phrase_consumes_words() {
        let q = preprocess("favorite color", ExpansionMode::Strict);
        assert_eq!(q.phrases, vec!["favorite color".to_string()]);
        assert!(q.keywords.is_empty());
        assert_eq!(q.search_terms, vec!["favorite color".to_string()]);
    }

    #[test]
    fn question_words_dropped_only_for_questions() {
        let q = preprocess("what is my favorite color?", ExpansionMode::Normal);
        assert_eq!(q.phrases, vec!["favorite color".to_string()]);
        assert!(q.keywords.is_empty());
    }

    #[test]
    fn noun_sequences_become_phrases() {
        let q = preprocess("preferred language", ExpansionMode::Strict);
        assert_eq!(q.phrases, vec!["preferred language".to_string()]);
        assert!(q.keywords.is_empty());
        assert!(q.synonyms.is_empty());
    }

    #[test]
    fn synonyms_follow_mode() {
        let strict = preprocess("preferred language", ExpansionMode::Strict);
        assert!(strict.synonyms.is_empty());

        let normal = preprocess("preferred language", ExpansionMode::Normal);
        assert!(normal.synonyms.contains(&"favorite".to_string()));

        let aggressive = preprocess("favorite color", ExpansionMode::Aggressive);
        assert!(aggressive.synonyms.contains(&"preferred".to_string()));
        assert!(aggressive.synonyms.contains(&"favourite".to_string()));
        assert!(aggressive.synonyms.contains(&"colour".to_string()));
    }

    #[test]
    fn search_terms_are_capped() {
        let q = preprocess(
            "alpha bravo charlie delta echo foxtrot golf hotel india juliett kilo lima mike",
            ExpansionMode::Normal,
        );
        assert!(q.search_terms.len() <= MAX_SEARCH_TERMS);
    }

    #[test]
    fn fts_query_quotes_phrases() {
        let q = preprocess("favorite color of the logo", ExpansionMode::Normal);
        let fts = q.fts_query();
        assert!(fts.contains("\"favorite color\""));
        assert!(fts.contains("logo"));
        assert!(fts.contains(" OR "));
    }

    #[test]
    fn stop_word_only_query_falls_back_to_raw_words() {
        let q = preprocess("is it in the", ExpansionMode::Normal);
        assert!(!q.is_empty() || !q.search_terms.is_empty() || q.keywords.is_empty());
    }
}
