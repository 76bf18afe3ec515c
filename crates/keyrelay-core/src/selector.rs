//! Heuristic ranking of parallel answers to the same prompt.
//!
//! Scores are cheap text features (length band, closing punctuation, prompt
//! word overlap, lexical diversity). They order candidates; they are not
//! calibrated probabilities.

use std::collections::HashSet;

use crate::types::CompletionResponse;

/// Most alternatives kept next to the primary answer.
pub const MAX_ALTERNATIVES: usize = 2;

const MAX_LENGTH_SCORE: f64 = 3.0;
const MAX_COMPLETENESS_SCORE: f64 = 4.0;
const MAX_DIVERSITY_SCORE: f64 = 2.0;

/// Winner of a selection round.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub primary: CompletionResponse,
    pub alternatives: Vec<String>,
    pub confidence: f64,
}

/// Prompt words that count towards relevance: longer than three characters,
/// lowercased, stripped of surrounding punctuation, each counted once.
fn content_words(prompt: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    prompt
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.chars().count() > 3 && seen.insert(w.clone()))
        .collect()
}

fn length_score(len: usize) -> f64 {
    if (20..=200).contains(&len) {
        3.0
    } else if (10..=300).contains(&len) {
        2.0
    } else if (5..=500).contains(&len) {
        1.0
    } else {
        0.0
    }
}

fn completeness_score(text: &str, len: usize) -> f64 {
    let mut score = 0.0;
    if text.ends_with(['.', '!', '?']) {
        score += 2.0;
    }
    if len > 30 && !text.ends_with("...") {
        score += 2.0;
    }
    score
}

/// One point per prompt content word found inside any response word.
/// A word repeated in the prompt counts once.
fn relevance_score(words: &[String], prompt_words: &[String]) -> f64 {
    prompt_words
        .iter()
        .filter(|pw| words.iter().any(|w| w.contains(pw.as_str())))
        .count() as f64
}

fn diversity_score(words: &[String]) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let unique: HashSet<&String> = words.iter().collect();
    unique.len() as f64 / words.len() as f64 * 2.0
}

/// Score one answer against the prompt that produced it.
pub fn score_response(content: &str, prompt: &str) -> f64 {
    let text = content.trim();
    let len = text.chars().count();
    let words: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();

    length_score(len)
        + completeness_score(text, len)
        + relevance_score(&words, &content_words(prompt))
        + diversity_score(&words)
}

/// Best score any answer could reach for this prompt.
pub fn max_score(prompt: &str) -> f64 {
    MAX_LENGTH_SCORE + MAX_COMPLETENESS_SCORE + MAX_DIVERSITY_SCORE + content_words(prompt).len() as f64
}

/// Pick the highest scoring response. Ties go to the earliest one.
/// Returns `None` when there is nothing to choose from.
pub fn select_best(prompt: &str, responses: Vec<CompletionResponse>) -> Option<Selection> {
    let mut scored: Vec<(f64, CompletionResponse)> = responses
        .into_iter()
        .map(|r| (score_response(&r.content, prompt), r))
        .collect();
    // Stable sort keeps arrival order among equal scores.
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut ranked = scored.into_iter();
    let (best_score, primary) = ranked.next()?;

    let mut alternatives: Vec<String> = Vec::new();
    for (_, r) in ranked {
        if alternatives.len() == MAX_ALTERNATIVES {
            break;
        }
        if r.content != primary.content && !alternatives.contains(&r.content) {
            alternatives.push(r.content);
        }
    }

    let confidence = (best_score / max_score(prompt)).clamp(0.0, 1.0);
    Some(Selection {
        primary,
        alternatives,
        confidence,
    })
}
