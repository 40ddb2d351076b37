//! Hallucination checks on model output for one page.
//!
//! Vision models occasionally fall into token loops ("g g g g g g",
//! "fixed points of E fixed points of E ...") or emit mostly non-text bytes.
//! [`verify_page`] looks for those signatures in order and reports the first
//! one found. A `<!-- Content merged with page N -->` marker is reported too,
//! but only as information: the text itself is usable.

use crate::config::VerificationConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// What verification found in a candidate page text.
#[derive(Debug, Clone, PartialEq)]
pub enum Finding {
    /// One letter repeated as separate tokens, e.g. `g g g g g`.
    SingleCharRepetition { token: String, run: usize },
    /// A short phrase looping back-to-back.
    PhraseRepetition { phrase: String, cycles: usize },
    /// Mostly non-ASCII or unprintable characters.
    GarbledText { ratio: f64 },
    /// Informational page-merge marker.
    ContentMerged { page: usize },
}

impl Finding {
    /// True for signatures that require the local extraction fallback.
    pub fn triggers_fallback(&self) -> bool {
        !matches!(self, Finding::ContentMerged { .. })
    }

    /// Short label written as `error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Finding::SingleCharRepetition { .. } | Finding::PhraseRepetition { .. } => {
                "repetition_hallucination"
            }
            Finding::GarbledText { .. } => "garbled_text",
            Finding::ContentMerged { .. } => "content_merged",
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::SingleCharRepetition { token, run } => {
                write!(f, "'{token}' repeated {run} times")
            }
            Finding::PhraseRepetition { phrase, cycles } => {
                write!(f, "'{phrase}' repeated {cycles} times")
            }
            Finding::GarbledText { ratio } => write!(f, "non-text ratio {:.1}%", ratio * 100.0),
            Finding::ContentMerged { page } => write!(f, "content merged with page {page}"),
        }
    }
}

static MERGED_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<!--\s*content merged with page\s+(\d+)\s*-->").expect("valid regex")
});

/// Classify `text`. `None` means the text is clean.
pub fn verify_page(text: &str, config: &VerificationConfig) -> Option<Finding> {
    single_char_repetition(text, config.char_run_threshold)
        .or_else(|| phrase_repetition(text, config.max_phrase_words, config.phrase_cycle_threshold))
        .or_else(|| garbled(text, config.garbled_min_chars, config.garbled_ratio))
        .or_else(|| content_merged(text))
}

fn single_char_repetition(text: &str, threshold: usize) -> Option<Finding> {
    longest_letter_run(text)
        .filter(|(_, run)| *run >= threshold.max(2))
        .map(|(token, run)| Finding::SingleCharRepetition {
            token: token.to_string(),
            run,
        })
}

fn longest_letter_run(text: &str) -> Option<(&str, usize)> {
    let mut best: Option<(&str, usize)> = None;
    let mut current: Option<(&str, usize)> = None;
    for token in text.split_whitespace() {
        let is_letter = token.len() == 1 && token.chars().all(|c| c.is_ascii_alphabetic());
        current = match current {
            Some((t, n)) if is_letter && t == token => Some((t, n + 1)),
            _ if is_letter => Some((token, 1)),
            _ => None,
        };
        if let Some((t, n)) = current {
            if best.map_or(true, |(_, b)| n > b) {
                best = Some((t, n));
            }
        }
    }
    best
}

static WORD_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\S+)(\s*)").expect("valid regex"));

/// Loops of 1..=`max_words` plain words (`\w+` followed by whitespace).
///
/// A token carrying any non-word character (`|`, `&`, `\\`, `=`) ends the
/// run, so table and matrix rows with repeated cells are not loops.
fn phrase_repetition(text: &str, max_words: usize, threshold: usize) -> Option<Finding> {
    let threshold = threshold.max(2);
    let mut segment: Vec<String> = Vec::new();
    for caps in WORD_TOKEN.captures_iter(text) {
        let word = &caps[1];
        let followed_by_space = !caps[2].is_empty();
        if followed_by_space && word.chars().all(|c| c.is_alphanumeric() || c == '_') {
            segment.push(word.to_lowercase());
            continue;
        }
        if let Some(found) = repeated_unit(&segment, max_words, threshold) {
            return Some(found);
        }
        segment.clear();
    }
    repeated_unit(&segment, max_words, threshold)
}

fn repeated_unit(words: &[String], max_words: usize, threshold: usize) -> Option<Finding> {
    for n in 1..=max_words.max(1) {
        if n * threshold > words.len() {
            break;
        }
        for start in 0..=(words.len() - n * threshold) {
            let unit = &words[start..start + n];
            let mut cycles = 1;
            while start + (cycles + 1) * n <= words.len()
                && &words[start + cycles * n..start + (cycles + 1) * n] == unit
            {
                cycles += 1;
            }
            if cycles >= threshold {
                return Some(Finding::PhraseRepetition {
                    phrase: unit.join(" "),
                    cycles,
                });
            }
        }
    }
    None
}

fn garbled(text: &str, min_chars: usize, max_ratio: f64) -> Option<Finding> {
    let total = text.chars().count();
    if total <= min_chars {
        return None;
    }
    let bad = text
        .chars()
        .filter(|&c| !c.is_ascii() || (c.is_control() && !matches!(c, '\n' | '\t' | '\r')))
        .count();
    let ratio = bad as f64 / total as f64;
    (ratio > max_ratio).then_some(Finding::GarbledText { ratio })
}

fn content_merged(text: &str) -> Option<Finding> {
    let caps = MERGED_MARKER.captures(text)?;
    let page = caps.get(1)?.as_str().parse().ok()?;
    Some(Finding::ContentMerged { page })
}
