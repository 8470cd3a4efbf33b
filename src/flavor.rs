//! Cosmetic post-processing of model answers.
//!
//! Two independent steps.  Opener/closer injection varies the tone between
//! turns.  Paragraph reflow breaks long single-block answers into groups of
//! three sentences.  Neither step affects content, and the random source is
//! seedable so output is reproducible under test.

use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;

pub const OPENERS: &[&str] = &[
    "Great question!",
    "Happy to help.",
    "Sure thing.",
    "Good one.",
    "Glad you asked.",
];

pub const CLOSERS: &[&str] = &[
    "Anything else you'd like to know?",
    "Hope that helps!",
    "Feel free to ask a follow-up.",
    "Happy to go deeper on any of that.",
];

const OPENER_PROBABILITY: f64 = 0.6;
const CLOSER_PROBABILITY: f64 = 0.8;

const SENTENCES_PER_PARAGRAPH: usize = 3;
const MIN_SENTENCES_TO_REFLOW: usize = 4;

static BLANK_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n").unwrap());

/// Prepend an opener (p = 0.6), otherwise append a closer (p = 0.8 of the
/// remainder), otherwise return the text unchanged.
pub fn add_flavor<R: Rng>(text: &str, rng: &mut R) -> String {
    if rng.random_bool(OPENER_PROBABILITY) {
        if let Some(opener) = OPENERS.choose(rng) {
            return format!("{opener} {text}");
        }
    } else if rng.random_bool(CLOSER_PROBABILITY) {
        if let Some(closer) = CLOSERS.choose(rng) {
            return format!("{text} {closer}");
        }
    }
    text.to_string()
}

fn opens_sentence(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '"' | '\'' | '(' | '[' | '“' | '‘')
}

/// Split on sentence-ending punctuation followed by whitespace and an
/// uppercase letter, digit, or opening quote or bracket.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        let (idx, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            if j > i + 1 && j < chars.len() && opens_sentence(chars[j].1) {
                let sentence = text[start..idx + c.len_utf8()].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = chars[j].0;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Regroup a single-block answer into paragraphs of three sentences.  Text
/// that already has a blank line, or has fewer than four sentences, is only
/// trimmed.
pub fn reflow_paragraphs(text: &str) -> String {
    let trimmed = text.trim();
    if BLANK_LINE_RE.is_match(trimmed) {
        return trimmed.to_string();
    }
    let sentences = split_sentences(trimmed);
    if sentences.len() < MIN_SENTENCES_TO_REFLOW {
        return trimmed.to_string();
    }
    sentences
        .chunks(SENTENCES_PER_PARAGRAPH)
        .map(|group| group.join(" "))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Applies flavor injection then paragraph reflow, sharing one seedable RNG.
pub struct Flavorer {
    inject: bool,
    rng: Mutex<StdRng>,
}

impl Flavorer {
    /// `seed` of `None` seeds from the operating system.
    pub fn new(inject: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            inject,
            rng: Mutex::new(rng),
        }
    }

    pub fn apply(&self, raw: &str) -> String {
        let flavored = if self.inject {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            add_flavor(raw.trim(), &mut *rng)
        } else {
            raw.trim().to_string()
        };
        reflow_paragraphs(&flavored)
    }
}
