//! Deterministic offline backend.
//!
//! Produces step-by-step chains without a network (arithmetic questions are
//! actually computed), scores entailment by content-word overlap, and
//! classifies obfuscation with lexical heuristics. Every behavior can be
//! overridden for tests: fixed completions, a fixed re-derived answer, fixed
//! scores, injected failures, and an artificial delay.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{ModelBackend, REDERIVE_HEADER};
use crate::error::BackendError;
use crate::parser::parse_chain;

static ARITHMETIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*([-+*/x×])\s*(\d+)").expect("valid arithmetic regex")
});

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number regex"));

static HEDGES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(i think|i believe|i feel|i guess|it seems|it appears|it looks like|sort of|kind of|somewhat|rather)\b",
    )
    .expect("valid hedge regex")
});

static SELF_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(as an ai|as a language model|i cannot|i am not able|i don't have|i lack|i cannot provide)\b",
    )
    .expect("valid self-reference regex")
});

const EVASIVE_TERMS: &[&str] = &[
    "maybe",
    "might",
    "could",
    "possibly",
    "perhaps",
    "potentially",
    "unclear",
    "uncertain",
    "unsure",
    "vague",
    "ambiguous",
    "it depends",
    "hard to say",
    "difficult to determine",
];

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "and", "or", "is", "are", "was", "were", "be", "been", "to", "for",
    "in", "on", "at", "by", "with", "it", "its", "this", "that", "these", "those", "what",
    "which", "who", "as", "so", "therefore", "thus", "hence", "then", "we", "i", "you", "do",
    "does",
];

const NEGATIONS: &[&str] = &["not", "no", "never", "cannot", "isn't", "aren't", "doesn't", "don't"];

/// Which capability a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Generate,
    Entailment,
    Obfuscation,
}

#[derive(Debug, Default)]
struct CallCounts {
    generate: AtomicUsize,
    entailment: AtomicUsize,
    obfuscation: AtomicUsize,
}

/// Deterministic [`ModelBackend`] used by tests and the `mock` provider.
#[derive(Debug, Default)]
pub struct MockBackend {
    completions: Option<Vec<String>>,
    fixed_answer: Option<String>,
    entailment: Option<f64>,
    obfuscation: Option<f64>,
    failures: Vec<(Capability, BackendError)>,
    delay: Option<Duration>,
    calls: CallCounts,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return these completions (cycled) for chain prompts.
    pub fn with_completions<I, S>(mut self, completions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.completions = Some(completions.into_iter().map(Into::into).collect());
        self
    }

    /// Reply with this answer to every re-derivation prompt.
    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.fixed_answer = Some(answer.into());
        self
    }

    /// Score every entailment query with this value.
    pub fn with_entailment(mut self, score: f64) -> Self {
        self.entailment = Some(score);
        self
    }

    /// Score every obfuscation query with this value.
    pub fn with_obfuscation(mut self, score: f64) -> Self {
        self.obfuscation = Some(score);
        self
    }

    /// Fail every call to `capability` with `error`.
    pub fn with_failure(mut self, capability: Capability, error: BackendError) -> Self {
        self.failures.push((capability, error));
        self
    }

    /// Sleep before answering any call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls made to `capability` so far.
    pub fn calls(&self, capability: Capability) -> usize {
        let counter = match capability {
            Capability::Generate => &self.calls.generate,
            Capability::Entailment => &self.calls.entailment,
            Capability::Obfuscation => &self.calls.obfuscation,
        };
        counter.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.calls(Capability::Generate)
            + self.calls(Capability::Entailment)
            + self.calls(Capability::Obfuscation)
    }

    async fn enter(&self, capability: Capability) -> Result<(), BackendError> {
        let counter = match capability {
            Capability::Generate => &self.calls.generate,
            Capability::Entailment => &self.calls.entailment,
            Capability::Obfuscation => &self.calls.obfuscation,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.failures.iter().find(|(c, _)| *c == capability) {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn rederive(&self, prompt: &str) -> String {
        if let Some(answer) = &self.fixed_answer {
            return answer.clone();
        }
        let parsed = parse_chain(prompt);
        let steps = parsed.steps();
        let joined = steps.join(" ");
        if let Some(m) = NUMBER.find_iter(&joined).last() {
            return m.as_str().to_string();
        }
        steps
            .last()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, prompt: &str, n: usize) -> Result<Vec<String>, BackendError> {
        self.enter(Capability::Generate).await?;
        debug!(n, "Mock generating completions");

        if prompt.starts_with(REDERIVE_HEADER) {
            let answer = self.rederive(prompt);
            return Ok(vec![answer; n]);
        }

        if let Some(completions) = &self.completions
            && !completions.is_empty()
        {
            return Ok((0..n)
                .map(|i| completions[i % completions.len()].clone())
                .collect());
        }

        let question = question_line(prompt);
        Ok(vec![synthesize_chain(question); n])
    }

    async fn score_entailment(
        &self,
        premise: &str,
        hypothesis: &str,
    ) -> Result<f64, BackendError> {
        self.enter(Capability::Entailment).await?;
        Ok(self
            .entailment
            .unwrap_or_else(|| overlap_entailment(premise, hypothesis)))
    }

    async fn classify_obfuscation(&self, text: &str) -> Result<f64, BackendError> {
        self.enter(Capability::Obfuscation).await?;
        Ok(self
            .obfuscation
            .unwrap_or_else(|| lexical_obfuscation(text)))
    }

    fn supports_batch(&self) -> bool {
        true
    }
}

fn question_line(prompt: &str) -> &str {
    prompt
        .lines()
        .find_map(|line| line.trim().strip_prefix("Question:"))
        .map(str::trim)
        .unwrap_or_else(|| prompt.trim())
}

fn synthesize_chain(question: &str) -> String {
    if let Some(chain) = arithmetic_chain(question) {
        return chain;
    }
    let topic = content_words(question).join(" ");
    let topic = if topic.is_empty() {
        "the question".to_string()
    } else {
        topic
    };
    format!(
        "Step 1: The question is about {topic}.\n\
         Step 2: The known facts about {topic} settle the matter.\n\
         Step 3: Therefore the conclusion follows from the facts about {topic}.\n\
         Answer: {topic}"
    )
}

fn arithmetic_chain(question: &str) -> Option<String> {
    let caps = ARITHMETIC.captures(question)?;
    let a: i64 = caps[1].parse().ok()?;
    let b: i64 = caps[3].parse().ok()?;
    let (noun, verb, result) = match &caps[2] {
        "+" => ("sum", "Adding", a.checked_add(b)?.to_string()),
        "-" => ("difference", "Subtracting", a.checked_sub(b)?.to_string()),
        "*" | "x" | "×" => ("product", "Multiplying", a.checked_mul(b)?.to_string()),
        "/" if b != 0 => ("quotient", "Dividing", format_quotient(a, b)),
        _ => return None,
    };
    Some(format!(
        "Step 1: The question asks for the {noun} of {a} and {b}.\n\
         Step 2: {verb} {a} and {b} gives {result}.\n\
         Step 3: Therefore the result is {result}.\n\
         Answer: {result}"
    ))
}

fn format_quotient(a: i64, b: i64) -> String {
    if a % b == 0 {
        (a / b).to_string()
    } else {
        let q = a as f64 / b as f64;
        format!("{:.2}", q)
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(|t| t.trim_matches('\'').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn content_words(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens(text)
        .into_iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn has_negation(text: &str) -> bool {
    tokens(text).iter().any(|t| NEGATIONS.contains(&t.as_str()))
}

/// Content-word overlap entailment in `[0.4, 1.0]`, or `0.0` for a
/// contradiction (substantial overlap with mismatched negation).
pub fn overlap_entailment(premise: &str, hypothesis: &str) -> f64 {
    let hyp: HashSet<String> = content_words(hypothesis)
        .into_iter()
        .filter(|t| !NEGATIONS.contains(&t.as_str()))
        .collect();
    if hyp.is_empty() {
        return 0.5;
    }
    let prem: HashSet<String> = content_words(premise).into_iter().collect();
    let overlap = hyp.intersection(&prem).count() as f64 / hyp.len() as f64;

    if overlap >= 0.5 && has_negation(premise) != has_negation(hypothesis) {
        return 0.0;
    }
    round3(0.4 + 0.6 * overlap)
}

/// Lexical evasiveness score in `[0, 1]`.
pub fn lexical_obfuscation(text: &str) -> f64 {
    if text.trim().is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();

    let evasive = EVASIVE_TERMS.iter().filter(|w| lower.contains(*w)).count();
    let hedges = HEDGES.find_iter(&lower).count();
    let self_refs = SELF_REFERENCE.find_iter(&lower).count();

    let word_penalty = (evasive as f64 * 0.2).min(1.0);
    let hedge_penalty = (hedges as f64 * 0.15).min(1.0);
    let self_ref_penalty = (self_refs as f64 * 0.3).min(1.0);
    let length_penalty = if text.split_whitespace().count() < 10 {
        0.2
    } else {
        0.0
    };

    round3((word_penalty + hedge_penalty + self_ref_penalty + length_penalty).min(1.0))
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
