//! Step/answer parsing for raw chain-of-thought completions.
//!
//! A completion is expected to contain lines such as `Step 1: ...` followed
//! by a closing `Answer: ...` line. Everything format-specific lives here;
//! the rest of the pipeline only sees the tagged [`ParsedChain`].

use regex::Regex;
use std::sync::LazyLock;

use crate::types::{Candidate, ParseStatus};

static STEP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s+)?step\s*(\d+)\s*[:.)]\s*(.*)$").expect("valid step regex")
});

static ANSWER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:final\s+answer|answer|conclusion)\s*:\s*(.*)$")
        .expect("valid answer regex")
});

/// Result of parsing one completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedChain {
    /// Steps plus an explicit answer marker.
    Steps { steps: Vec<String>, answer: String },
    /// Steps without an answer marker; the last step doubles as the answer.
    FallbackLastStep { steps: Vec<String> },
    /// No step markers at all.
    Failure,
}

impl ParsedChain {
    pub fn steps(&self) -> &[String] {
        match self {
            ParsedChain::Steps { steps, .. } | ParsedChain::FallbackLastStep { steps } => steps,
            ParsedChain::Failure => &[],
        }
    }

    pub fn status(&self) -> ParseStatus {
        match self {
            ParsedChain::Steps { .. } => ParseStatus::Parsed,
            ParsedChain::FallbackLastStep { .. } => ParseStatus::FallbackLastStep,
            ParsedChain::Failure => ParseStatus::Failed,
        }
    }

    /// Build the candidate, keeping the raw completion alongside.
    pub fn into_candidate(self, raw: String) -> Candidate {
        let parse_status = self.status();
        let (steps, answer) = match self {
            ParsedChain::Steps { steps, answer } => (steps, answer),
            ParsedChain::FallbackLastStep { steps } => {
                let answer = steps.last().cloned().unwrap_or_default();
                (steps, answer)
            }
            ParsedChain::Failure => (Vec::new(), String::new()),
        };
        Candidate {
            steps,
            answer,
            raw,
            parse_status,
        }
    }
}

enum Section {
    Preamble,
    Step,
    /// Answer marker seen with no text on its line.
    AnswerPending,
    /// Answer taken; further unmarked lines are commentary.
    Answered,
}

/// Parse a raw completion into steps and an answer.
///
/// Lines before the first marker are ignored. Unmarked lines continue the
/// current step. The answer is the text on its marker line (or the next line
/// when the marker stands alone); anything after it is ignored. When several
/// answer markers appear, the last non-empty one wins.
pub fn parse_chain(raw: &str) -> ParsedChain {
    let mut steps: Vec<String> = Vec::new();
    let mut answer: Option<String> = None;
    let mut section = Section::Preamble;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(caps) = STEP_LINE.captures(line) {
            steps.push(caps[2].trim().to_string());
            section = Section::Step;
        } else if let Some(caps) = ANSWER_LINE.captures(line) {
            let text = caps[1].trim();
            if text.is_empty() {
                section = Section::AnswerPending;
            } else {
                answer = Some(text.to_string());
                section = Section::Answered;
            }
        } else {
            match section {
                Section::Preamble | Section::Answered => {}
                Section::Step => {
                    if let Some(last) = steps.last_mut() {
                        append_line(last, trimmed);
                    }
                }
                Section::AnswerPending => {
                    answer = Some(trimmed.to_string());
                    section = Section::Answered;
                }
            }
        }
    }

    steps.retain(|s| !s.is_empty());
    if steps.is_empty() {
        return ParsedChain::Failure;
    }
    match answer {
        Some(answer) => ParsedChain::Steps { steps, answer },
        None => ParsedChain::FallbackLastStep { steps },
    }
}

/// Pull the answer out of a short re-derivation reply.
///
/// Uses the last answer marker if present, otherwise the first non-empty line.
pub fn extract_answer(text: &str) -> String {
    let marked = text
        .lines()
        .filter_map(|line| ANSWER_LINE.captures(line))
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .last();
    marked
        .or_else(|| {
            text.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

fn append_line(target: &mut String, line: &str) {
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(line);
}
