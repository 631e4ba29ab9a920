//! Dimension assessors
//!
//! Each quality dimension is a tagged variant with its own scoring
//! heuristic. Every assessor returns a value in [0, 1] plus a data
//! availability indicator: a dimension with no signal reports the neutral
//! value and zero availability, lowering confidence instead of the score.

use crate::types::InteractionRecord;

/// Value reported when a dimension has no signal to work with
pub const NEUTRAL_VALUE: f64 = 0.5;

/// Phrases in the user input that suggest the previous answer landed well
const POSITIVE_FEEDBACK: &[&str] = &[
    "thanks",
    "thank you",
    "that worked",
    "perfect",
    "exactly what i needed",
    "great, now",
];

/// Phrases in the user input that suggest the assistant missed
const NEGATIVE_FEEDBACK: &[&str] = &[
    "no, that's wrong",
    "that's not what i meant",
    "that's incorrect",
    "you misunderstood",
    "try again",
    "still broken",
    "doesn't work",
    "not what i asked",
];

/// Failure markers scanned for when no tool trace is available
const OUTPUT_ERROR_MARKERS: &[&str] = &[
    "error:",
    "exception",
    "traceback",
    "panicked at",
    "command failed",
    "unable to complete",
];

/// One scored dimension
#[derive(Debug, Clone, Copy)]
pub struct DimensionScore {
    pub value: f64,
    pub availability: f64,
}

impl DimensionScore {
    fn observed(value: f64, availability: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            availability: availability.clamp(0.0, 1.0),
        }
    }

    fn no_signal() -> Self {
        Self {
            value: NEUTRAL_VALUE,
            availability: 0.0,
        }
    }
}

/// The five quality dimensions. Adding one means adding a variant here and
/// a weight entry in the configuration, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    UserSatisfaction,
    FunctionalCorrectness,
    CodeQuality,
    ContextRelevance,
    Efficiency,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::UserSatisfaction,
        Dimension::FunctionalCorrectness,
        Dimension::CodeQuality,
        Dimension::ContextRelevance,
        Dimension::Efficiency,
    ];

    pub fn assess(&self, record: &InteractionRecord) -> DimensionScore {
        match self {
            Dimension::UserSatisfaction => assess_user_satisfaction(record),
            Dimension::FunctionalCorrectness => assess_functional_correctness(record),
            Dimension::CodeQuality => assess_code_quality(record),
            Dimension::ContextRelevance => assess_context_relevance(record),
            Dimension::Efficiency => assess_efficiency(record),
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimension::UserSatisfaction => write!(f, "user_satisfaction"),
            Dimension::FunctionalCorrectness => write!(f, "functional_correctness"),
            Dimension::CodeQuality => write!(f, "code_quality"),
            Dimension::ContextRelevance => write!(f, "context_relevance"),
            Dimension::Efficiency => write!(f, "efficiency"),
        }
    }
}

fn assess_user_satisfaction(record: &InteractionRecord) -> DimensionScore {
    // Explicit rating beats any inference
    if let Some(rating) = record
        .context_snapshot
        .metadata
        .get("user_rating")
        .and_then(|r| r.parse::<u8>().ok())
        .filter(|r| (1..=5).contains(r))
    {
        return DimensionScore::observed((rating - 1) as f64 / 4.0, 1.0);
    }

    let input_lower = record.input.to_lowercase();
    if NEGATIVE_FEEDBACK.iter().any(|p| input_lower.contains(p)) {
        return DimensionScore::observed(0.2, 0.5);
    }
    if POSITIVE_FEEDBACK.iter().any(|p| input_lower.contains(p)) {
        return DimensionScore::observed(0.8, 0.5);
    }

    DimensionScore::no_signal()
}

fn assess_functional_correctness(record: &InteractionRecord) -> DimensionScore {
    if !record.tool_trace.is_empty() {
        let successes = record.tool_trace.iter().filter(|t| t.success).count();
        let ratio = successes as f64 / record.tool_trace.len() as f64;
        return DimensionScore::observed(ratio, 1.0);
    }

    let output_lower = record.output.to_lowercase();
    if OUTPUT_ERROR_MARKERS.iter().any(|m| output_lower.contains(m)) {
        return DimensionScore::observed(0.3, 0.4);
    }

    DimensionScore::no_signal()
}

fn assess_code_quality(record: &InteractionRecord) -> DimensionScore {
    let blocks = code_blocks(&record.output);
    if blocks.is_empty() {
        return DimensionScore::no_signal();
    }

    let mut value: f64 = 0.7;
    for block in &blocks {
        let lines = block.lines().count();
        if lines < 2 {
            value -= 0.1;
        }
        if block.contains("TODO") || block.contains("unimplemented!") {
            value -= 0.15;
        }
        if block.contains("//") || block.contains('#') {
            value += 0.05;
        }
        if !braces_balanced(block) {
            value -= 0.25;
        }
    }

    DimensionScore::observed(value, 0.7)
}

fn assess_context_relevance(record: &InteractionRecord) -> DimensionScore {
    if record.input.split_whitespace().count() < 3 || record.output.is_empty() {
        return DimensionScore::no_signal();
    }

    let overlap = word_overlap(&record.input, &record.output);
    // Raw overlap is rarely above ~0.4 even for on-topic answers
    let value = (0.2 + overlap * 2.0).min(1.0);
    DimensionScore::observed(value, 0.8)
}

fn assess_efficiency(record: &InteractionRecord) -> DimensionScore {
    if record.tool_trace.is_empty() {
        return DimensionScore::no_signal();
    }

    let total_ms: u64 = record.tool_trace.iter().map(|t| t.duration_ms).sum();
    let mut value = if total_ms < 2_000 {
        0.9
    } else if total_ms < 10_000 {
        0.6
    } else {
        0.3
    };

    // Repeated failures of the same tool indicate wasted work
    let failures = record.tool_trace.iter().filter(|t| !t.success).count();
    if failures >= 2 {
        value -= 0.2;
    }

    DimensionScore::observed(value, 0.9)
}

/// Extract fenced code blocks from markdown output
fn code_blocks(output: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = output;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let Some(body_start) = after.find('\n') else {
            break;
        };
        let body = &after[body_start + 1..];
        let Some(end) = body.find("```") else {
            break;
        };
        blocks.push(&body[..end]);
        rest = &body[end + 3..];
    }
    blocks
}

fn braces_balanced(block: &str) -> bool {
    let mut depth: i64 = 0;
    for c in block.chars() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0
}

/// Jaccard overlap of the word sets of two texts
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let a_words: std::collections::HashSet<String> = a
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > 2)
        .collect();
    let b_words: std::collections::HashSet<String> = b
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > 2)
        .collect();

    let union = a_words.union(&b_words).count();
    if union == 0 {
        return 0.0;
    }
    a_words.intersection(&b_words).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextSnapshot, ToolTraceEntry};
    use chrono::Utc;

    fn record_with(input: &str, output: &str) -> InteractionRecord {
        InteractionRecord {
            id: "r1".to_string(),
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            input: input.to_string(),
            output: output.to_string(),
            domain: "general".to_string(),
            context_snapshot: ContextSnapshot::default(),
            tool_trace: vec![],
        }
    }

    #[test]
    fn test_explicit_rating_wins() {
        let mut record = record_with("fix the bug", "done");
        record
            .context_snapshot
            .metadata
            .insert("user_rating".to_string(), "5".to_string());
        let score = Dimension::UserSatisfaction.assess(&record);
        assert_eq!(score.value, 1.0);
        assert_eq!(score.availability, 1.0);
    }

    #[test]
    fn test_no_signal_is_neutral() {
        let record = record_with("summarize this file", "it reads config values");
        let score = Dimension::UserSatisfaction.assess(&record);
        assert_eq!(score.value, NEUTRAL_VALUE);
        assert_eq!(score.availability, 0.0);
    }

    #[test]
    fn test_tool_trace_drives_correctness() {
        let mut record = record_with("run the tests", "all passing");
        record.tool_trace = vec![
            ToolTraceEntry {
                tool_name: "shell".to_string(),
                success: true,
                duration_ms: 120,
            },
            ToolTraceEntry {
                tool_name: "shell".to_string(),
                success: false,
                duration_ms: 80,
            },
        ];
        let score = Dimension::FunctionalCorrectness.assess(&record);
        assert!((score.value - 0.5).abs() < 1e-9);
        assert_eq!(score.availability, 1.0);
    }

    #[test]
    fn test_code_blocks_extraction() {
        let output = "Use this:\n```rust\nfn main() {}\n```\nand also\n```\nls -la\n```";
        assert_eq!(code_blocks(output).len(), 2);
    }

    #[test]
    fn test_unbalanced_code_penalized() {
        let good = record_with("write a function", "```rust\nfn a() { body() }\n```");
        let bad = record_with("write a function", "```rust\nfn a() { body()\n```");
        let good_score = Dimension::CodeQuality.assess(&good);
        let bad_score = Dimension::CodeQuality.assess(&bad);
        assert!(good_score.value > bad_score.value);
    }

    #[test]
    fn test_word_overlap_symmetric_range() {
        let overlap = word_overlap("parse the config file", "the config file parses fine");
        assert!(overlap > 0.0 && overlap <= 1.0);
        assert_eq!(word_overlap("", ""), 0.0);
    }
}
