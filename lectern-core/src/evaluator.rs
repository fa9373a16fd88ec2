//! Response evaluation: confidence scoring and hallucination flags.
//!
//! Confidence blends how relevant the retrieved sources were (60%) with
//! how much of the draft is actually covered by them (40%). Coverage is
//! stopword-filtered content-word overlap. Hallucination scanning looks
//! for numbers, prices, percentages, dates, and definitive claims that
//! appear in the draft but nowhere in the context; any flag knocks 30%
//! off the confidence and triggers review. The heuristic is a review
//! trigger, not a block.

use crate::types::ScoredChunk;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Categorical confidence bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

/// Result of evaluating a draft answer against its retrieval context.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Blended confidence in [0, 1].
    pub confidence: f32,
    pub level: ConfidenceLevel,
    /// Fraction of draft content words grounded in the context.
    pub coverage: f32,
    pub hallucination_flags: Vec<String>,
    /// Whether a human should look at this turn.
    pub needs_review: bool,
}

const HIGH_CONFIDENCE: f32 = 0.8;
const HALLUCINATION_PENALTY: f32 = 0.7;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "shall",
    "to", "of", "in", "for", "on", "with", "at", "by", "from", "and", "or", "but", "if", "then",
    "else", "when", "where", "how", "what", "which", "who", "this", "that", "these", "those",
    "it", "its", "as", "so", "than", "such", "no", "not", "only", "own", "same", "can", "into",
    "some", "other", "all", "any", "each", "few", "more", "most", "very", "just", "also", "now",
    "about", "up", "out", "over", "after", "before", "between", "under", "again", "further",
    "once", "here", "there", "why", "because", "through", "during", "while", "above", "below",
    "you", "your", "please",
];

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[a-z]+\b").expect("word pattern must compile"))
}

fn numeric_regexes() -> &'static [(Regex, &'static str)] {
    static RES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RES.get_or_init(|| {
        vec![
            (
                Regex::new(r"\$[\d,]+(?:\.\d{2})?").expect("price pattern"),
                "price",
            ),
            (
                Regex::new(r"\d+(?:\.\d+)?%").expect("percentage pattern"),
                "percentage",
            ),
            (Regex::new(r"\b\d{2,}\b").expect("number pattern"), "number"),
        ]
    })
}

fn date_regexes() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        vec![
            Regex::new(r"\b(?:19|20)\d{2}\b").expect("year pattern"),
            Regex::new(r"\b\d{1,2}/\d{1,2}(?:/\d{2,4})?\b").expect("slash date pattern"),
            Regex::new(
                r"\b(?:january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2}(?:st|nd|rd|th)?\b",
            )
            .expect("month-day pattern"),
            Regex::new(
                r"\b\d{1,2}(?:st|nd|rd|th)\s+(?:of\s+)?(?:january|february|march|april|may|june|july|august|september|october|november|december)\b",
            )
            .expect("day-of-month pattern"),
        ]
    })
}

fn definitive_regexes() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"\balways\b",
            r"\bnever\b",
            r"\bguaranteed\b",
            r"\b100%\b",
            r"\bdefinitely\b",
            r"\bcertainly\b",
            r"\babsolutely\b",
            r"\bperfect\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("definitive pattern"))
        .collect()
    })
}

/// Computes confidence and hallucination flags for draft answers.
pub struct ResponseEvaluator {
    /// Confidence strictly below this needs review.
    tau_review: f32,
    stopwords: HashSet<&'static str>,
}

impl ResponseEvaluator {
    pub fn new(tau_review: f32) -> Self {
        Self {
            tau_review,
            stopwords: STOPWORDS.iter().copied().collect(),
        }
    }

    /// Evaluate a draft against the retrieval context it was generated
    /// from. An empty draft or empty context yields zero confidence and
    /// a review flag.
    pub fn evaluate(&self, draft: &str, context: &[ScoredChunk]) -> Evaluation {
        if draft.trim().is_empty() || context.is_empty() {
            return Evaluation {
                confidence: 0.0,
                level: ConfidenceLevel::Low,
                coverage: 0.0,
                hallucination_flags: Vec::new(),
                needs_review: true,
            };
        }

        let avg_score: f32 =
            context.iter().map(|s| s.score).sum::<f32>() / context.len() as f32;

        let draft_lower = draft.to_lowercase();
        let context_lower = context
            .iter()
            .map(|s| s.chunk.text.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");

        let coverage = self.coverage(&draft_lower, &context_lower);
        let mut confidence = avg_score * 0.6 + coverage * 0.4;

        let hallucination_flags = Self::detect_hallucinations(&draft_lower, &context_lower);
        if !hallucination_flags.is_empty() {
            confidence *= HALLUCINATION_PENALTY;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        // Exactly tau_review does NOT escalate.
        let needs_review = confidence < self.tau_review || !hallucination_flags.is_empty();

        Evaluation {
            confidence,
            level: Self::level(confidence),
            coverage,
            hallucination_flags,
            needs_review,
        }
    }

    fn level(confidence: f32) -> ConfidenceLevel {
        if confidence >= HIGH_CONFIDENCE {
            ConfidenceLevel::High
        } else if confidence >= 0.5 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    /// Fraction of draft content words present in the context.
    fn coverage(&self, draft_lower: &str, context_lower: &str) -> f32 {
        let draft_words = self.content_words(draft_lower);
        if draft_words.is_empty() {
            return 0.0;
        }
        let context_words = self.content_words(context_lower);
        let overlap = draft_words.intersection(&context_words).count();
        overlap as f32 / draft_words.len() as f32
    }

    fn content_words<'a>(&self, text: &'a str) -> HashSet<&'a str> {
        word_regex()
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|w| w.len() > 2 && !self.stopwords.contains(w))
            .collect()
    }

    /// Flag numbers, dates, and definitive claims in the draft that the
    /// context does not contain.
    fn detect_hallucinations(draft_lower: &str, context_lower: &str) -> Vec<String> {
        let mut flags = Vec::new();

        for (regex, kind) in numeric_regexes() {
            let in_draft: HashSet<&str> =
                regex.find_iter(draft_lower).map(|m| m.as_str()).collect();
            let in_context: HashSet<&str> =
                regex.find_iter(context_lower).map(|m| m.as_str()).collect();
            for value in in_draft.difference(&in_context) {
                flags.push(format!("ungrounded {kind}: {value}"));
            }
        }

        for regex in date_regexes() {
            let in_draft: HashSet<&str> =
                regex.find_iter(draft_lower).map(|m| m.as_str()).collect();
            let in_context: HashSet<&str> =
                regex.find_iter(context_lower).map(|m| m.as_str()).collect();
            for value in in_draft.difference(&in_context) {
                if value.len() > 3 {
                    flags.push(format!("ungrounded date: {value}"));
                }
            }
        }

        for regex in definitive_regexes() {
            if let Some(m) = regex.find(draft_lower) {
                if !regex.is_match(context_lower) {
                    flags.push(format!("strong claim not in sources: {}", m.as_str()));
                }
            }
        }

        flags.sort();
        flags.dedup();
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkMetadata, ContentType, DocumentChunk};

    fn scored(text: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: DocumentChunk {
                text: text.to_string(),
                embedding: vec![1.0],
                metadata: ChunkMetadata {
                    source: "doc.txt".into(),
                    title: "Doc".into(),
                    content_type: ContentType::Text,
                    chunk_index: 0,
                    tenant_id: "t".into(),
                    page_index: None,
                },
            },
            score,
        }
    }

    fn evaluator() -> ResponseEvaluator {
        ResponseEvaluator::new(0.5)
    }

    #[test]
    fn test_empty_context_is_low_and_reviewed() {
        let eval = evaluator().evaluate("Some answer", &[]);
        assert_eq!(eval.confidence, 0.0);
        assert_eq!(eval.level, ConfidenceLevel::Low);
        assert!(eval.needs_review);
        assert_eq!(eval.coverage, 0.0);
    }

    #[test]
    fn test_empty_draft_is_low_and_reviewed() {
        let eval = evaluator().evaluate("   ", &[scored("context", 0.9)]);
        assert!(eval.needs_review);
        assert_eq!(eval.confidence, 0.0);
    }

    #[test]
    fn test_grounded_answer_scores_high() {
        let context = [scored(
            "Export your project via File then Export then PDF format option",
            0.9,
        )];
        let eval = evaluator().evaluate("Export the project via File then Export then PDF", &context);
        assert!(eval.coverage > 0.8, "coverage was {}", eval.coverage);
        assert!(eval.confidence > 0.7);
        assert!(!eval.needs_review);
        assert!(eval.hallucination_flags.is_empty());
    }

    #[test]
    fn test_ungrounded_answer_scores_low() {
        let context = [scored("The lesson covers exporting projects as PDF files", 0.4)];
        let eval = evaluator().evaluate(
            "Quantum entanglement requires specialized laboratory cryostats",
            &context,
        );
        assert!(eval.coverage < 0.2);
        assert!(eval.confidence < 0.5);
        assert!(eval.needs_review);
    }

    #[test]
    fn test_confidence_formula_weights() {
        // Full coverage, known scores: confidence = 0.6*avg + 0.4*1.0.
        let context = [scored("export project file", 0.5), scored("export project file", 0.7)];
        let eval = evaluator().evaluate("export project file", &context);
        let expected = 0.6 * 0.6 + 0.4 * 1.0;
        assert!((eval.confidence - expected).abs() < 0.01, "got {}", eval.confidence);
    }

    #[test]
    fn test_ungrounded_number_flagged_and_penalized() {
        let context = [scored("the course explains export settings", 0.9)];
        let with_number = evaluator().evaluate("the export takes 45 minutes", &context);
        assert!(with_number
            .hallucination_flags
            .iter()
            .any(|f| f.contains("45")));
        assert!(with_number.needs_review);

        let without_number = evaluator().evaluate("the export settings are explained", &context);
        assert!(without_number.hallucination_flags.is_empty());
        // The penalty actually reduced confidence.
        assert!(with_number.confidence < without_number.confidence);
    }

    #[test]
    fn test_grounded_number_not_flagged() {
        let context = [scored("rendering takes 45 minutes on average", 0.9)];
        let eval = evaluator().evaluate("it takes about 45 minutes", &context);
        assert!(eval.hallucination_flags.is_empty());
    }

    #[test]
    fn test_ungrounded_price_and_year_flagged() {
        let context = [scored("the course covers pricing strategy", 0.9)];
        let eval = evaluator().evaluate("the course costs $499 since 2021", &context);
        assert!(eval.hallucination_flags.iter().any(|f| f.contains("$499")));
        assert!(eval.hallucination_flags.iter().any(|f| f.contains("2021")));
    }

    #[test]
    fn test_definitive_claim_flagged() {
        let context = [scored("exports usually work well", 0.9)];
        let eval = evaluator().evaluate("this export is guaranteed to work", &context);
        assert!(eval
            .hallucination_flags
            .iter()
            .any(|f| f.contains("guaranteed")));
    }

    #[test]
    fn test_perfect_claim_flagged() {
        let context = [scored("the template renders cleanly", 0.9)];
        let eval = evaluator().evaluate("the template is perfect for this", &context);
        assert!(eval
            .hallucination_flags
            .iter()
            .any(|f| f.contains("perfect")));
    }

    #[test]
    fn test_day_of_month_date_flagged() {
        let context = [scored("the cohort schedule is in the welcome email", 0.9)];
        let eval = evaluator().evaluate("enrollment closes on the 3rd of march", &context);
        assert!(eval
            .hallucination_flags
            .iter()
            .any(|f| f.contains("3rd of march")));
    }

    #[test]
    fn test_definitive_claim_grounded_not_flagged() {
        let context = [scored("the export always preserves formatting", 0.9)];
        let eval = evaluator().evaluate("the export always preserves formatting", &context);
        assert!(eval.hallucination_flags.is_empty());
    }

    #[test]
    fn test_tau_review_boundary_not_escalated() {
        // Engineer exact confidence == tau_review: coverage 1.0 with
        // avg score chosen so 0.6*s + 0.4 = 0.5 -> s = 1/6.
        let evaluator = ResponseEvaluator::new(0.5);
        let context = [scored("export project file", 1.0 / 6.0)];
        let eval = evaluator.evaluate("export project file", &context);
        assert!((eval.confidence - 0.5).abs() < 1e-3);
        assert!(!eval.needs_review, "confidence == tau_review must not escalate");
    }

    #[test]
    fn test_levels() {
        assert_eq!(ResponseEvaluator::level(0.9), ConfidenceLevel::High);
        assert_eq!(ResponseEvaluator::level(0.6), ConfidenceLevel::Medium);
        assert_eq!(ResponseEvaluator::level(0.2), ConfidenceLevel::Low);
    }
}
