//! Prompt injection screening.
//!
//! Pattern-based classification of student input before it reaches the
//! model: instruction overrides, system-prompt leaks, role reassignment,
//! known jailbreak tokens, control-character density, and oversized
//! base64-like payloads. Matching runs on normalized text so zero-width
//! characters and unicode tricks cannot dodge the ruleset.

use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Classification of threat severity for a checked input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Medium,
    High,
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreatLevel::None => write!(f, "none"),
            ThreatLevel::Medium => write!(f, "medium"),
            ThreatLevel::High => write!(f, "high"),
        }
    }
}

/// Result of a prompt injection check.
///
/// `matched_pattern` is for logging only and must never reach the
/// user-visible refusal text.
#[derive(Debug, Clone)]
pub struct GuardVerdict {
    pub is_injection: bool,
    pub threat_level: ThreatLevel,
    pub matched_pattern: Option<String>,
}

impl GuardVerdict {
    fn clean() -> Self {
        Self {
            is_injection: false,
            threat_level: ThreatLevel::None,
            matched_pattern: None,
        }
    }

    fn flagged(level: ThreatLevel, pattern: impl Into<String>) -> Self {
        Self {
            is_injection: true,
            threat_level: level,
            matched_pattern: Some(pattern.into()),
        }
    }
}

/// Compiled ruleset for prompt injection detection.
///
/// Construction compiles every pattern once; `check` is deterministic on
/// its input.
pub struct PromptGuard {
    instruction_override: Vec<Regex>,
    system_prompt_leak: Vec<Regex>,
    jailbreak: Vec<Regex>,
    role_reassignment: Vec<Regex>,
    /// Base64-like payloads longer than this are flagged.
    base64_length_threshold: usize,
}

const INSTRUCTION_OVERRIDE_PATTERNS: &[&str] = &[
    r"ignore\s+(all\s+)?(previous|prior|above)\s+instructions?",
    r"disregard\s+(all\s+)?(previous|prior|above)",
    r"forget\s+(everything|all|what)\s+(you|i)\s+(said|told|were)",
    r"new\s+instructions?\s*:",
    r"override\s+(system|previous)",
    r"your\s+instructions?\s+(are|were)\s+(wrong|void|cancelled)",
];

const SYSTEM_PROMPT_LEAK_PATTERNS: &[&str] = &[
    r"(print|show|reveal|output|repeat)\s+(your\s+)?(system\s+prompt|initial\s+prompt|instructions)",
    r"what\s+(are|were)\s+your\s+(exact\s+)?instructions",
];

const JAILBREAK_PATTERNS: &[&str] = &[
    r"\bdan\s+mode\b",
    r"developer\s+mode",
    r"\bjailbreak\b",
    r"bypass\s+(your\s+)?(safety|restrictions|filters)",
];

const ROLE_REASSIGNMENT_PATTERNS: &[&str] = &[
    r"you\s+are\s+now\s+",
    r"pretend\s+(to\s+be|you\s+are)",
    r"act\s+as\s+(if\s+you\s+are|a)\b",
    r"imagine\s+you\s+are",
    r"from\s+now\s+on\s+you\s+are",
    r"i\s+want\s+you\s+to\s+act\s+as",
];

impl PromptGuard {
    pub fn new() -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(&format!("(?i){p}")).expect("guard pattern must compile"))
                .collect()
        };
        Self {
            instruction_override: compile(INSTRUCTION_OVERRIDE_PATTERNS),
            system_prompt_leak: compile(SYSTEM_PROMPT_LEAK_PATTERNS),
            jailbreak: compile(JAILBREAK_PATTERNS),
            role_reassignment: compile(ROLE_REASSIGNMENT_PATTERNS),
            base64_length_threshold: 120,
        }
    }

    /// Check input text for prompt injection attempts.
    ///
    /// High threat: jailbreak tokens, instruction overrides, and prompt
    /// leaks. Medium threat: role reassignment, suspicious encodings, and
    /// heavy control-character use; the pipeline continues with a
    /// hardened system prompt for those.
    pub fn check(&self, text: &str) -> GuardVerdict {
        if text.trim().is_empty() {
            return GuardVerdict::clean();
        }

        let normalized = Self::normalize(text);

        for regex in self
            .jailbreak
            .iter()
            .chain(&self.instruction_override)
            .chain(&self.system_prompt_leak)
        {
            if let Some(m) = regex.find(&normalized) {
                tracing::warn!(pattern = m.as_str(), level = "high", "Prompt injection detected");
                return GuardVerdict::flagged(ThreatLevel::High, m.as_str());
            }
        }

        for regex in &self.role_reassignment {
            if let Some(m) = regex.find(&normalized) {
                tracing::warn!(
                    pattern = m.as_str(),
                    level = "medium",
                    "Prompt injection detected"
                );
                return GuardVerdict::flagged(ThreatLevel::Medium, m.as_str());
            }
        }

        if let Some(verdict) = self.check_encoding(text) {
            return verdict;
        }

        GuardVerdict::clean()
    }

    /// Flag control-character-dense input and long base64-like payloads.
    fn check_encoding(&self, text: &str) -> Option<GuardVerdict> {
        let control_count = text
            .chars()
            .filter(|c| c.is_control() && *c != '\n' && *c != '\r' && *c != '\t')
            .count();
        if !text.is_empty() && control_count * 20 > text.chars().count() {
            tracing::warn!(
                control_chars = control_count,
                level = "medium",
                "Control-character-dense input"
            );
            return Some(GuardVerdict::flagged(
                ThreatLevel::Medium,
                format!("[{control_count} control characters]"),
            ));
        }

        // A long unbroken run of base64 alphabet is likely an encoded payload.
        let mut run = 0usize;
        let mut longest = 0usize;
        for c in text.chars() {
            if c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=' {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        if longest >= self.base64_length_threshold {
            tracing::warn!(
                run_length = longest,
                level = "medium",
                "Suspicious base64-like payload"
            );
            return Some(GuardVerdict::flagged(
                ThreatLevel::Medium,
                format!("[base64-like run, {longest} chars]"),
            ));
        }

        None
    }

    /// Normalize text for matching: NFKD decomposition, strip combining
    /// marks and zero-width characters, collapse whitespace, lowercase.
    fn normalize(text: &str) -> String {
        let nfkd: String = text.nfkd().collect();
        let mut result = String::with_capacity(nfkd.len());
        let mut prev_space = false;
        for c in nfkd.chars() {
            if unicode_normalization::char::is_combining_mark(c) || Self::is_zero_width(c) {
                continue;
            }
            if c.is_whitespace() {
                if !prev_space {
                    result.push(' ');
                    prev_space = true;
                }
            } else {
                result.extend(c.to_lowercase());
                prev_space = false;
            }
        }
        result.trim().to_string()
    }

    fn is_zero_width(c: char) -> bool {
        matches!(
            c,
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\u{00AD}' | '\u{2060}'
                | '\u{180E}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}'
                | '\u{2066}'..='\u{2069}'
        )
    }
}

impl Default for PromptGuard {
    fn default() -> Self {
        Self::new()
    }
}
