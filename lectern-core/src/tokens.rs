//! Model-aware token counting.
//!
//! Thin wrapper over tiktoken BPE tokenization, with the 4-token
//! per-message overhead chat completions add for role framing.

use crate::types::ChatMessage;

/// Token counter using tiktoken for accurate BPE tokenization.
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Create a token counter for the given model.
    /// Falls back to cl100k_base if the model isn't recognized.
    pub fn for_model(model: &str) -> Self {
        let bpe = tiktoken_rs::get_bpe_from_model(model).unwrap_or_else(|_| {
            tiktoken_rs::cl100k_base().expect("cl100k_base should be available")
        });
        Self { bpe }
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Count tokens in a message list, including role-framing overhead.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|msg| self.count(&msg.content) + 4)
            .sum()
    }

    /// Truncate `text` to at most `max_tokens` tokens, decoding back to a
    /// valid UTF-8 string.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        let truncated = &tokens[..max_tokens];
        self.bpe
            .decode(truncated.to_vec())
            .unwrap_or_else(|_| text.chars().take(max_tokens * 4).collect())
    }
}
