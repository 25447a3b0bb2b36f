//! LLM client interface. The core treats the model as a pure text-completion
//! callable (§6 "out of scope, interfaces only") and only owns the token
//! budget guard and prompt cache-breakpoint placement around it.

pub mod cache;
pub mod types;

use crate::error::{Error, ErrorCode, Result};
use async_trait::async_trait;
use types::{ChatMessage, LlmCompletion};

/// Text-completion callable. Concrete providers (Anthropic, OpenAI, a local
/// model server) implement this; the core never speaks a provider's wire
/// format directly.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        system: Option<&str>,
        messages: &[ChatMessage],
        max_tokens: u64,
    ) -> Result<LlmCompletion>;

    fn model_name(&self) -> &str;
}

/// Enforces `max_tokens`/`consumed_tokens` across a single request's LLM
/// calls. Exhaustion is a hard error (`LLM_BUDGET_EXCEEDED`), not a silent
/// truncation.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    max_tokens: u64,
    consumed_tokens: u64,
}

impl TokenBudget {
    pub fn new(max_tokens: u64) -> Self {
        Self {
            max_tokens,
            consumed_tokens: 0,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed_tokens
    }

    pub fn remaining(&self) -> u64 {
        self.max_tokens.saturating_sub(self.consumed_tokens)
    }

    /// Record `tokens` as spent. Fails if this call alone, or the running
    /// total, would exceed `max_tokens`.
    pub fn consume(&mut self, tokens: u64) -> Result<()> {
        let projected = self.consumed_tokens.saturating_add(tokens);
        if projected > self.max_tokens {
            return Err(Error::LlmBudgetExceeded(format!(
                "requested {tokens} tokens, only {} remaining of {}",
                self.remaining(),
                self.max_tokens
            )));
        }
        self.consumed_tokens = projected;
        Ok(())
    }
}

/// A fixed-response client used in tests and offline evaluation replay,
/// where no real model call should occur.
pub struct StaticLlmClient {
    model: String,
    response: String,
}

impl StaticLlmClient {
    pub fn new(model: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            response: response.into(),
        }
    }
}

#[async_trait]
impl LlmClient for StaticLlmClient {
    async fn complete(
        &self,
        _system: Option<&str>,
        _messages: &[ChatMessage],
        _max_tokens: u64,
    ) -> Result<LlmCompletion> {
        Ok(LlmCompletion {
            text: self.response.clone(),
            usage: types::TokenUsage {
                prompt_tokens: 0,
                completion_tokens: 0,
            },
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

pub fn llm_budget_exceeded_code() -> ErrorCode {
    ErrorCode::LlmBudgetExceeded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_allows_spending_up_to_the_limit() {
        let mut budget = TokenBudget::new(100);
        assert!(budget.consume(60).is_ok());
        assert!(budget.consume(40).is_ok());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn budget_rejects_overspend() {
        let mut budget = TokenBudget::new(100);
        budget.consume(90).unwrap();
        let err = budget.consume(20).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LlmBudgetExceeded);
    }

    #[tokio::test]
    async fn static_client_returns_fixed_completion() {
        let client = StaticLlmClient::new("test-model", "SELECT 1");
        let out = client.complete(None, &[], 100).await.unwrap();
        assert_eq!(out.text, "SELECT 1");
        assert_eq!(client.model_name(), "test-model");
    }
}
