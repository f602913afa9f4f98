//! Provider client (C1): uniform streaming chat interface over
//! heterogeneous vendors.
//!
//! Grounded on `sa_providers::traits::LlmProvider`/`ChatRequest`/
//! `ChatResponse` and `sa_domain::stream::{StreamEvent, Usage, BoxStream}` —
//! the kernel does not reimplement a vendor adapter, it wraps whichever
//! `Arc<dyn LlmProvider>` the router selected and layers the breaker/rate
//! limiter bookkeeping distilled-spec §4.1's "side effects" paragraph
//! calls for around the call, matching the separation
//! `gateway/src/runtime/turn.rs` draws between "call the provider" and
//! "track run-node state around the call".

use std::sync::Arc;

use sa_domain::stream::{StreamEvent, Usage};
use sa_domain::tool::{Message, ToolDefinition};
use sa_providers::traits::{ChatRequest, LlmProvider};

use crate::breaker::{BreakerRegistry, RateLimiter};
use crate::error::{KernelError, Result};
use crate::estimator::estimate_tokens;

/// A typed chunk from a provider stream, matching §4.1's
/// `TextDelta | ToolCallFragment | UsageUpdate | End`.
#[derive(Debug, Clone)]
pub enum Chunk {
    TextDelta(String),
    ToolCallFragment {
        call_id: String,
        tool_name: Option<String>,
        arguments_delta: Option<String>,
        finished_arguments: Option<serde_json::Value>,
    },
    UsageUpdate(Usage),
    End { finish_reason: Option<String> },
}

/// Request options the facade forwards to the underlying provider.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    pub model: Option<String>,
}

fn classify_domain_error(err: &sa_domain::error::Error) -> KernelError {
    match err {
        sa_domain::error::Error::Timeout(m) => KernelError::Transient(m.clone()),
        sa_domain::error::Error::Http(m) => {
            if m.contains("401") || m.contains("403") {
                KernelError::BadRequest(format!("unauthenticated: {m}"))
            } else if m.contains("429") {
                KernelError::RateLimited { retry_after_ms: 1000 }
            } else if m.starts_with("5") || m.contains("50") {
                KernelError::Transient(m.clone())
            } else {
                KernelError::BadRequest(m.clone())
            }
        }
        sa_domain::error::Error::Provider { message, .. } => KernelError::Transient(message.clone()),
        other => KernelError::Transient(other.to_string()),
    }
}

/// Facade over a single `LlmProvider`, gating every call through the
/// provider's circuit breaker and rate limiter (C2) before it reaches the
/// vendor adapter.
pub struct KernelProviderClient {
    provider: Arc<dyn LlmProvider>,
    provider_id: String,
}

impl KernelProviderClient {
    pub fn new(provider_id: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider: provider,
            provider_id: provider_id.into(),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Input-constraint check from §4.1: total estimated prompt tokens
    /// must fit under the provider's advertised context window.
    pub fn check_input_budget(&self, messages: &[Message]) -> Result<()> {
        let estimate: u32 = messages.iter().map(|m| estimate_tokens(&m.content.extract_all_text())).sum();
        if let Some(limit) = self.provider.capabilities().context_window_tokens {
            if estimate > limit {
                return Err(KernelError::ContextOverflow(format!(
                    "{estimate} estimated prompt tokens exceeds provider limit of {limit}"
                )));
            }
        }
        Ok(())
    }

    /// Issue a non-streaming chat call, gated by `breakers`/`limiter`.
    /// Returns the assembled chunks in order, ending with `End`.
    pub async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        options: RequestOptions,
        breakers: &BreakerRegistry,
        limiter: &RateLimiter,
    ) -> Result<Vec<Chunk>> {
        self.check_input_budget(&messages)?;

        let breaker = breakers.breaker_for(&self.provider_id);
        let permit = breaker.try_acquire()?;

        let estimated_tokens = messages
            .iter()
            .map(|m| estimate_tokens(&m.content.extract_all_text()))
            .sum::<u32>()
            .max(1);
        let reservation = match limiter.reserve(estimated_tokens) {
            Ok(r) => r,
            Err(e) => {
                permit.record(&Err(KernelError::Transient("rate limited before dispatch".into())));
                return Err(e);
            }
        };

        let req = ChatRequest {
            messages,
            tools,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            json_mode: options.json_mode,
            model: options.model,
        };

        let outcome = self.provider.chat(req).await;
        match outcome {
            Ok(response) => {
                let usage = response.usage.clone().unwrap_or(Usage {
                    prompt_tokens: estimated_tokens,
                    completion_tokens: 0,
                    total_tokens: estimated_tokens,
                });
                reservation.reconcile(usage.total_tokens.max(1));
                permit.record(&Ok(()));

                let mut chunks = Vec::new();
                if !response.content.is_empty() {
                    chunks.push(Chunk::TextDelta(response.content));
                }
                for call in response.tool_calls {
                    chunks.push(Chunk::ToolCallFragment {
                        call_id: call.call_id,
                        tool_name: Some(call.tool_name),
                        arguments_delta: None,
                        finished_arguments: Some(call.arguments),
                    });
                }
                chunks.push(Chunk::UsageUpdate(usage));
                chunks.push(Chunk::End {
                    finish_reason: response.finish_reason,
                });
                Ok(chunks)
            }
            Err(e) => {
                reservation.refund();
                let kernel_err = classify_domain_error(&e);
                permit.record(&Err(KernelError::Transient(kernel_err.to_string())));
                Err(kernel_err)
            }
        }
    }

    /// Issue a streaming chat call, translating `StreamEvent`s into
    /// `Chunk`s. Chunks arrive in order; a `UsageUpdate` is synthesized
    /// from the stream's final `Done` event per §4.1's output guarantee
    /// ("UsageUpdate appears at least once before End").
    pub async fn chat_stream(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        options: RequestOptions,
        breakers: &BreakerRegistry,
        limiter: &RateLimiter,
    ) -> Result<Vec<Chunk>> {
        self.check_input_budget(&messages)?;

        let breaker = breakers.breaker_for(&self.provider_id);
        let permit = breaker.try_acquire()?;

        let estimated_tokens = messages
            .iter()
            .map(|m| estimate_tokens(&m.content.extract_all_text()))
            .sum::<u32>()
            .max(1);
        let reservation = match limiter.reserve(estimated_tokens) {
            Ok(r) => r,
            Err(e) => {
                permit.record(&Err(KernelError::Transient("rate limited before dispatch".into())));
                return Err(e);
            }
        };

        let req = ChatRequest {
            messages,
            tools,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            json_mode: options.json_mode,
            model: options.model,
        };

        let stream_result = self.provider.chat_stream(req).await;
        let mut stream = match stream_result {
            Ok(s) => s,
            Err(e) => {
                reservation.refund();
                let kernel_err = classify_domain_error(&e);
                permit.record(&Err(KernelError::Transient(kernel_err.to_string())));
                return Err(kernel_err);
            }
        };

        use futures_util::StreamExt;
        let mut chunks = Vec::new();
        let mut final_usage: Option<Usage> = None;
        let mut stream_failed = None;

        while let Some(event) = stream.next().await {
            match event {
                Ok(StreamEvent::Token { text }) => chunks.push(Chunk::TextDelta(text)),
                Ok(StreamEvent::ToolCallStarted { call_id, tool_name }) => {
                    chunks.push(Chunk::ToolCallFragment {
                        call_id,
                        tool_name: Some(tool_name),
                        arguments_delta: None,
                        finished_arguments: None,
                    });
                }
                Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                    chunks.push(Chunk::ToolCallFragment {
                        call_id,
                        tool_name: None,
                        arguments_delta: Some(delta),
                        finished_arguments: None,
                    });
                }
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }) => {
                    chunks.push(Chunk::ToolCallFragment {
                        call_id,
                        tool_name: Some(tool_name),
                        arguments_delta: None,
                        finished_arguments: Some(arguments),
                    });
                }
                Ok(StreamEvent::Done { usage, finish_reason }) => {
                    final_usage = usage;
                    chunks.push(Chunk::End { finish_reason });
                    break;
                }
                Ok(StreamEvent::Error { message }) => {
                    stream_failed = Some(message);
                    break;
                }
                Err(e) => {
                    stream_failed = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(message) = stream_failed {
            reservation.refund();
            let kernel_err = KernelError::Transient(message);
            permit.record(&Err(KernelError::Transient(kernel_err.to_string())));
            return Err(kernel_err);
        }

        let usage = final_usage.unwrap_or(Usage {
            prompt_tokens: estimated_tokens,
            completion_tokens: 0,
            total_tokens: estimated_tokens,
        });
        reservation.reconcile(usage.total_tokens.max(1));
        permit.record(&Ok(()));
        // Insert the usage update immediately before the trailing `End`,
        // matching §4.1's ordering guarantee.
        let end = chunks.pop();
        chunks.push(Chunk::UsageUpdate(usage));
        if let Some(end) = end {
            chunks.push(end);
        } else {
            chunks.push(Chunk::End { finish_reason: None });
        }

        Ok(chunks)
    }
}
