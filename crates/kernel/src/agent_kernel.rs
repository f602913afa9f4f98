//! Agent kernel (C13): the think-act-observe loop for a single task.
//!
//! Grounded directly on `gateway/src/runtime/turn.rs`'s `run_turn_inner`
//! — same shape (build context, call provider, parse, dispatch tools,
//! append results, loop with a hard iteration cap) generalized from one
//! flat conversation to one task running inside a larger Plan, and from
//! the teacher's single configured provider to C3's ordered candidate
//! list with failover.

use std::sync::Arc;

use sa_domain::tool::{Message, ToolDefinition};

use crate::breaker::{BreakerRegistry, RateLimiter};
use crate::cancel::CancelToken;
use crate::dispatcher::ToolDispatcher;
use crate::error::{KernelError, Result};
use crate::model::{Agent, Task};
use crate::parser::{self, ParsedResponse};
use crate::provider_client::{Chunk, KernelProviderClient, RequestOptions};
use crate::recovery::{Diagnoser, RecoveryEngine};
use crate::router::{self, ProviderCandidate};

/// Per-iteration state, mirroring §4.13's
/// `Thinking -> Parsing -> (Executing | Finalizing) -> Thinking | Done | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Thinking,
    Parsing,
    Executing,
    Finalizing,
    Done,
    Failed,
}

/// Resolves a provider candidate (as picked by [`router::route`]) to a
/// concrete, callable client. The kernel crate doesn't own provider
/// construction (API keys, HTTP clients) — a host wires this to
/// `sa_providers::registry::ProviderRegistry`.
pub trait ProviderSource: Send + Sync {
    fn client_for(&self, provider_id: &str) -> Option<Arc<KernelProviderClient>>;
}

pub struct AgentKernelConfig {
    pub max_act_iterations: usize,
    pub max_task_tokens: u32,
}

/// One completed task run: a final answer plus everything needed to log
/// it onto the Conversation.
pub struct TaskRunOutcome {
    pub final_text: String,
    pub tokens_used: u32,
    pub iterations: usize,
}

/// Fold a response's chunk stream down into its assistant text, any
/// emitted tool calls, and the usage it reported, discarding the
/// streaming-specific framing (`ToolCallFragment` deltas collapse into
/// their `finished_arguments`).
fn to_chat_response(chunks: &[Chunk], model: String) -> sa_providers::traits::ChatResponse {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let mut usage = None;
    let mut finish_reason = None;

    for chunk in chunks {
        match chunk {
            Chunk::TextDelta(t) => content.push_str(t),
            Chunk::ToolCallFragment {
                call_id,
                tool_name,
                finished_arguments,
                ..
            } => {
                if let (Some(name), Some(args)) = (tool_name, finished_arguments) {
                    tool_calls.push(sa_domain::tool::ToolCall {
                        call_id: call_id.clone(),
                        tool_name: name.clone(),
                        arguments: args.clone(),
                    });
                }
            }
            Chunk::UsageUpdate(u) => usage = Some(u.clone()),
            Chunk::End { finish_reason: fr } => finish_reason = fr.clone(),
        }
    }

    sa_providers::traits::ChatResponse {
        content,
        tool_calls,
        usage,
        model,
        finish_reason,
    }
}

pub struct AgentKernel<'a> {
    pub providers: &'a dyn ProviderSource,
    pub breakers: &'a BreakerRegistry,
    pub limiter: &'a RateLimiter,
    pub dispatcher: &'a ToolDispatcher,
    pub tiers: &'a sa_domain::config::TierConfig,
    pub config: AgentKernelConfig,
    /// C9 wiring: when present, a failed tool result is handed to
    /// `RecoveryEngine::recover` before it's surfaced to the agent as
    /// plain failure text. Both or neither — a diagnoser with no engine
    /// (or vice versa) can't do anything useful, so callers that don't
    /// want recovery just leave both `None`.
    pub recovery: Option<&'a RecoveryEngine>,
    pub diagnoser: Option<&'a dyn Diagnoser>,
}

/// Map a dispatcher failure message back to one of §4.9's coarse error
/// kinds. The dispatcher only carries a `Display`-rendered string on
/// `ToolResult`, so this inspects the prefixes `KernelError`'s `Display`
/// impl actually produces rather than a structured variant.
fn infer_error_kind(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("policy blocked") || lower.contains("requires approval") || lower.contains("requires explicit approval") || lower.contains("elevated to l2") {
        "policy_blocked"
    } else if lower.contains("rate limited") {
        "rate_limited"
    } else if lower.contains("transient") || lower.contains("timed out") || lower.contains("exceeded its") && lower.contains("deadline") {
        "transient"
    } else {
        "bad_request"
    }
}

impl<'a> AgentKernel<'a> {
    /// Apply §4.9 recovery to one failed tool result. Returns the
    /// original failure unchanged when no recovery engine is configured,
    /// when the attempt cap for this call is exhausted, or when the
    /// diagnosis step asks for a direct retry and that retry still
    /// fails. A `SurfaceToSafetyGate` or `GiveUp` diagnosis escalates to
    /// a hard `Err`, ending the task instead of feeding the agent a
    /// recovered-looking result it didn't earn.
    async fn recover_if_configured(
        &self,
        call: crate::model::ToolCall,
        failed: crate::model::ToolResult,
    ) -> Result<crate::model::ToolResult> {
        let (Some(recovery), Some(diagnoser)) = (self.recovery, self.diagnoser) else {
            return Ok(failed);
        };
        let error_message = failed.error.clone().unwrap_or_default();
        let error_kind = infer_error_kind(&error_message);
        match recovery.recover(&call, error_kind, error_message, Vec::new(), diagnoser).await {
            None => Ok(failed),
            Some(Err(e)) => Err(e),
            Some(Ok(retried_call)) => {
                let retried = self.dispatcher.dispatch_turn(std::slice::from_ref(&retried_call)).await;
                Ok(retried.into_iter().next().map(|(_, r)| r).unwrap_or(failed))
            }
        }
    }

    fn tool_definitions(&self, agent: &Agent) -> Vec<ToolDefinition> {
        agent
            .allowed_tool_set
            .iter()
            .filter_map(|name| self.dispatcher.descriptor(name))
            .map(|d| ToolDefinition {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters: d.arg_schema.clone(),
            })
            .collect()
    }

    /// Try every candidate provider in order until one call succeeds or
    /// they're all exhausted, matching §4.1/§4.3's failover contract. A
    /// non-retriable error (bad request, policy) stops the walk early
    /// instead of burning through every remaining candidate.
    async fn call_with_failover(
        &self,
        candidates: &[ProviderCandidate],
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<(Vec<Chunk>, String)> {
        let mut last_err = None;
        for candidate in candidates {
            let Some(client) = self.providers.client_for(&candidate.provider_id) else {
                continue;
            };
            let options = RequestOptions {
                model: Some(candidate.model.clone()),
                ..Default::default()
            };
            match client
                .chat_stream(messages.clone(), tools.clone(), options, self.breakers, self.limiter)
                .await
            {
                Ok(chunks) => return Ok((chunks, candidate.model.clone())),
                Err(e) => {
                    let retriable = e.is_retriable();
                    last_err = Some(e);
                    if !retriable {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(KernelError::AllProvidersFailed))
    }

    /// Run the think-act-observe loop for one task, returning the final
    /// answer text. `system_context` is the pre-built prompt material
    /// (project snapshot, retrievals, plan summary) the caller assembled
    /// per §4.13 step 1. Cancellation at any suspension point aborts the
    /// task with `KernelError::Cancelled`; tool results already folded
    /// into `messages` before that point are not lost, since the caller
    /// still holds the partially built conversation turns.
    pub async fn run_task(
        &self,
        agent: &Agent,
        task: &Task,
        system_context: &str,
        cancel: &CancelToken,
    ) -> Result<TaskRunOutcome> {
        let mut messages = vec![
            Message::system(format!("{}\n\n{}", agent.system_prompt_template, system_context)),
            Message::user(task.description.clone()),
        ];
        let tools = self.tool_definitions(agent);
        let mut tokens_used = 0u32;

        for iteration in 0..self.config.max_act_iterations {
            tracing::debug!(iteration, phase = ?AgentPhase::Thinking, "agent kernel iteration");
            if cancel.is_cancelled() {
                return Err(KernelError::Cancelled);
            }

            let candidates = router::route(task.complexity, self.tiers, self.breakers);
            if candidates.is_empty() {
                return Err(KernelError::AllProvidersFailed);
            }
            let (chunks, model_name) = self
                .call_with_failover(&candidates, messages.clone(), tools.clone())
                .await?;

            if cancel.is_cancelled() {
                return Err(KernelError::Cancelled);
            }

            tracing::debug!(iteration, phase = ?AgentPhase::Parsing, "parsing provider response");
            let response = to_chat_response(&chunks, model_name);
            tokens_used += response.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0);
            if tokens_used > self.config.max_task_tokens {
                return Err(KernelError::BudgetExceeded(format!(
                    "task exceeded its {}-token budget",
                    self.config.max_task_tokens
                )));
            }

            let parsed = parser::parse(&response, iteration as u64).map_err(|e| match e {
                parser::ParseError::PathTraversal { .. } => KernelError::PolicyBlocked(e.to_string()),
                parser::ParseError::Empty => KernelError::Internal(e.to_string()),
            })?;

            match parsed {
                ParsedResponse::FinalAnswer { text } => {
                    tracing::debug!(iteration, phase = ?AgentPhase::Finalizing, "task produced a final answer");
                    return Ok(TaskRunOutcome {
                        final_text: text,
                        tokens_used,
                        iterations: iteration + 1,
                    });
                }
                ParsedResponse::ToolCalls { calls, .. } => {
                    tracing::debug!(iteration, phase = ?AgentPhase::Executing, call_count = calls.len(), "dispatching tool calls");
                    if !response.content.is_empty() {
                        messages.push(Message::assistant(response.content.clone()));
                    }

                    if cancel.is_cancelled() {
                        return Err(KernelError::Cancelled);
                    }

                    let results = self.dispatcher.dispatch_turn(&calls).await;
                    for (call, result) in results {
                        let result = if result.success {
                            result
                        } else {
                            self.recover_if_configured(call.clone(), result).await?
                        };
                        let content = serde_json::to_string(&result).unwrap_or_default();
                        messages.push(Message::tool_result(call.call_id, content));
                    }
                }
            }
        }

        Err(KernelError::Internal(format!(
            "task exceeded max_act_iterations ({})",
            self.config.max_act_iterations
        )))
    }
}
