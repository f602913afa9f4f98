//! Recovery engine (C9): diagnose a failed tool call and propose
//! corrected arguments, bounded by `max_recovery_attempts`.
//!
//! Grounded on `sa_providers::classifier`'s shape of "small LLM call
//! returning a structured label" (reused here for a structured
//! diagnosis instead of an intent label) and on C1's `KernelProviderClient`
//! for the lightweight-LLM round trip itself — this module owns no HTTP
//! or streaming logic, only the retry bookkeeping and error-kind-driven
//! strategy selection from §4.9.

use std::collections::HashMap;

use crate::error::KernelError;
use crate::model::{ToolCall, Turn};

/// Snapshot handed to the diagnosis step; mirrors §4.9's
/// `RecoveryContext { tool_name, args, error_kind, error_message,
/// recent_turns }` field-for-field.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub tool_name: String,
    pub args: HashMap<String, serde_json::Value>,
    pub error_kind: &'static str,
    pub error_message: String,
    pub recent_turns: Vec<Turn>,
}

/// §4.9's error categorization: each error kind implies a strategy before
/// any LLM round-trip is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Likely a wrong path; suggest a search tool instead of retrying blind.
    SuggestSearch,
    /// Malformed arguments; ask the diagnosis step for a schema-guided fix.
    SchemaGuidedCorrection,
    /// Permission/L1/L2 refusal; not retriable here, hand back to the
    /// Safety Gate.
    SurfaceToSafetyGate,
    /// Transient provider/network failure; retry the same call unchanged,
    /// no LLM round-trip needed.
    DirectRetry,
}

/// Categorize a failure by the (error_kind, message) pair the dispatcher
/// produced, before spending an LLM call on diagnosis.
pub fn categorize(error_kind: &str, message: &str) -> Strategy {
    let lower = message.to_lowercase();
    if error_kind == "policy_blocked" {
        return Strategy::SurfaceToSafetyGate;
    }
    if error_kind == "transient" || error_kind == "rate_limited" {
        return Strategy::DirectRetry;
    }
    if lower.contains("no such file")
        || lower.contains("not found")
        || lower.contains("does not exist")
    {
        return Strategy::SuggestSearch;
    }
    Strategy::SchemaGuidedCorrection
}

/// Outcome of one diagnosis round.
#[derive(Debug, Clone)]
pub enum Diagnosis {
    /// Corrected arguments to retry the same tool with.
    Retry { corrected_args: HashMap<String, serde_json::Value>, reasoning: String },
    /// The diagnosis step concluded the call cannot succeed as framed.
    GiveUp { reasoning: String },
}

/// Delegate that performs the actual "lightweight LLM request" from §4.9.
/// A host wires this to the C1 facade with a fast/cheap model role; kept
/// as a trait here so this module's retry bookkeeping doesn't depend on
/// provider wiring.
#[async_trait::async_trait]
pub trait Diagnoser: Send + Sync {
    async fn diagnose(&self, ctx: &RecoveryContext) -> Diagnosis;
}

/// Tracks recovery attempts per tool call so the cap in §8 invariant 8
/// ("no tool call has more than `max_recovery_attempts` recovery tries")
/// holds across the whole conversation, not just within one dispatch.
pub struct RecoveryEngine {
    max_attempts: u32,
    attempts: parking_lot::Mutex<HashMap<String, u32>>,
}

impl RecoveryEngine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn attempts_for(&self, call_id: &str) -> u32 {
        *self.attempts.lock().get(call_id).unwrap_or(&0)
    }

    /// Attempt recovery for a failed call. Returns `None` once
    /// `max_attempts` is exhausted for this `call_id` — the caller must
    /// then surface the original failure to the agent loop per §4.9.
    pub async fn recover(
        &self,
        call: &ToolCall,
        error_kind: &'static str,
        error_message: String,
        recent_turns: Vec<Turn>,
        diagnoser: &dyn Diagnoser,
    ) -> Option<Result<ToolCall, KernelError>> {
        {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(call.call_id.clone()).or_insert(0);
            if *count >= self.max_attempts {
                return None;
            }
            *count += 1;
        }

        let strategy = categorize(error_kind, &error_message);
        match strategy {
            Strategy::SurfaceToSafetyGate => {
                Some(Err(KernelError::PolicyBlocked(error_message)))
            }
            Strategy::DirectRetry => Some(Ok(call.clone())),
            Strategy::SuggestSearch | Strategy::SchemaGuidedCorrection => {
                let ctx = RecoveryContext {
                    tool_name: call.tool_name.clone(),
                    args: call.arguments.clone(),
                    error_kind,
                    error_message: error_message.clone(),
                    recent_turns,
                };
                match diagnoser.diagnose(&ctx).await {
                    Diagnosis::Retry { corrected_args, .. } => {
                        let mut retried = call.clone();
                        retried.arguments = corrected_args;
                        Some(Ok(retried))
                    }
                    Diagnosis::GiveUp { reasoning } => {
                        Some(Err(KernelError::ToolFailure {
                            tool_name: call.tool_name.clone(),
                            message: format!("recovery gave up: {reasoning}"),
                        }))
                    }
                }
            }
        }
    }
}
