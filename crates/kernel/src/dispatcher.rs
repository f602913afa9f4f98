//! Tool registry & dispatcher (C5).
//!
//! Concurrent dispatch shape grounded on `gateway/src/runtime/turn.rs`'s
//! `run_turn_inner`: build a future per pending tool call, run them all
//! via `futures_util::future::join_all`, then zip the results back onto
//! the original call list to preserve declared order for downstream
//! event emission. The teacher dispatches every call in a batch
//! concurrently with no notion of "parallel-safe"; this generalizes that
//! into a leading parallel-safe run followed by strict sequential
//! execution, per the dispatcher's `parallel_safe` partitioning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::timeout;

use crate::error::{KernelError, Result};
use crate::model::{ToolCall, ToolResult};
use crate::safety::SafetyGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DangerClass {
    L0,
    L1,
    L2,
}

/// Static description of one registered tool.
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub arg_schema: serde_json::Value,
    pub danger_class: DangerClass,
    pub allowed_in_autonomous_mode: bool,
    /// When `true`, this tool may run concurrently with other
    /// `parallel_safe` tools in the same turn (read-only or otherwise
    /// side-effect-free). Tools that mutate shared state (filesystem
    /// writes, process control) must be `false`.
    pub parallel_safe: bool,
    pub deadline_secs: u64,
}

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, arguments: &HashMap<String, serde_json::Value>) -> Result<serde_json::Value>;
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

/// Holds every tool the kernel knows about and dispatches calls against
/// it, consulting the safety gate and enforcing per-call schema
/// validation and deadlines.
pub struct ToolDispatcher {
    tools: HashMap<String, RegisteredTool>,
    safety: Arc<SafetyGate>,
}

impl ToolDispatcher {
    pub fn new(safety: Arc<SafetyGate>) -> Self {
        Self {
            tools: HashMap::new(),
            safety,
        }
    }

    pub fn register(&mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(
            descriptor.name.clone(),
            RegisteredTool { descriptor, handler },
        );
    }

    pub fn descriptor(&self, tool_name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(tool_name).map(|t| &t.descriptor)
    }

    /// Every registered tool name, used by the Orchestrator to build an
    /// agent's default `allowed_tool_set` when none is configured.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Validate that every key the schema marks `required` is present.
    /// A full JSON Schema validator is out of scope; this is the same
    /// shallow check the dispatcher needs to reject obviously-malformed
    /// calls before they reach a handler.
    fn validate_args(schema: &serde_json::Value, arguments: &HashMap<String, serde_json::Value>) -> Result<()> {
        let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
            return Ok(());
        };
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if !arguments.contains_key(name) {
                return Err(KernelError::BadRequest(format!(
                    "missing required argument '{name}'"
                )));
            }
        }
        Ok(())
    }

    async fn run_one(&self, call: &ToolCall) -> ToolResult {
        let Some(registered) = self.tools.get(&call.tool_name) else {
            return ToolResult::err(format!("unknown tool '{}'", call.tool_name));
        };

        if let Err(e) = self.safety.check(&registered.descriptor, call) {
            return ToolResult::err(e.to_string());
        }

        if let Err(e) = Self::validate_args(&registered.descriptor.arg_schema, &call.arguments) {
            return ToolResult::err(e.to_string());
        }

        let deadline = Duration::from_secs(registered.descriptor.deadline_secs);
        match timeout(deadline, registered.handler.invoke(&call.arguments)).await {
            Ok(Ok(value)) => ToolResult::ok(value),
            Ok(Err(e)) => ToolResult::err(e.to_string()),
            Err(_) => ToolResult::err(format!(
                "tool '{}' exceeded its {}s deadline",
                call.tool_name, registered.descriptor.deadline_secs
            )),
        }
    }

    /// Partition `calls` into a leading run of consecutive parallel-safe
    /// calls (dispatched concurrently via `join_all`, order preserved by
    /// `zip`) followed by the remaining calls executed strictly in
    /// sequence. A non-parallel-safe call anywhere in the leading
    /// position ends the concurrent run immediately.
    pub async fn dispatch_turn(&self, calls: &[ToolCall]) -> Vec<(ToolCall, ToolResult)> {
        let split_at = calls
            .iter()
            .position(|c| {
                !self
                    .tools
                    .get(&c.tool_name)
                    .map(|t| t.descriptor.parallel_safe)
                    .unwrap_or(false)
            })
            .unwrap_or(calls.len());

        let (parallel_calls, rest) = calls.split_at(split_at);

        let futures: Vec<_> = parallel_calls.iter().map(|c| self.run_one(c)).collect();
        let parallel_results = join_all(futures).await;

        let mut out: Vec<(ToolCall, ToolResult)> = parallel_calls
            .iter()
            .cloned()
            .zip(parallel_results)
            .collect();

        for call in rest {
            let result = self.run_one(call).await;
            out.push((call.clone(), result));
        }

        out
    }
}
