//! Orchestrator (C14): the top-level state machine tying the Intent
//! Classifier (C10), Planner (C11), Topology Executor (C12), and Agent
//! Kernel (C13) together for one incoming `Request`.
//!
//! No single teacher file owns this shape — `gateway/src/runtime/turn.rs`
//! owns one conversation's turn loop, not a multi-task plan — so this
//! generalizes that file's top-level structure (build context, run the
//! work, aggregate, report) up one level, to a whole Plan instead of a
//! single turn sequence, while keeping its division of labor: the
//! Orchestrator only sequences state transitions and owns the per-task
//! cancellation tokens; it delegates actual inference to the Agent
//! Kernel and actual concurrency to the Topology Executor exactly as
//! `turn.rs` delegates provider calls to `LlmProvider` and tool execution
//! to the dispatcher it's handed.

use std::sync::Arc;

use crate::agent_kernel::{AgentKernel, AgentKernelConfig, ProviderSource};
use crate::breaker::{BreakerRegistry, RateLimiter};
use crate::cancel::CancelToken;
use crate::classifier::IntentClassifier;
use crate::config::KernelConfig;
use crate::dispatcher::ToolDispatcher;
use crate::error::{KernelError, Result};
use crate::model::{Agent, AgentKind, Approval, ApprovalDecisionKind, Plan, Request, TopologyHint};
use crate::planner;
use crate::recovery::{Diagnoser, RecoveryEngine};
use crate::topology::{self, TaskOutcome, TaskRunner, TopologyExecutor};

/// `Idle -> Classifying -> Planning -> (AwaitingApproval | Running) ->
/// Running -> Aggregating -> Done | Failed`, per §4.14.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorPhase {
    Idle,
    Classifying,
    Planning,
    AwaitingApproval,
    Running,
    Aggregating,
    Done,
    Failed,
}

/// Injected callback asking a human (or an auto-approve policy) to
/// accept, reject, or edit a Plan that tripped the plan-gating rule.
/// Kept separate from `safety::SafetyGate`'s per-tool-call approval
/// workflow: this gates a whole Plan once, before any task runs.
#[async_trait::async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn request_approval(&self, plan: &Plan) -> Approval;
}

/// Approves every plan without prompting — the policy for
/// `auto_approve`/`yolo_mode` runs that never want a human in the loop.
pub struct AutoApprove;

#[async_trait::async_trait]
impl ApprovalCallback for AutoApprove {
    async fn request_approval(&self, plan: &Plan) -> Approval {
        Approval {
            plan_id: plan.id.clone(),
            decision: ApprovalDecisionKind::Accept,
            edited_plan: None,
            requester_identity: "auto_approve".into(),
        }
    }
}

/// The Orchestrator's final, structured report (§4.14: "ordered task
/// results + a summary string").
pub struct OrchestratorOutcome {
    pub plan: Plan,
    pub task_outcomes: Vec<TaskOutcome>,
    pub summary: String,
}

fn default_prompt_template(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Architect => {
            "You are a software architect. Produce a design before writing any code; call out tradeoffs."
        }
        AgentKind::Coder => "You are a careful coding agent. Make the smallest correct change and verify it.",
        AgentKind::Explorer => {
            "You explore an unfamiliar codebase to answer a question, preferring read-only tools."
        }
        AgentKind::Reviewer => "You review a change for correctness, security, and maintainability issues.",
        AgentKind::Tester => "You write and run tests that exercise the change under review.",
        AgentKind::Explainer => "You explain code or behavior clearly and concisely, without editing anything.",
        AgentKind::Generalist => "You are a helpful general-purpose assistant.",
    }
}

/// Build the stateless `Agent` definition for one task's `agent_kind`.
/// `allowed_tools` defaults to every tool the dispatcher knows about when
/// the caller hasn't narrowed it per role.
fn agent_for(kind: AgentKind, allowed_tools: &[String]) -> Agent {
    Agent {
        kind,
        system_prompt_template: default_prompt_template(kind).to_string(),
        allowed_tool_set: allowed_tools.to_vec(),
        temperature: 0.2,
        reasoning_hint: None,
    }
}

/// Runs one task via the Agent Kernel, on behalf of the Topology
/// Executor. Holds the resources every task in this run shares
/// (providers, breakers, limiter, dispatcher, tiers) plus the
/// Orchestrator-owned per-run cancellation token and per-task token
/// budget.
struct OrchestratorRunner<'a> {
    providers: &'a dyn ProviderSource,
    breakers: &'a BreakerRegistry,
    limiter: &'a RateLimiter,
    dispatcher: &'a ToolDispatcher,
    tiers: &'a sa_domain::config::TierConfig,
    tool_names: Vec<String>,
    max_act_iterations: usize,
    max_task_tokens: u32,
    system_context: String,
    recovery: Option<&'a RecoveryEngine>,
    diagnoser: Option<&'a dyn Diagnoser>,
}

#[async_trait::async_trait]
impl<'a> TaskRunner for OrchestratorRunner<'a> {
    async fn run(&self, task: &crate::model::Task, cancel: &CancelToken) -> Result<String> {
        let kernel = AgentKernel {
            providers: self.providers,
            breakers: self.breakers,
            limiter: self.limiter,
            dispatcher: self.dispatcher,
            tiers: self.tiers,
            config: AgentKernelConfig {
                max_act_iterations: self.max_act_iterations,
                max_task_tokens: self.max_task_tokens,
            },
            recovery: self.recovery,
            diagnoser: self.diagnoser,
        };
        let agent = agent_for(task.agent_kind, &self.tool_names);
        // `cancel` is already scoped by the Topology Executor to this
        // task's chunk (a child of the run-level token, and cancelled
        // early if a sibling fails and `cancel_siblings_on_failure` is
        // set); give the running task its own child of that so a future
        // per-task-timeout policy could cancel just this task too.
        let task_cancel = cancel.child();
        kernel
            .run_task(&agent, task, &self.system_context, &task_cancel)
            .await
            .map(|outcome| outcome.final_text)
    }
}

pub struct Orchestrator<'a> {
    pub classifier: &'a IntentClassifier,
    pub providers: &'a dyn ProviderSource,
    pub breakers: &'a BreakerRegistry,
    pub limiter: &'a RateLimiter,
    pub dispatcher: &'a ToolDispatcher,
    pub tiers: &'a sa_domain::config::TierConfig,
    pub config: &'a KernelConfig,
    /// C9 wiring, threaded down into every task's `AgentKernel`. A host
    /// that doesn't want recovery (or has no cheap model role to spend
    /// on diagnosis) leaves both `None`; failed tool calls then surface
    /// to the agent as plain failure text, same as before this was wired in.
    pub recovery: Option<&'a RecoveryEngine>,
    pub diagnoser: Option<&'a dyn Diagnoser>,
}

impl<'a> Orchestrator<'a> {
    /// Run one request end to end: classify, plan, gate on approval if
    /// required, execute the approved plan under its topology, and
    /// aggregate. `system_context` is forwarded unchanged into every
    /// task's Agent Kernel run (project snapshot, retrievals — built
    /// once per request, not per task).
    pub async fn run(
        &self,
        request: Request,
        approval: &dyn ApprovalCallback,
        system_context: &str,
        cancel: &CancelToken,
    ) -> Result<OrchestratorOutcome> {
        tracing::debug!(phase = ?OrchestratorPhase::Classifying, "classifying request");
        let intent = self.classifier.classify(&request).await;

        tracing::debug!(phase = ?OrchestratorPhase::Planning, intent = ?intent.kind, "building plan");
        let mut plan = planner::plan(&request, &intent);
        plan.validate_dag().map_err(KernelError::PlanInvalid)?;

        if planner::requires_approval(&plan, self.config.plan_gating_threshold) {
            tracing::debug!(phase = ?OrchestratorPhase::AwaitingApproval, plan_id = %plan.id, "awaiting plan approval");
            let decision = approval.request_approval(&plan).await;
            match decision.decision {
                ApprovalDecisionKind::Accept => {}
                ApprovalDecisionKind::Edit => {
                    if let Some(edited) = decision.edited_plan {
                        edited.validate_dag().map_err(KernelError::PlanInvalid)?;
                        plan = edited;
                    }
                }
                ApprovalDecisionKind::Reject => {
                    tracing::debug!(phase = ?OrchestratorPhase::Failed, plan_id = %plan.id, "plan rejected by reviewer");
                    return Err(KernelError::CancelledByUser);
                }
            }
        }
        plan.approved = true;

        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }

        tracing::debug!(phase = ?OrchestratorPhase::Running, task_count = plan.tasks.len(), "running plan");
        let topology = plan
            .tasks
            .first()
            .map(|t| t.topology_hint)
            .unwrap_or(TopologyHint::Sequential);

        let runner = OrchestratorRunner {
            providers: self.providers,
            breakers: self.breakers,
            limiter: self.limiter,
            dispatcher: self.dispatcher,
            tiers: self.tiers,
            tool_names: self.dispatcher.tool_names(),
            max_act_iterations: self.config.max_act_iterations,
            max_task_tokens: self.config.context_budget.context_budget_tokens,
            system_context: system_context.to_string(),
            recovery: self.recovery,
            diagnoser: self.diagnoser,
        };

        let run_cancel = cancel.child();
        let executor = TopologyExecutor::new(self.config.max_parallel_tasks, self.config.cancel_siblings_on_failure);
        let outcomes = executor.execute(&mut plan, topology, &runner, &run_cancel).await;

        tracing::debug!(phase = ?OrchestratorPhase::Aggregating, "aggregating task outcomes");
        let summary = topology::aggregate_summary(&outcomes);

        tracing::debug!(phase = ?OrchestratorPhase::Done, %summary, "run complete");
        Ok(OrchestratorOutcome {
            plan,
            task_outcomes: outcomes,
            summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerRegistry, RateLimiter};
    use crate::classifier::{IntentClassifier, NoModel};
    use crate::config::{BreakerConfig, KernelConfig, RateLimitConfig};
    use crate::dispatcher::ToolDispatcher;
    use crate::model::{ApprovalDecisionKind, Complexity};
    use crate::provider_client::KernelProviderClient;
    use crate::safety::SafetyGate;
    use async_trait::async_trait;
    use sa_domain::capability::LlmCapabilities;
    use sa_domain::error::Result as DomainResult;
    use sa_domain::stream::{BoxStream, StreamEvent, Usage};
    use sa_providers::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};

    struct TextStreamProvider {
        capabilities: LlmCapabilities,
        text: &'static str,
    }
    #[async_trait]
    impl LlmProvider for TextStreamProvider {
        async fn chat(&self, _req: ChatRequest) -> DomainResult<ChatResponse> {
            unimplemented!()
        }
        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> DomainResult<BoxStream<'static, DomainResult<StreamEvent>>> {
            use futures_util::stream;
            let events = vec![
                Ok(StreamEvent::Token { text: self.text.to_string() }),
                Ok(StreamEvent::Done {
                    usage: Some(Usage { prompt_tokens: 5, completion_tokens: 5, total_tokens: 10 }),
                    finish_reason: Some("stop".into()),
                }),
            ];
            Ok(Box::pin(stream::iter(events)))
        }
        async fn embeddings(&self, _req: EmbeddingsRequest) -> DomainResult<EmbeddingsResponse> {
            unimplemented!()
        }
        fn capabilities(&self) -> &LlmCapabilities {
            &self.capabilities
        }
        fn provider_id(&self) -> &str {
            "stub"
        }
    }

    struct StubSource;
    impl ProviderSource for StubSource {
        fn client_for(&self, provider_id: &str) -> Option<Arc<KernelProviderClient>> {
            Some(Arc::new(KernelProviderClient::new(
                provider_id,
                Arc::new(TextStreamProvider {
                    capabilities: LlmCapabilities { context_window_tokens: Some(100_000), ..Default::default() },
                    text: "done",
                }),
            )))
        }
    }

    struct RejectEverything;
    #[async_trait]
    impl ApprovalCallback for RejectEverything {
        async fn request_approval(&self, plan: &Plan) -> Approval {
            Approval {
                plan_id: plan.id.clone(),
                decision: ApprovalDecisionKind::Reject,
                edited_plan: None,
                requester_identity: "test-reviewer".into(),
            }
        }
    }

    fn tiers() -> sa_domain::config::TierConfig {
        sa_domain::config::TierConfig {
            simple: vec!["stub/model-a".into()],
            ..Default::default()
        }
    }

    fn fixtures() -> (BreakerRegistry, RateLimiter, ToolDispatcher, IntentClassifier) {
        (
            BreakerRegistry::new(BreakerConfig::default()),
            RateLimiter::new(RateLimitConfig::default()),
            ToolDispatcher::new(Arc::new(SafetyGate::new(KernelConfig::default()))),
            IntentClassifier::new(Box::new(NoModel)),
        )
    }

    #[tokio::test]
    async fn atomic_request_runs_without_approval_and_returns_a_summary() {
        let (breakers, limiter, dispatcher, classifier) = fixtures();
        let source = StubSource;
        let tiers = tiers();
        let config = KernelConfig::default();

        let orchestrator = Orchestrator {
            classifier: &classifier,
            providers: &source,
            breakers: &breakers,
            limiter: &limiter,
            dispatcher: &dispatcher,
            tiers: &tiers,
            config: &config,
            recovery: None,
            diagnoser: None,
        };

        let request = Request::new("explain this function", "/tmp");
        let cancel = CancelToken::new();
        let outcome = orchestrator
            .run(request, &AutoApprove, "", &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.task_outcomes.len(), 1);
        assert_eq!(outcome.summary, "1 succeeded, 0 failed, 0 skipped");
    }

    #[tokio::test]
    async fn compound_request_requires_approval_and_rejection_cancels_the_run() {
        let (breakers, limiter, dispatcher, classifier) = fixtures();
        let source = StubSource;
        let tiers = tiers();
        let config = KernelConfig::default();

        let orchestrator = Orchestrator {
            classifier: &classifier,
            providers: &source,
            breakers: &breakers,
            limiter: &limiter,
            dispatcher: &dispatcher,
            tiers: &tiers,
            config: &config,
            recovery: None,
            diagnoser: None,
        };

        let request = Request::new("design the schema and then implement the migration", "/tmp");
        let cancel = CancelToken::new();
        let result = orchestrator.run(request, &RejectEverything, "", &cancel).await;

        assert!(matches!(result, Err(KernelError::CancelledByUser)));
    }

    #[tokio::test]
    async fn compound_request_proceeds_when_approved() {
        let (breakers, limiter, dispatcher, classifier) = fixtures();
        let source = StubSource;
        let tiers = tiers();
        let config = KernelConfig::default();

        let orchestrator = Orchestrator {
            classifier: &classifier,
            providers: &source,
            breakers: &breakers,
            limiter: &limiter,
            dispatcher: &dispatcher,
            tiers: &tiers,
            config: &config,
            recovery: None,
            diagnoser: None,
        };

        let request = Request::new("design the schema and then implement the migration", "/tmp");
        let cancel = CancelToken::new();
        let outcome = orchestrator
            .run(request, &AutoApprove, "", &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.task_outcomes.len(), 2);
        assert!(outcome.plan.approved);
    }

    #[tokio::test]
    async fn already_cancelled_run_never_starts_executing_tasks() {
        let (breakers, limiter, dispatcher, classifier) = fixtures();
        let source = StubSource;
        let tiers = tiers();
        let config = KernelConfig::default();

        let orchestrator = Orchestrator {
            classifier: &classifier,
            providers: &source,
            breakers: &breakers,
            limiter: &limiter,
            dispatcher: &dispatcher,
            tiers: &tiers,
            config: &config,
            recovery: None,
            diagnoser: None,
        };

        let request = Request::new("explain this function", "/tmp");
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = orchestrator.run(request, &AutoApprove, "", &cancel).await;

        assert!(matches!(result, Err(KernelError::Cancelled)));
    }
}
