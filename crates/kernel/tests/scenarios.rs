//! End-to-end scenario tests (S1-S6), one per concrete example in the
//! kernel's testable-properties write-up. Each test wires the same
//! handful of public kernel types (`Orchestrator`, `AgentKernel`,
//! `ToolDispatcher`, `SafetyGate`, `parser`) a host would, with stub
//! providers standing in for a real vendor call — matching the style of
//! `crates/providers/tests/router_integration.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sa_domain::capability::LlmCapabilities;
use sa_domain::error::{Error as DomainError, Result as DomainResult};
use sa_domain::stream::{BoxStream, StreamEvent, Usage};
use sa_kernel::agent_kernel::{AgentKernel, AgentKernelConfig, ProviderSource};
use sa_kernel::breaker::{BreakerRegistry, RateLimiter};
use sa_kernel::cancel::CancelToken;
use sa_kernel::config::{BreakerConfig, KernelConfig, RateLimitConfig};
use sa_kernel::classifier::{IntentClassifier, NoModel};
use sa_kernel::dispatcher::{DangerClass, ToolDescriptor, ToolDispatcher, ToolHandler};
use sa_kernel::error::{KernelError, Result};
use sa_kernel::model::{Agent, AgentKind, Complexity, Request, Task};
use sa_kernel::orchestrator::{ApprovalCallback, AutoApprove, Orchestrator};
use sa_kernel::safety::SafetyGate;
use sa_providers::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};

fn tiers_with(simple: &[&str]) -> sa_domain::config::TierConfig {
    sa_domain::config::TierConfig {
        simple: simple.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

struct TextStreamProvider {
    capabilities: LlmCapabilities,
    id: &'static str,
    text: &'static str,
}

#[async_trait]
impl LlmProvider for TextStreamProvider {
    async fn chat(&self, _req: ChatRequest) -> DomainResult<ChatResponse> {
        unimplemented!("these scenarios only exercise chat_stream")
    }
    async fn chat_stream(&self, _req: ChatRequest) -> DomainResult<BoxStream<'static, DomainResult<StreamEvent>>> {
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
        self.id
    }
}

fn caps() -> LlmCapabilities {
    LlmCapabilities { context_window_tokens: Some(100_000), ..Default::default() }
}

struct StubSource {
    text: &'static str,
}
impl ProviderSource for StubSource {
    fn client_for(&self, provider_id: &str) -> Option<Arc<sa_kernel::provider_client::KernelProviderClient>> {
        Some(Arc::new(sa_kernel::provider_client::KernelProviderClient::new(
            provider_id,
            Arc::new(TextStreamProvider { capabilities: caps(), id: "stub", text: self.text }),
        )))
    }
}

struct ListDirHandler;
#[async_trait]
impl ToolHandler for ListDirHandler {
    async fn invoke(&self, arguments: &HashMap<String, serde_json::Value>) -> Result<serde_json::Value> {
        let path = arguments.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        Ok(serde_json::json!({ "entries": [format!("{path}/lib.rs"), format!("{path}/main.rs")] }))
    }
}

fn list_dir_descriptor() -> ToolDescriptor {
    ToolDescriptor {
        name: "list_dir".into(),
        description: "lists a directory".into(),
        arg_schema: serde_json::json!({"required": ["path"]}),
        danger_class: DangerClass::L0,
        allowed_in_autonomous_mode: true,
        parallel_safe: true,
        deadline_secs: 5,
    }
}

fn dispatcher_with(tools: Vec<(ToolDescriptor, Arc<dyn ToolHandler>)>, config: KernelConfig) -> ToolDispatcher {
    let mut d = ToolDispatcher::new(Arc::new(SafetyGate::new(config)));
    for (desc, handler) in tools {
        d.register(desc, handler);
    }
    d
}

/// S1: "list files in src" -> explore intent, a single auto-approved L0
/// tool call, no plan-gating prompt, a successful run.
#[tokio::test]
async fn s1_list_files_runs_without_approval_and_succeeds() {
    let dispatcher = dispatcher_with(
        vec![(list_dir_descriptor(), Arc::new(ListDirHandler))],
        KernelConfig::default(),
    );
    let breakers = BreakerRegistry::new(BreakerConfig::default());
    let limiter = RateLimiter::new(RateLimitConfig::default());
    let classifier = IntentClassifier::new(Box::new(NoModel));
    let tiers = tiers_with(&["stub/model-a"]);
    let config = KernelConfig::default();
    let source = StubSource { text: "src/lib.rs\nsrc/main.rs" };

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

    let request = Request::new("list files in src", "/tmp/project");
    let cancel = CancelToken::new();
    let outcome = orchestrator.run(request, &AutoApprove, "", &cancel).await.unwrap();

    assert_eq!(outcome.task_outcomes.len(), 1, "atomic request produces exactly one task");
    assert!(!outcome.plan.tasks.is_empty());
    assert_eq!(outcome.summary, "1 succeeded, 0 failed, 0 skipped");
}

/// S2: "design and implement a rate-limited HTTP client" -> a two-task
/// plan (architect -> coder), plan gating fires, and accepting runs both
/// tasks to completion in dependency order.
#[tokio::test]
async fn s2_compound_request_gates_on_approval_then_runs_both_tasks() {
    let dispatcher = dispatcher_with(Vec::new(), KernelConfig::default());
    let breakers = BreakerRegistry::new(BreakerConfig::default());
    let limiter = RateLimiter::new(RateLimitConfig::default());
    let classifier = IntentClassifier::new(Box::new(NoModel));
    let tiers = tiers_with(&["stub/model-a"]);
    let config = KernelConfig::default();
    let source = StubSource { text: "done" };

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

    let request = Request::new("design and implement a rate-limited HTTP client", "/tmp/project");
    let cancel = CancelToken::new();
    let outcome = orchestrator.run(request, &AutoApprove, "", &cancel).await.unwrap();

    assert_eq!(outcome.task_outcomes.len(), 2, "compound verb request decomposes into two tasks");
    assert!(outcome.plan.approved);
    assert!(outcome.task_outcomes.iter().all(|t| t.status == sa_kernel::model::TaskStatus::Succeeded));

    struct RejectEverything;
    #[async_trait]
    impl ApprovalCallback for RejectEverything {
        async fn request_approval(&self, plan: &sa_kernel::model::Plan) -> sa_kernel::model::Approval {
            sa_kernel::model::Approval {
                plan_id: plan.id.clone(),
                decision: sa_kernel::model::ApprovalDecisionKind::Reject,
                edited_plan: None,
                requester_identity: "reviewer".into(),
            }
        }
    }
    let request2 = Request::new("design and implement a rate-limited HTTP client", "/tmp/project");
    let cancel2 = CancelToken::new();
    let rejected = orchestrator.run(request2, &RejectEverything, "", &cancel2).await;
    assert!(matches!(rejected, Err(KernelError::CancelledByUser)));
}

/// S3: a shell tool call classified L2 is refused outside yolo mode; no
/// handler ever runs.
#[tokio::test]
async fn s3_dangerous_shell_call_is_policy_blocked_without_yolo_mode() {
    struct PanicIfInvoked;
    #[async_trait]
    impl ToolHandler for PanicIfInvoked {
        async fn invoke(&self, _arguments: &HashMap<String, serde_json::Value>) -> Result<serde_json::Value> {
            panic!("an L2 call refused by the safety gate must never reach its handler");
        }
    }
    let shell_descriptor = ToolDescriptor {
        name: "shell_execute".into(),
        description: "runs an arbitrary shell command".into(),
        arg_schema: serde_json::json!({"required": ["command"]}),
        danger_class: DangerClass::L2,
        allowed_in_autonomous_mode: false,
        parallel_safe: false,
        deadline_secs: 30,
    };
    let dispatcher = dispatcher_with(
        vec![(shell_descriptor, Arc::new(PanicIfInvoked))],
        KernelConfig::default(),
    );

    let mut arguments = HashMap::new();
    arguments.insert("command".to_string(), serde_json::json!("rm -rf /"));
    let call = sa_kernel::model::ToolCall {
        call_id: "c1".into(),
        tool_name: "shell_execute".into(),
        arguments,
        origin_turn: 0,
    };

    let results = dispatcher.dispatch_turn(&[call]).await;
    assert_eq!(results.len(), 1);
    let (_, result) = &results[0];
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("denylist"));
}

/// S4: provider A fails transiently; the kernel fails over to provider B
/// within the same call and the task still succeeds.
#[tokio::test]
async fn s4_transient_failure_on_first_candidate_fails_over_to_the_next() {
    struct FlakyThenFixedSource;
    impl ProviderSource for FlakyThenFixedSource {
        fn client_for(&self, provider_id: &str) -> Option<Arc<sa_kernel::provider_client::KernelProviderClient>> {
            let provider: Arc<dyn LlmProvider> = if provider_id == "provider-a" {
                Arc::new(AlwaysTransientProvider { capabilities: caps() })
            } else {
                Arc::new(TextStreamProvider { capabilities: caps(), id: "provider-b", text: "handled by B" })
            };
            Some(Arc::new(sa_kernel::provider_client::KernelProviderClient::new(provider_id, provider)))
        }
    }
    struct AlwaysTransientProvider {
        capabilities: LlmCapabilities,
    }
    #[async_trait]
    impl LlmProvider for AlwaysTransientProvider {
        async fn chat(&self, _req: ChatRequest) -> DomainResult<ChatResponse> {
            unimplemented!()
        }
        async fn chat_stream(&self, _req: ChatRequest) -> DomainResult<BoxStream<'static, DomainResult<StreamEvent>>> {
            Err(DomainError::Provider { provider: "provider-a".into(), message: "503 upstream overloaded".into() })
        }
        async fn embeddings(&self, _req: EmbeddingsRequest) -> DomainResult<EmbeddingsResponse> {
            unimplemented!()
        }
        fn capabilities(&self) -> &LlmCapabilities {
            &self.capabilities
        }
        fn provider_id(&self) -> &str {
            "provider-a"
        }
    }

    let breakers = BreakerRegistry::new(BreakerConfig::default());
    let limiter = RateLimiter::new(RateLimitConfig::default());
    let dispatcher = dispatcher_with(Vec::new(), KernelConfig::default());
    let tiers = sa_domain::config::TierConfig {
        simple: vec!["provider-a/model-a".into(), "provider-b/model-b".into()],
        ..Default::default()
    };
    let source = FlakyThenFixedSource;

    let kernel = AgentKernel {
        providers: &source,
        breakers: &breakers,
        limiter: &limiter,
        dispatcher: &dispatcher,
        tiers: &tiers,
        config: AgentKernelConfig { max_act_iterations: 4, max_task_tokens: 10_000 },
        recovery: None,
        diagnoser: None,
    };
    let task = Task::new("investigate the outage", AgentKind::Explorer, Complexity::Simple);
    let agent = Agent {
        kind: AgentKind::Explorer,
        system_prompt_template: "You explore.".into(),
        allowed_tool_set: Vec::new(),
        temperature: 0.2,
        reasoning_hint: None,
    };
    let cancel = CancelToken::new();

    let outcome = kernel.run_task(&agent, &task, "", &cancel).await.unwrap();
    assert_eq!(outcome.final_text, "handled by B");

    // Provider A's breaker recorded the failure; it's still closed after
    // just one failure (threshold is 5 by default) but the failure count
    // moved off zero.
    let breaker_a = breakers.get_or_create("provider-a");
    assert_eq!(breaker_a.state(), sa_kernel::breaker::BreakerState::Closed);
}

/// S5: a conversation already past the high-water mark compacts before
/// its next request, keeping pinned turns and shrinking below budget.
#[tokio::test]
async fn s5_conversation_past_high_water_compacts_and_stays_under_budget() {
    use chrono::Utc;
    use sa_kernel::context_window::{ContextWindow, PlaceholderSummarizer};
    use sa_kernel::model::{Turn, TurnRole};

    fn turn(id: u64, role: TurnRole, content: impl Into<String>, tokens: u32) -> Turn {
        Turn {
            id,
            role,
            content: content.into(),
            tool_call: None,
            tool_result: None,
            token_estimate: tokens,
            timestamp: Utc::now(),
        }
    }

    // reserve_for_response=200 against a 1000-token window leaves an
    // 800-token budget; high_water of 0.8 means compaction should kick in
    // once live tokens cross 640.
    let mut window = ContextWindow::new(1_000, 200, 0.8, 1_000);
    let system_turn = turn(1, TurnRole::User, "project context", 50);
    window.pin(system_turn.id);
    window.push(system_turn);
    for i in 0..30u64 {
        window.push(turn(i + 2, TurnRole::Assistant, format!("turn {i} filler content"), 40));
    }

    assert!(window.live_tokens() as f64 > window.context_budget() as f64 * 0.8);
    assert!(window.needs_compaction());

    window.compact(&PlaceholderSummarizer);

    assert!(
        window.live_tokens() <= window.context_budget() as u64,
        "compaction must bring live tokens back under budget when it is possible to do so"
    );
    assert!(
        window.live_turns.iter().any(|t| t.content.contains("project context")),
        "pinned turns survive compaction"
    );
}

/// S6: a path-traversal argument on a sensitive read is rejected by the
/// parser before any tool ever runs, and never reaches recovery.
#[tokio::test]
async fn s6_path_traversal_argument_is_rejected_before_dispatch() {
    let response = ChatResponse {
        content: String::new(),
        tool_calls: vec![sa_domain::tool::ToolCall {
            call_id: "c1".into(),
            tool_name: "read_file".into(),
            arguments: serde_json::json!({"path": "../../etc/passwd"}),
        }],
        usage: None,
        model: "stub/model-a".into(),
        finish_reason: Some("tool_calls".into()),
    };

    let parsed = sa_kernel::parser::parse(&response, 0);
    assert!(matches!(
        parsed,
        Err(sa_kernel::parser::ParseError::PathTraversal { ref tool, ref arg })
            if tool == "read_file" && arg == "path"
    ));

}
