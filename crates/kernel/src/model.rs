//! Shared vocabulary for the orchestration kernel: Request, Intent, Task,
//! Plan, Turn, Conversation, ToolCall, ToolResult, Provider, CircuitState,
//! Agent, Approval.
//!
//! These are pure data types; behavior lives in the owning modules
//! (`planner`, `topology`, `conversation`, `breaker`, `safety`).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Intent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub text: String,
    pub working_dir: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub arrived_at: DateTime<Utc>,
}

impl Request {
    pub fn new(text: impl Into<String>, working_dir: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            working_dir: working_dir.into(),
            attachments: Vec::new(),
            arrived_at: Utc::now(),
        }
    }
}

/// The classified intent of a request. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Planning,
    Coding,
    Review,
    Explore,
    Test,
    Refactor,
    Explain,
    Docs,
    Security,
    Performance,
    Data,
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f32,
    pub reasoning: String,
}

impl Intent {
    /// Boundary behavior (§8): an empty request classifies as chat with
    /// full confidence.
    pub fn empty_request() -> Self {
        Self {
            kind: IntentKind::Chat,
            confidence: 1.0,
            reasoning: "empty request".into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed variant set of agent kinds, replacing dynamic dispatch on agent
/// "type" with a fixed enum carrying its own template + tool set (see
/// SPEC_FULL.md §9, "Dynamic dispatch on agent types").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Architect,
    Coder,
    Explorer,
    Reviewer,
    Tester,
    Explainer,
    Generalist,
}

impl AgentKind {
    /// Pick the default agent for a single-task plan from its intent.
    pub fn from_intent(kind: IntentKind) -> Self {
        match kind {
            IntentKind::Planning => AgentKind::Architect,
            IntentKind::Coding | IntentKind::Refactor | IntentKind::Performance => {
                AgentKind::Coder
            }
            IntentKind::Review | IntentKind::Security => AgentKind::Reviewer,
            IntentKind::Explore | IntentKind::Data => AgentKind::Explorer,
            IntentKind::Test => AgentKind::Tester,
            IntentKind::Explain | IntentKind::Docs => AgentKind::Explainer,
            IntentKind::Chat => AgentKind::Generalist,
        }
    }
}

/// Stateless agent definition; state lives in the owning `Conversation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub kind: AgentKind,
    pub system_prompt_template: String,
    pub allowed_tool_set: Vec<String>,
    pub temperature: f32,
    pub reasoning_hint: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task / Plan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyHint {
    Sequential,
    Parallel,
    Hybrid,
    Centralized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub agent_kind: AgentKind,
    pub complexity: Complexity,
    #[serde(default)]
    pub dependencies: HashSet<String>,
    pub topology_hint: TopologyHint,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        description: impl Into<String>,
        agent_kind: AgentKind,
        complexity: Complexity,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            agent_kind,
            complexity,
            dependencies: HashSet::new(),
            topology_hint: TopologyHint::Sequential,
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// Transition to `Running`. Callers must only call this from `Pending`
    /// (invariant 2, §8: every task transitions status exactly once from
    /// pending; terminal statuses are stable).
    pub fn start(&mut self) {
        debug_assert_eq!(self.status, TaskStatus::Pending);
        self.status = TaskStatus::Running;
    }

    pub fn succeed(&mut self, result: impl Into<String>) {
        self.status = TaskStatus::Succeeded;
        self.result = Some(result.into());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
    }

    pub fn skip(&mut self) {
        self.status = TaskStatus::Skipped;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// An ordered sequence of tasks with the DAG relation. Immutable once
/// approved; any mutation before approval must create a new `Plan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub tasks: Vec<Task>,
    pub approved: bool,
}

impl Plan {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tasks,
            approved: false,
        }
    }

    /// Invariant 3, §8: the dependency relation is acyclic and every
    /// referenced id exists.
    pub fn validate_dag(&self) -> Result<(), String> {
        let ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    ));
                }
            }
        }
        if has_cycle(&self.tasks) {
            return Err("plan dependency graph contains a cycle".into());
        }
        Ok(())
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn contains_critical(&self) -> bool {
        self.tasks.iter().any(|t| t.complexity == Complexity::Critical)
    }
}

fn has_cycle(tasks: &[Task]) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; tasks.len()];

    fn visit(
        i: usize,
        tasks: &[Task],
        index: &HashMap<&str, usize>,
        marks: &mut Vec<Mark>,
    ) -> bool {
        match marks[i] {
            Mark::Done => return false,
            Mark::InProgress => return true,
            Mark::Unvisited => {}
        }
        marks[i] = Mark::InProgress;
        for dep in &tasks[i].dependencies {
            if let Some(&di) = index.get(dep.as_str()) {
                if visit(di, tasks, index, marks) {
                    return true;
                }
            }
        }
        marks[i] = Mark::Done;
        false
    }

    for i in 0..tasks.len() {
        if visit(i, tasks, &index, &mut marks) {
            return true;
        }
    }
    false
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn / Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: u64,
    pub role: TurnRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    pub token_estimate: u32,
    pub timestamp: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolCall / ToolResult
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: HashMap<String, serde_json::Value>,
    pub origin_turn: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ToolResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecisionKind {
    Accept,
    Reject,
    Edit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub plan_id: String,
    pub decision: ApprovalDecisionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_plan: Option<Plan>,
    pub requester_identity: String,
}
