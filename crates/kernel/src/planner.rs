//! Task decomposer / planner (C11): `(Request, Intent) -> Plan`.
//!
//! No teacher file builds a multi-task DAG from free text — the closest
//! analogue is `gateway/src/runtime/agent.rs`'s single-agent-per-request
//! shape, which this generalizes by adding a verb-composition split for
//! compound requests. Verb splitting and the sequential/parallel/hybrid
//! topology choice are new to this crate's domain; `model::Plan`'s DAG
//! validation (already built) is reused unchanged as the structural check
//! after decomposition.

use crate::model::{AgentKind, Complexity, Intent, IntentKind, Plan, Request, Task, TopologyHint};

/// Conjunctions that join independent verb phrases in a compound request,
/// checked in order so the first split found wins.
const COMPOSITE_SPLIT_MARKERS: &[&str] = &[" and then ", " then ", " and "];

/// A request counts as atomic when it contains no composite-verb marker
/// at the top level. This is intentionally conservative — under-splitting
/// a compound request still produces a working (if coarser) single task,
/// while over-splitting a genuinely atomic request fragments it into
/// dependent no-op subtasks.
fn split_composite_clauses(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    for marker in COMPOSITE_SPLIT_MARKERS {
        if lower.matches(marker).count() >= 1 {
            let clauses: Vec<String> = split_on_marker(text, marker)
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            if clauses.len() > 1 {
                return clauses;
            }
        }
    }
    vec![text.trim().to_string()]
}

fn split_on_marker(text: &str, marker: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut parts = Vec::new();
    let mut rest = text;
    let mut rest_lower = lower.as_str();
    while let Some(idx) = rest_lower.find(marker) {
        parts.push(rest[..idx].to_string());
        rest = &rest[idx + marker.len()..];
        rest_lower = &rest_lower[idx + marker.len()..];
    }
    parts.push(rest.to_string());
    parts
}

/// Per-clause verb keywords, checked in order, first match wins. Used
/// only when a request splits into multiple clauses — §4.11 calls for
/// attaching "the right agent_kind to each subtask" once verbs compose,
/// rather than stamping every subtask with the same agent the way a
/// single-task plan does.
const CLAUSE_AGENT_KEYWORDS: &[(&str, AgentKind)] = &[
    ("design", AgentKind::Architect),
    ("architect", AgentKind::Architect),
    ("plan", AgentKind::Architect),
    ("test", AgentKind::Tester),
    ("review", AgentKind::Reviewer),
    ("explain", AgentKind::Explainer),
    ("document", AgentKind::Explainer),
    ("explore", AgentKind::Explorer),
    ("investigate", AgentKind::Explorer),
    ("implement", AgentKind::Coder),
    ("build", AgentKind::Coder),
    ("write", AgentKind::Coder),
    ("fix", AgentKind::Coder),
    ("refactor", AgentKind::Coder),
    ("migrate", AgentKind::Coder),
];

fn agent_kind_for_clause(clause: &str, default: AgentKind) -> AgentKind {
    let lower = clause.to_lowercase();
    CLAUSE_AGENT_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, kind)| *kind)
        .unwrap_or(default)
}

/// Assign a complexity to one decomposed clause. A crude proxy: longer,
/// multi-sentence clauses or ones naming cross-cutting concerns
/// (security, migration, architecture) escalate above `Simple`.
fn estimate_clause_complexity(clause: &str, intent_kind: IntentKind) -> Complexity {
    let lower = clause.to_lowercase();
    if matches!(intent_kind, IntentKind::Security) || lower.contains("production") || lower.contains("irreversible") {
        return Complexity::Critical;
    }
    let word_count = clause.split_whitespace().count();
    if word_count > 25 || lower.contains("architecture") || lower.contains("migrate") {
        Complexity::Complex
    } else if word_count > 10 {
        Complexity::Moderate
    } else {
        Complexity::Simple
    }
}

/// Build a Plan from a request and its classified intent, per §4.11.
pub fn plan(request: &Request, intent: &Intent) -> Plan {
    let clauses = split_composite_clauses(&request.text);
    let default_agent = AgentKind::from_intent(intent.kind);

    if clauses.len() <= 1 {
        let complexity = estimate_clause_complexity(&request.text, intent.kind);
        let mut task = Task::new(request.text.clone(), default_agent, complexity);
        task.topology_hint = TopologyHint::Sequential;
        return Plan::new(vec![task]);
    }

    let mut tasks = Vec::with_capacity(clauses.len());
    let mut previous_id: Option<String> = None;
    for clause in &clauses {
        let complexity = estimate_clause_complexity(clause, intent.kind);
        let agent_kind = agent_kind_for_clause(clause, default_agent);
        let mut task = Task::new(clause.clone(), agent_kind, complexity);
        if let Some(prev) = &previous_id {
            task.dependencies.insert(prev.clone());
        }
        previous_id = Some(task.id.clone());
        tasks.push(task);
    }

    // A chain of sequential dependencies (each depends on the one before
    // it) is the only shape `split_composite_clauses` currently produces,
    // so the DAG is always sequential here. `hybrid`/`parallel` plans
    // require dependency analysis this module doesn't yet perform when
    // clauses are independent rather than ordered — left for a
    // coordinator-assisted decomposition (see Open Questions).
    let topology_hint = TopologyHint::Sequential;
    for task in tasks.iter_mut() {
        task.topology_hint = topology_hint;
    }

    Plan::new(tasks)
}

/// §4.11's plan gating rule: a multi-task plan or any critical task
/// requires an Approval before execution.
pub fn requires_approval(plan: &Plan, plan_gating_threshold: usize) -> bool {
    plan.tasks.len() >= plan_gating_threshold || plan.contains_critical()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(kind: IntentKind) -> Intent {
        Intent { kind, confidence: 0.8, reasoning: "test".into() }
    }

    #[test]
    fn atomic_request_produces_single_task_plan() {
        let request = Request::new("fix the typo in the readme", "/tmp");
        let p = plan(&request, &intent(IntentKind::Coding));
        assert_eq!(p.tasks.len(), 1);
        assert!(p.validate_dag().is_ok());
    }

    #[test]
    fn compound_request_splits_along_verbs() {
        let request = Request::new("design the schema and implement the migration and test it", "/tmp");
        let p = plan(&request, &intent(IntentKind::Coding));
        assert!(p.tasks.len() >= 2);
        assert!(p.validate_dag().is_ok());
    }

    #[test]
    fn later_clauses_depend_on_earlier_ones() {
        let request = Request::new("write the parser and add tests", "/tmp");
        let p = plan(&request, &intent(IntentKind::Coding));
        assert_eq!(p.tasks.len(), 2);
        assert!(p.tasks[1].dependencies.contains(&p.tasks[0].id));
    }

    #[test]
    fn security_intent_escalates_to_critical() {
        let request = Request::new("patch the auth bypass", "/tmp");
        let p = plan(&request, &intent(IntentKind::Security));
        assert_eq!(p.tasks[0].complexity, Complexity::Critical);
    }

    #[test]
    fn gating_required_for_multi_task_plan() {
        let request = Request::new("design it and implement it", "/tmp");
        let p = plan(&request, &intent(IntentKind::Coding));
        assert!(requires_approval(&p, 2));
    }

    #[test]
    fn gating_not_required_for_small_noncritical_plan() {
        let request = Request::new("explain this function", "/tmp");
        let p = plan(&request, &intent(IntentKind::Explain));
        assert!(!requires_approval(&p, 2));
    }

    #[test]
    fn gating_required_when_any_task_is_critical_even_if_plan_is_small() {
        let request = Request::new("rotate the production credentials", "/tmp");
        let p = plan(&request, &intent(IntentKind::Security));
        assert!(requires_approval(&p, 10));
    }
}
