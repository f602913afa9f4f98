//! Safety gate (C6): L0/L1/L2 danger classification, approval workflow,
//! and the denylist.
//!
//! The `ApprovalStore`/`oneshot`-channel shape is lifted directly from
//! `gateway/src/runtime/approval.rs`'s exec approval workflow and
//! generalized from single commands to plan-level `Approval`s. The
//! teacher's store gates one thing (a shell command matching
//! `approval_patterns`); this gates any `DangerClass::L1`/`L2` tool call
//! or plan, and distinguishes two waiver mechanisms instead of one:
//! `auto_approve` (waives L1 only) and `yolo_mode` (the only way to waive
//! L2, and still never waives a denylist hit).
//!
//! A call's *declared* danger class is only a floor: `pattern_elevated_class`
//! bumps it to L2 whenever an argument touches a credential or VCS config
//! path (`.env`, `.ssh`, `.git/config`), independent of what the tool's
//! registered `ToolDescriptor` says. `check` folds the two via `max`, so
//! elevation only ever raises the effective class for this call, never
//! lowers it. Path-traversal segments in path-shaped arguments are caught
//! earlier, in `parser::reject_path_traversal`, before a call reaches here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::RegexSet;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::dispatcher::{DangerClass, ToolDescriptor};
use crate::error::{KernelError, Result};
use crate::model::ToolCall;

#[derive(Debug)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: Option<String> },
}

pub struct PendingApproval {
    pub id: Uuid,
    pub description: String,
    pub danger_class: DangerClass,
    pub created_at: DateTime<Utc>,
    pub respond: oneshot::Sender<ApprovalDecision>,
}

#[derive(Debug, Clone)]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl From<&PendingApproval> for ApprovalInfo {
    fn from(p: &PendingApproval) -> Self {
        Self {
            id: p.id,
            description: p.description.clone(),
            created_at: p.created_at,
        }
    }
}

/// Thread-safe store for pending approvals; identical shape to the
/// teacher's `ApprovalStore` but keyed by danger class rather than by
/// exec-command string.
pub struct ApprovalStore {
    pending: RwLock<HashMap<Uuid, PendingApproval>>,
    timeout: Duration,
}

impl ApprovalStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn insert(&self, approval: PendingApproval) -> ApprovalInfo {
        let info = ApprovalInfo::from(&approval);
        self.pending.write().insert(approval.id, approval);
        info
    }

    pub fn approve(&self, id: &Uuid) -> bool {
        if let Some(pending) = self.pending.write().remove(id) {
            let _ = pending.respond.send(ApprovalDecision::Approved);
            return true;
        }
        false
    }

    pub fn deny(&self, id: &Uuid, reason: Option<String>) -> bool {
        if let Some(pending) = self.pending.write().remove(id) {
            let _ = pending.respond.send(ApprovalDecision::Denied { reason });
            return true;
        }
        false
    }

    pub fn remove_expired(&self, id: &Uuid) {
        self.pending.write().remove(id);
    }

    pub fn list_pending(&self) -> Vec<ApprovalInfo> {
        self.pending.read().values().map(ApprovalInfo::from).collect()
    }
}

/// Compiled denylist: patterns that are never waivable, not even by
/// `yolo_mode`, matching `ExecSecurityConfig::denied_patterns`' defaults
/// (`rm -rf /`, `mkfs.`, `dd if=...of=/dev/`).
pub struct Denylist {
    set: RegexSet,
    patterns: Vec<String>,
}

impl Denylist {
    pub fn new(patterns: &[String]) -> Self {
        let set = RegexSet::new(patterns).unwrap_or_else(|_| RegexSet::empty());
        Self {
            set,
            patterns: patterns.to_vec(),
        }
    }

    pub fn default_patterns() -> Vec<String> {
        vec![
            r"rm\s+-rf\s+/".to_string(),
            r"mkfs\.".to_string(),
            r"dd\s+if=.+of=/dev/".to_string(),
        ]
    }

    pub fn matches(&self, haystack: &str) -> Option<&str> {
        self.set
            .matches(haystack)
            .iter()
            .next()
            .map(|i| self.patterns[i].as_str())
    }
}

/// Substrings that mark an argument as touching a credential or VCS
/// config file regardless of the tool's declared `danger_class`. A hit
/// elevates the call to L2 for this evaluation only — the registered
/// descriptor is never mutated.
const SENSITIVE_PATH_MARKERS: &[&str] = &[".env", ".ssh", ".git/config", ".git\\config"];

/// Pattern-based elevation (§4.6): a tool call touching a sensitive path
/// is always at least L2, no matter what its descriptor says. Combined
/// with `descriptor.danger_class` via `max` so elevation is monotonic —
/// it can only raise the effective class, never lower it.
fn pattern_elevated_class(call: &ToolCall) -> DangerClass {
    for value in call.arguments.values() {
        if let Some(s) = value.as_str() {
            if SENSITIVE_PATH_MARKERS.iter().any(|marker| s.contains(marker)) {
                return DangerClass::L2;
            }
        }
    }
    DangerClass::L0
}

pub struct SafetyGate {
    config: KernelConfig,
    denylist: Denylist,
    approvals: ApprovalStore,
    next_approval_seq: AtomicU64,
}

impl SafetyGate {
    pub fn new(config: KernelConfig) -> Self {
        let mut patterns = Denylist::default_patterns();
        patterns.extend(config.denylist_paths.iter().cloned());
        let timeout = Duration::from_secs(config.default_tool_deadline_secs.max(60));
        Self {
            config,
            denylist: Denylist::new(&patterns),
            approvals: ApprovalStore::new(timeout),
            next_approval_seq: AtomicU64::new(0),
        }
    }

    pub fn approvals(&self) -> &ApprovalStore {
        &self.approvals
    }

    fn haystack(call: &ToolCall) -> String {
        let mut s = call.tool_name.clone();
        for v in call.arguments.values() {
            if let Some(text) = v.as_str() {
                s.push(' ');
                s.push_str(text);
            }
        }
        s
    }

    /// Synchronous pre-check used by the dispatcher before invoking a
    /// handler: denylist hits are an unconditional refusal regardless of
    /// `yolo_mode`; other escalation is left to `gate` below, which can
    /// suspend the caller on a real approval.
    pub fn check(&self, descriptor: &ToolDescriptor, call: &ToolCall) -> Result<()> {
        let haystack = Self::haystack(call);
        if let Some(pattern) = self.denylist.matches(&haystack) {
            return Err(KernelError::PolicyBlocked(format!(
                "'{}' matches denylist pattern /{}/",
                call.tool_name, pattern
            )));
        }
        let effective_class = descriptor.danger_class.max(pattern_elevated_class(call));
        match effective_class {
            DangerClass::L0 => Ok(()),
            DangerClass::L1 => {
                if self.config.auto_approve || self.config.yolo_mode {
                    Ok(())
                } else {
                    Err(KernelError::PolicyBlocked(format!(
                        "'{}' requires approval (L1)",
                        call.tool_name
                    )))
                }
            }
            DangerClass::L2 => {
                // auto_approve alone never waives L2, elevated or not;
                // only yolo_mode does.
                if self.config.yolo_mode {
                    Ok(())
                } else if effective_class > descriptor.danger_class {
                    Err(KernelError::PolicyBlocked(format!(
                        "'{}' elevated to L2 by a sensitive-path pattern match",
                        call.tool_name
                    )))
                } else {
                    Err(KernelError::PolicyBlocked(format!(
                        "'{}' requires explicit approval (L2)",
                        call.tool_name
                    )))
                }
            }
        }
    }

    /// Full async gate: registers a pending approval and waits (bounded
    /// by the store's timeout) for a human decision, unless the call is
    /// already waived by `check`.
    pub async fn gate(&self, descriptor: &ToolDescriptor, call: &ToolCall) -> Result<()> {
        match self.check(descriptor, call) {
            Ok(()) => return Ok(()),
            Err(e @ KernelError::PolicyBlocked(ref msg)) if msg.contains("denylist") => {
                return Err(e);
            }
            Err(_) => {}
        }

        let (tx, rx) = oneshot::channel();
        let seq = self.next_approval_seq.fetch_add(1, Ordering::Relaxed);
        let id = Uuid::new_v4();
        let effective_class = descriptor.danger_class.max(pattern_elevated_class(call));
        let pending = PendingApproval {
            id,
            description: format!("[{seq}] {}", call.tool_name),
            danger_class: effective_class,
            created_at: Utc::now(),
            respond: tx,
        };
        self.approvals.insert(pending);

        match tokio::time::timeout(self.approvals.timeout(), rx).await {
            Ok(Ok(ApprovalDecision::Approved)) => Ok(()),
            Ok(Ok(ApprovalDecision::Denied { reason })) => Err(KernelError::PolicyBlocked(
                reason.unwrap_or_else(|| "denied by reviewer".to_string()),
            )),
            Ok(Err(_)) | Err(_) => {
                self.approvals.remove_expired(&id);
                Err(KernelError::ApprovalRejected)
            }
        }
    }
}
