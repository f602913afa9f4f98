//! Conversation / turn log (C8): the append-only, in-memory turn history
//! backing a single run, with an optional durable sink.
//!
//! Grounded on the append-only-JSONL persistence contract `sa_sessions::
//! transcript::TranscriptWriter` implements one layer up (one line per
//! turn, never rewritten) — this module keeps the live turn list the
//! kernel reasons about in memory (`ContextWindow` consumes it directly)
//! and forwards a flattened copy to a `PersistenceSink` trait rather than
//! linking against `sa-sessions` directly, so `sa-kernel` has no opinion
//! on `sa-sessions`'s on-disk layout or session id scheme. A host binary
//! wanting durable turns implements `PersistenceSink` on top of
//! `TranscriptWriter`.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{KernelError, Result};
use crate::estimator::estimate_tokens;
use crate::model::{Turn, TurnRole};

/// Abstraction over "where turns get written for durability". The kernel
/// crate has no opinion on session ids or file layout; a host binary
/// implements this on top of `sa_sessions::transcript::TranscriptWriter`.
pub trait PersistenceSink: Send + Sync {
    fn persist(&self, turn: &Turn) -> Result<()>;
}

/// No-op sink for runs that don't need durability (tests, ephemeral chat).
pub struct NullSink;

impl PersistenceSink for NullSink {
    fn persist(&self, _turn: &Turn) -> Result<()> {
        Ok(())
    }
}

/// Append-only turn log for one conversation. `Conversation` never
/// rewrites or reorders a turn once appended — the only mutation is
/// truncation by `ContextWindow` compaction, which operates on a copy of
/// the live tail, not on this log.
pub struct Conversation {
    id: String,
    turns: RwLock<Vec<Turn>>,
    next_turn_id: AtomicU64,
    sink: Box<dyn PersistenceSink>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_sink(id, Box::new(NullSink))
    }

    pub fn with_sink(id: impl Into<String>, sink: Box<dyn PersistenceSink>) -> Self {
        Self {
            id: id.into(),
            turns: RwLock::new(Vec::new()),
            next_turn_id: AtomicU64::new(1),
            sink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a new turn, assigning it the next monotonic id and an
    /// estimated token count if the caller hasn't already computed one.
    /// Persists synchronously; a persistence failure is surfaced but the
    /// turn remains in the live log (durability is best-effort, the
    /// in-memory log is authoritative for the running conversation).
    pub fn append(
        &self,
        role: TurnRole,
        content: impl Into<String>,
        tool_call: Option<crate::model::ToolCall>,
        tool_result: Option<crate::model::ToolResult>,
    ) -> Result<Turn> {
        let content = content.into();
        let id = self.next_turn_id.fetch_add(1, Ordering::SeqCst);
        let turn = Turn {
            id,
            role,
            token_estimate: estimate_tokens(&content),
            content,
            tool_call,
            tool_result,
            timestamp: chrono::Utc::now(),
        };
        self.turns.write().push(turn.clone());
        self.sink.persist(&turn)?;
        Ok(turn)
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.read().clone()
    }

    pub fn len(&self) -> usize {
        self.turns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last assistant turn's text, used by the recovery engine and the
    /// intent classifier when they need "what did we last say" without
    /// replaying the whole log.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.turns
            .read()
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::Assistant)
            .map(|t| t.content.clone())
    }

    /// Remove turns by id (used by `ContextWindow::compact` to reflect a
    /// summarization decision back onto the authoritative log). Pinned or
    /// unknown ids are silently ignored.
    pub fn replace_with_summary(&self, covered_ids: &[u64], summary_text: &str) -> Result<()> {
        if covered_ids.is_empty() {
            return Err(KernelError::Internal("cannot summarize an empty turn range".into()));
        }
        let mut turns = self.turns.write();
        let first_idx = turns
            .iter()
            .position(|t| t.id == covered_ids[0])
            .ok_or_else(|| KernelError::Internal("summary covers an unknown turn id".into()))?;
        turns.retain(|t| !covered_ids.contains(&t.id));
        let summary_turn = Turn {
            id: covered_ids[0],
            role: TurnRole::Assistant,
            token_estimate: estimate_tokens(summary_text),
            content: summary_text.to_string(),
            tool_call: None,
            tool_result: None,
            timestamp: chrono::Utc::now(),
        };
        let insert_at = first_idx.min(turns.len());
        turns.insert(insert_at, summary_turn);
        Ok(())
    }
}
