//! Context window manager (C7): token accounting, high-water detection,
//! and the three-step compaction procedure.
//!
//! Grounded on `sa_domain::config::{PruningConfig, CompactionConfig}`,
//! reused as-is for the budget/ratio knobs (`soft_trim_ratio`/
//! `hard_clear_ratio`, `max_turns`/`keep_last_turns`). No compaction
//! *algorithm* file exists in the retrieval pack — `gateway/src/runtime/
//! compact.rs` is referenced by `turn.rs` but is itself a thin LLM-backed
//! summarizer call, which this module also delegates to via a
//! `Summarizer` trait rather than hard-coding a prompt here.

use std::collections::VecDeque;

use crate::estimator::estimate_tokens;
use crate::model::{Turn, TurnRole};

/// A compacted slice of history, replacing a contiguous run of evicted
/// turns. Mirrors §3's `ContextWindow.archived_summaries`.
#[derive(Debug, Clone)]
pub struct Summary {
    pub covers_turn_ids: Vec<u64>,
    pub text: String,
    pub token_estimate: u32,
}

/// Delegate that turns a batch of turns into a short summary. The kernel
/// doesn't own prompt text for this — it's a lightweight LLM call through
/// the C1 facade, matching `gateway/src/runtime/compact.rs`'s shape.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, turns: &[Turn]) -> Summary;
}

/// A summarizer that never calls out to a model; used when no LLM-backed
/// summarizer is configured (tests, or a run with summarization disabled).
/// It still produces a token-bounded placeholder, it just isn't semantic.
pub struct PlaceholderSummarizer;

impl Summarizer for PlaceholderSummarizer {
    fn summarize(&self, turns: &[Turn]) -> Summary {
        let covers_turn_ids = turns.iter().map(|t| t.id).collect();
        let text = format!("[{} turns summarized]", turns.len());
        let token_estimate = estimate_tokens(&text);
        Summary {
            covers_turn_ids,
            text,
            token_estimate,
        }
    }
}

pub struct ContextWindow {
    pub max_input_tokens: u32,
    pub reserve_for_response: u32,
    pub high_water: f64,
    pub max_live_turns: usize,
    pub live_turns: VecDeque<Turn>,
    pub pinned_turns: std::collections::HashSet<u64>,
    pub archived_summaries: Vec<Summary>,
}

impl ContextWindow {
    pub fn new(max_input_tokens: u32, reserve_for_response: u32, high_water: f64, max_live_turns: usize) -> Self {
        Self {
            max_input_tokens,
            reserve_for_response,
            high_water,
            max_live_turns,
            live_turns: VecDeque::new(),
            pinned_turns: std::collections::HashSet::new(),
            archived_summaries: Vec::new(),
        }
    }

    pub fn context_budget(&self) -> u32 {
        self.max_input_tokens.saturating_sub(self.reserve_for_response)
    }

    pub fn live_tokens(&self) -> u64 {
        self.live_turns.iter().map(|t| t.token_estimate as u64).sum()
    }

    pub fn pin(&mut self, turn_id: u64) {
        self.pinned_turns.insert(turn_id);
    }

    pub fn push(&mut self, turn: Turn) {
        self.live_turns.push_back(turn);
    }

    /// §4.7: "On every new turn, if live_tokens > context_budget *
    /// high_water, run compaction before the next request."
    pub fn needs_compaction(&self) -> bool {
        self.live_tokens() as f64 > self.context_budget() as f64 * self.high_water
            || self.live_turns.len() > self.max_live_turns
    }

    /// Step 1: drop oversized tool results older than `keep_last` turns,
    /// replacing them with a short placeholder.
    fn drop_stale_tool_results(&mut self, keep_last: usize, size_threshold: usize) -> bool {
        let cutoff = self.live_turns.len().saturating_sub(keep_last);
        let mut changed = false;
        for (idx, turn) in self.live_turns.iter_mut().enumerate() {
            if idx >= cutoff {
                break;
            }
            if self.pinned_turns.contains(&turn.id) {
                continue;
            }
            if turn.role == TurnRole::Tool && turn.content.len() > size_threshold {
                turn.content = "[tool result archived to persistent store]".to_string();
                turn.token_estimate = estimate_tokens(&turn.content);
                changed = true;
            }
        }
        changed
    }

    /// Step 2: summarize the oldest contiguous non-pinned segment into a
    /// single `Summary` turn and remove it from `live_turns`.
    fn summarize_oldest_segment(&mut self, summarizer: &dyn Summarizer, segment_len: usize) -> bool {
        let mut segment = Vec::new();
        while segment.len() < segment_len {
            match self.live_turns.front() {
                Some(t) if !self.pinned_turns.contains(&t.id) => {
                    segment.push(self.live_turns.pop_front().unwrap());
                }
                _ => break,
            }
        }
        if segment.is_empty() {
            return false;
        }
        let summary = summarizer.summarize(&segment);
        self.archived_summaries.push(summary);
        true
    }

    /// Step 3: if still over budget, evict the oldest archived summaries
    /// entirely (they no longer even appear as a placeholder turn).
    fn evict_oldest_summaries(&mut self) -> bool {
        if self.archived_summaries.is_empty() {
            return false;
        }
        self.archived_summaries.remove(0);
        true
    }

    /// Run the three-step compaction procedure in order, stopping as soon
    /// as the target (the live-turn budget) is met. Pinned turns are
    /// never touched at any step.
    pub fn compact(&mut self, summarizer: &dyn Summarizer) {
        const KEEP_LAST_FOR_TOOL_DROP: usize = 5;
        const SIZE_THRESHOLD: usize = 2_000;
        const SEGMENT_LEN: usize = 8;

        if !self.needs_compaction() {
            return;
        }

        self.drop_stale_tool_results(KEEP_LAST_FOR_TOOL_DROP, SIZE_THRESHOLD);
        if !self.needs_compaction() {
            return;
        }

        while self.needs_compaction() {
            if self.summarize_oldest_segment(summarizer, SEGMENT_LEN) {
                continue;
            }
            break;
        }
        if !self.needs_compaction() {
            return;
        }

        while self.needs_compaction() {
            if !self.evict_oldest_summaries() {
                break;
            }
        }
    }

    /// §4.7: "the authoritative number is provider UsageUpdate, and the
    /// Window Manager reconciles estimates against it after each call."
    pub fn reconcile(&mut self, turn_id: u64, authoritative_tokens: u32) {
        if let Some(turn) = self.live_turns.iter_mut().find(|t| t.id == turn_id) {
            turn.token_estimate = authoritative_tokens;
        }
    }
}
