//! Provider-agnostic token estimator (§4.7: "Token estimates come from a
//! provider-agnostic estimator; the Window Manager is advisory — the
//! authoritative number is provider `UsageUpdate`").
//!
//! No teacher file estimates tokens pre-call (the gateway only records
//! the provider's reported usage post-call, in `turn.rs`). This is a
//! simple chars-per-token heuristic, swappable per SPEC_FULL.md's open
//! question about estimator granularity — the exact ratio doesn't matter
//! since every estimate is reconciled against authoritative usage.

/// Average characters per token across English prose and code, close
/// enough to common tokenizer behavior (~4 chars/token) for budgeting
/// purposes without depending on a vendor-specific tokenizer crate.
const CHARS_PER_TOKEN: f64 = 4.0;

pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    ((text.chars().count() as f64) / CHARS_PER_TOKEN).ceil() as u32
}
