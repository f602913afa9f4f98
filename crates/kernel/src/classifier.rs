//! Intent classifier (C10): request -> `Intent`, two implementations
//! behind one interface.
//!
//! Grounded on `sa_providers::classifier`'s embedding/cosine-similarity
//! shape for the model-based path (a small call against a cheap
//! endpoint, reference-prompt centroids precomputed once) and on
//! `sa_providers::smart_router`'s keyword-scoring fallback for when no
//! embedding endpoint is reachable. Re-targeted from the teacher's three
//! `ModelTier`s onto the twelve `IntentKind`s this kernel plans against.

use std::collections::HashMap;

use crate::model::{Intent, IntentKind, Request};

/// Delegate for the model-based path: a small LLM call returning a
/// structured label + confidence. A host wires this to the C1 facade
/// against a fast/cheap model role; this module owns only the fallback
/// decision, not the HTTP/streaming mechanics.
#[async_trait::async_trait]
pub trait IntentModel: Send + Sync {
    async fn classify(&self, request: &Request) -> Option<Intent>;
}

/// A model delegate that's never configured (LLM classification
/// disabled); `IntentClassifier` falls through to the heuristic
/// immediately, matching §4.10's "used when LLM is unavailable".
pub struct NoModel;

#[async_trait::async_trait]
impl IntentModel for NoModel {
    async fn classify(&self, _request: &Request) -> Option<Intent> {
        None
    }
}

/// Keyword scoring with word-boundary matching, one keyword set per
/// `IntentKind`. Ties break toward the first kind in `IntentKind`'s
/// declaration order for determinism (mirrors `smart_router`'s
/// stable-order tie-break for equal scores).
fn keyword_table() -> Vec<(IntentKind, &'static [&'static str])> {
    vec![
        (IntentKind::Planning, &["plan", "design", "architecture", "approach", "roadmap"]),
        (IntentKind::Coding, &["implement", "add", "write", "build", "create", "fix", "code"]),
        (IntentKind::Review, &["review", "critique", "look over", "feedback on", "pr"]),
        (IntentKind::Explore, &["explore", "find", "where is", "locate", "search for"]),
        (IntentKind::Test, &["test", "unit test", "coverage", "assert", "spec"]),
        (IntentKind::Refactor, &["refactor", "clean up", "restructure", "simplify", "rename"]),
        (IntentKind::Explain, &["explain", "what does", "how does", "walk me through", "clarify"]),
        (IntentKind::Docs, &["document", "docstring", "readme", "comment", "docs"]),
        (IntentKind::Security, &["vulnerability", "security", "exploit", "cve", "sanitize"]),
        (IntentKind::Performance, &["optimize", "performance", "slow", "latency", "benchmark"]),
        (IntentKind::Data, &["query", "dataset", "migration", "schema", "sql"]),
        (IntentKind::Chat, &["hello", "hi ", "thanks", "thank you"]),
    ]
}

fn word_boundary_match(haystack: &str, needle: &str) -> bool {
    if needle.contains(' ') {
        return haystack.contains(needle);
    }
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word.eq_ignore_ascii_case(needle))
}

/// Score every `IntentKind` against the request text and return the
/// best-scoring kind with a confidence proportional to keyword density.
pub fn heuristic_classify(request: &Request) -> Intent {
    if request.text.trim().is_empty() {
        return Intent::empty_request();
    }

    let lower = request.text.to_lowercase();
    let mut scores: HashMap<IntentKind, u32> = HashMap::new();
    for (kind, keywords) in keyword_table() {
        let hits = keywords.iter().filter(|kw| word_boundary_match(&lower, kw)).count() as u32;
        if hits > 0 {
            scores.insert(kind, hits);
        }
    }

    let Some((&best_kind, &best_hits)) = scores.iter().max_by_key(|(_, hits)| **hits) else {
        return Intent {
            kind: IntentKind::Chat,
            confidence: 0.3,
            reasoning: "no keyword matched; defaulting to chat".into(),
        };
    };

    let total_hits: u32 = scores.values().sum();
    let confidence = (best_hits as f32 / total_hits.max(1) as f32).clamp(0.34, 0.95);
    Intent {
        kind: best_kind,
        confidence,
        reasoning: format!("{best_hits} keyword hit(s) for {best_kind:?}"),
    }
}

/// Combines the model-based and heuristic paths per §4.10.
pub struct IntentClassifier {
    model: Box<dyn IntentModel>,
    confidence_threshold: f32,
}

impl IntentClassifier {
    pub fn new(model: Box<dyn IntentModel>) -> Self {
        Self::with_threshold(model, 0.55)
    }

    pub fn with_threshold(model: Box<dyn IntentModel>, confidence_threshold: f32) -> Self {
        Self { model, confidence_threshold }
    }

    pub async fn classify(&self, request: &Request) -> Intent {
        if request.text.trim().is_empty() {
            return Intent::empty_request();
        }
        if let Some(intent) = self.model.classify(request).await {
            if intent.confidence >= self.confidence_threshold {
                return intent;
            }
        }
        heuristic_classify(request)
    }
}
