//! Kernel error taxonomy.
//!
//! Mirrors `sa_domain::error::Error`'s shape (a flat `thiserror` enum) but
//! carries the orchestration-specific kinds from the kernel's error
//! handling design rather than widening the shared crate's error surface.

#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    /// Retried by the router across providers; bounded.
    #[error("transient: {0}")]
    Transient(String),

    /// Honored locally by the rate limiter; if persistent, treated as
    /// transient for failover purposes.
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Triggers context-window compaction; retried once, then surfaces
    /// as `BudgetExceeded` if still over budget.
    #[error("context overflow: {0}")]
    ContextOverflow(String),

    /// Never retried; surfaces as a task failure.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Safety gate refusal.
    #[error("policy blocked: {0}")]
    PolicyBlocked(String),

    /// Recovered by the recovery engine up to its cap; otherwise surfaces
    /// as a task failure.
    #[error("tool '{tool_name}' failed: {message}")]
    ToolFailure { tool_name: String, message: String },

    /// Propagated from a cancellation token; current turn closed with a
    /// Cancelled marker.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation. Surfaces as a task failure and halts the run.
    #[error("internal: {0}")]
    Internal(String),

    /// The approval callback rejected the plan outright.
    #[error("approval rejected")]
    ApprovalRejected,

    /// A plan requiring gating was rejected by the reviewer before any
    /// task ran (distinct from `ApprovalRejected`, which covers a single
    /// tool call's approval timing out or being denied mid-run).
    #[error("run cancelled by user")]
    CancelledByUser,

    /// Every candidate provider in the router's list was exhausted.
    #[error("all providers failed for this request")]
    AllProvidersFailed,

    /// The plan failed structural validation (cycle, unknown dependency,
    /// or no provider can satisfy a required capability).
    #[error("plan invalid: {0}")]
    PlanInvalid(String),

    /// A task or conversation exceeded its token/time budget after
    /// compaction was already attempted.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error(transparent)]
    Domain(#[from] sa_domain::error::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl KernelError {
    /// The stable `error_kind` discriminant, for callers that want to
    /// match on a string rather than the enum (API responses, logs).
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Transient(_) => "transient",
            KernelError::RateLimited { .. } => "rate_limited",
            KernelError::ContextOverflow(_) => "context_overflow",
            KernelError::BadRequest(_) => "bad_request",
            KernelError::PolicyBlocked(_) => "policy_blocked",
            KernelError::ToolFailure { .. } => "tool_failure",
            KernelError::Cancelled => "cancelled",
            KernelError::Internal(_) => "internal",
            KernelError::ApprovalRejected => "approval_rejected",
            KernelError::CancelledByUser => "cancelled_by_user",
            KernelError::AllProvidersFailed => "all_providers_failed",
            KernelError::PlanInvalid(_) => "plan_invalid",
            KernelError::BudgetExceeded(_) => "budget_exceeded",
            KernelError::Domain(_) => "domain",
        }
    }

    /// Whether a failure at this kind should be retried across providers
    /// by the router (§7: Transient and persistent RateLimited).
    pub fn is_retriable(&self) -> bool {
        matches!(self, KernelError::Transient(_) | KernelError::RateLimited { .. })
    }
}
