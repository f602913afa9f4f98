//! Kernel configuration knobs (§6 of SPEC_FULL.md).
//!
//! Follows `sa_domain::config::Config`'s style: `#[serde(default =
//! "d_xxx")]` per field, a manual `Default` impl, and a `validate`
//! accumulator rather than fail-fast.

use std::collections::HashMap;

use sa_domain::config::{RouterThresholds, RoutingProfile, TierConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "d_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "d_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "d_half_open_max_inflight")]
    pub half_open_max_inflight: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: d_failure_threshold(),
            recovery_timeout_secs: d_recovery_timeout_secs(),
            half_open_max_inflight: d_half_open_max_inflight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "d_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "d_tokens_per_minute")]
    pub tokens_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: d_requests_per_minute(),
            tokens_per_minute: d_tokens_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBudgetConfig {
    #[serde(default = "d_context_budget_tokens")]
    pub context_budget_tokens: u32,
    #[serde(default = "d_high_water")]
    pub high_water: f64,
    #[serde(default = "d_max_live_turns")]
    pub max_live_turns: usize,
}

impl Default for ContextBudgetConfig {
    fn default() -> Self {
        Self {
            context_budget_tokens: d_context_budget_tokens(),
            high_water: d_high_water(),
            max_live_turns: d_max_live_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub provider_priority: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub context_budget: ContextBudgetConfig,
    #[serde(default = "d_max_act_iterations")]
    pub max_act_iterations: usize,
    #[serde(default = "d_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default = "d_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    /// §4.12: in a `parallel` (or `hybrid`/`centralized` concurrent
    /// layer) topology, a failure in one task does not cancel its
    /// siblings unless this is `true`.
    #[serde(default)]
    pub cancel_siblings_on_failure: bool,
    #[serde(default = "d_plan_gating_threshold")]
    pub plan_gating_threshold: usize,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub yolo_mode: bool,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub denylist_paths: Vec<String>,
    #[serde(default)]
    pub tool_deadlines_secs: HashMap<String, u64>,
    #[serde(default = "d_default_tool_deadline_secs")]
    pub default_tool_deadline_secs: u64,
    #[serde(default)]
    pub default_profile: RoutingProfile,
    #[serde(default)]
    pub tiers: TierConfig,
    #[serde(default)]
    pub thresholds: RouterThresholds,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            provider_priority: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            context_budget: ContextBudgetConfig::default(),
            max_act_iterations: d_max_act_iterations(),
            max_recovery_attempts: d_max_recovery_attempts(),
            max_parallel_tasks: d_max_parallel_tasks(),
            cancel_siblings_on_failure: false,
            plan_gating_threshold: d_plan_gating_threshold(),
            auto_approve: false,
            yolo_mode: false,
            allowed_paths: Vec::new(),
            denylist_paths: Vec::new(),
            tool_deadlines_secs: HashMap::new(),
            default_tool_deadline_secs: d_default_tool_deadline_secs(),
            default_profile: RoutingProfile::default(),
            tiers: TierConfig::default(),
            thresholds: RouterThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl KernelConfig {
    /// Validate every knob, accumulating issues rather than failing fast
    /// (matches `sa_domain::config::Config::validate`'s style).
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut issues = Vec::new();

        if self.breaker.failure_threshold == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "breaker.failure_threshold".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.breaker.half_open_max_inflight == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "breaker.half_open_max_inflight".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.rate_limit.requests_per_minute == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "rate_limit.requests_per_minute".into(),
                message: "zero effectively blocks all requests".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.context_budget.high_water) {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "context_budget.high_water".into(),
                message: "must be within [0, 1]".into(),
            });
        }
        if self.context_budget.context_budget_tokens == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "context_budget.context_budget_tokens".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.max_act_iterations == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "max_act_iterations".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.plan_gating_threshold == 0 {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "plan_gating_threshold".into(),
                message: "every multi-task plan will require approval (threshold of 0)".into(),
            });
        }
        if self.yolo_mode && !self.auto_approve {
            issues.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "yolo_mode".into(),
                message: "yolo_mode without auto_approve still prompts for L1 approvals".into(),
            });
        }
        for path in &self.denylist_paths {
            if path.trim().is_empty() {
                issues.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "denylist_paths".into(),
                    message: "contains an empty entry".into(),
                });
            }
        }

        issues
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_failure_threshold() -> u32 {
    5
}
fn d_recovery_timeout_secs() -> u64 {
    60
}
fn d_half_open_max_inflight() -> u32 {
    3
}
fn d_requests_per_minute() -> u32 {
    60
}
fn d_tokens_per_minute() -> u32 {
    100_000
}
fn d_context_budget_tokens() -> u32 {
    100_000
}
fn d_high_water() -> f64 {
    0.8
}
fn d_max_live_turns() -> usize {
    1000
}
fn d_max_act_iterations() -> usize {
    8
}
fn d_max_recovery_attempts() -> u32 {
    2
}
fn d_max_parallel_tasks() -> usize {
    5
}
fn d_plan_gating_threshold() -> usize {
    2
}
fn d_default_tool_deadline_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_issue<'a>(issues: &'a [ConfigError], field: &str) -> Option<&'a ConfigError> {
        issues.iter().find(|i| i.field == field)
    }

    #[test]
    fn default_config_has_no_errors() {
        let cfg = KernelConfig::default();
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .all(|i| i.severity != ConfigSeverity::Error));
    }

    #[test]
    fn zero_failure_threshold_is_an_error() {
        let mut cfg = KernelConfig::default();
        cfg.breaker.failure_threshold = 0;
        let issues = cfg.validate();
        let issue = find_issue(&issues, "breaker.failure_threshold").unwrap();
        assert_eq!(issue.severity, ConfigSeverity::Error);
    }

    #[test]
    fn high_water_out_of_range_is_an_error() {
        let mut cfg = KernelConfig::default();
        cfg.context_budget.high_water = 1.5;
        let issues = cfg.validate();
        assert!(find_issue(&issues, "context_budget.high_water").is_some());
    }

    #[test]
    fn default_knob_values_match_spec() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.recovery_timeout_secs, 60);
        assert_eq!(cfg.breaker.half_open_max_inflight, 3);
        assert_eq!(cfg.context_budget.high_water, 0.8);
        assert_eq!(cfg.context_budget.max_live_turns, 1000);
        assert_eq!(cfg.max_act_iterations, 8);
        assert_eq!(cfg.max_recovery_attempts, 2);
        assert_eq!(cfg.plan_gating_threshold, 2);
        assert_eq!(cfg.default_tool_deadline_secs, 30);
    }

    #[test]
    fn yolo_without_auto_approve_warns() {
        let mut cfg = KernelConfig::default();
        cfg.yolo_mode = true;
        let issues = cfg.validate();
        let issue = find_issue(&issues, "yolo_mode").unwrap();
        assert_eq!(issue.severity, ConfigSeverity::Warning);
    }

    #[test]
    fn serde_roundtrip_with_defaults() {
        let json = "{}";
        let cfg: KernelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_act_iterations, 8);
    }

    #[test]
    fn cancel_siblings_on_failure_defaults_to_false() {
        let cfg = KernelConfig::default();
        assert!(!cfg.cancel_siblings_on_failure);
        let cfg: KernelConfig = serde_json::from_str("{}").unwrap();
        assert!(!cfg.cancel_siblings_on_failure);
    }
}
