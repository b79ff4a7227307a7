use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Retry, deadline and node-health knobs of the job dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Attempts per job, counting the first; 2 means one automatic retry.
    pub max_job_attempts: u32,
    /// Total resubmissions allowed per execution plan.
    pub plan_retry_budget: u32,
    pub max_job_execution_ms: Option<u64>,
    /// Backoff unit applied to a node's worker, scaled by its recent failure rate.
    pub node_failure_backoff_ms: u64,
}

impl DispatcherSettings {
    #[must_use]
    pub fn max_job_execution(&self) -> Option<Duration> {
        self.max_job_execution_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn node_failure_backoff(&self) -> Duration {
        Duration::from_millis(self.node_failure_backoff_ms)
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_job_attempts: 2,
            plan_retry_budget: 32,
            max_job_execution_ms: Some(30_000),
            node_failure_backoff_ms: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSizingSettings {
    /// Estimated execution time a job should not exceed.
    pub target_job_nanos: u64,
    pub max_items_per_job: usize,
    /// Items whose mean output is at least this large run in a job of their own.
    pub isolation_output_bytes: u64,
    /// Cost assumed for functions with no cost record yet.
    pub default_item_nanos: u64,
}

impl Default for JobSizingSettings {
    fn default() -> Self {
        Self {
            target_job_nanos: 50_000_000,
            max_items_per_job: 64,
            isolation_output_bytes: 1024 * 1024,
            default_item_nanos: 1_000_000,
        }
    }
}

/// What a blacklist rule produced by the failure policy covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistScope {
    /// Every invocation of the function.
    Function,
    /// The function with the failing parameters.
    FunctionParameters,
    /// The function with the failing parameters on the failing target.
    FunctionTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRateWindow {
    /// Number of most recent invocations considered.
    pub window: usize,
    /// Failure fraction at or above which the function is blacklisted.
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistPolicy {
    pub consecutive_failures: Option<u32>,
    pub failure_rate: Option<FailureRateWindow>,
    pub scope: BlacklistScope,
    pub rule_ttl_ms: Option<u64>,
}

impl BlacklistPolicy {
    #[must_use]
    pub fn rule_ttl(&self) -> Option<Duration> {
        self.rule_ttl_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            consecutive_failures: None,
            failure_rate: None,
            scope: BlacklistScope::Function,
            rule_ttl_ms: None,
        }
    }
}

impl Default for BlacklistPolicy {
    fn default() -> Self {
        Self {
            consecutive_failures: Some(3),
            failure_rate: None,
            scope: BlacklistScope::Function,
            rule_ttl_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum RecompilationPolicy {
    /// Recompile before the next cycle starts.
    Immediate,
    /// Recompile alongside the running cycle and swap graphs once both finish.
    Parallel,
    /// Keep the old graph until `after_cycles` cycles have run since the last
    /// compilation, or a recompilation is forced.
    Deferred { after_cycles: Option<u64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewProcessSettings {
    pub recompilation: RecompilationPolicy,
    pub min_cycle_interval_ms: u64,
    pub max_cycles: Option<u64>,
    /// After this long the worker cancels the cycle's plan itself.
    pub cycle_timeout_ms: Option<u64>,
}

impl ViewProcessSettings {
    #[must_use]
    pub fn min_cycle_interval(&self) -> Duration {
        Duration::from_millis(self.min_cycle_interval_ms)
    }

    #[must_use]
    pub fn cycle_timeout(&self) -> Option<Duration> {
        self.cycle_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ViewProcessSettings {
    fn default() -> Self {
        Self {
            recompilation: RecompilationPolicy::Immediate,
            min_cycle_interval_ms: 0,
            max_cycles: None,
            cycle_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    pub dispatcher: DispatcherSettings,
    pub job_sizing: JobSizingSettings,
    pub blacklist: BlacklistPolicy,
    pub view: ViewProcessSettings,
}

impl GridSettings {
    /// # Errors
    ///
    /// Returns an error if the JSON does not match the settings layout or a
    /// value is out of range.
    pub fn from_json(json: &Value) -> Result<Self, SettingsError> {
        let settings: GridSettings = serde_json::from_value(json.clone())
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.dispatcher.max_job_attempts == 0 {
            return Err(SettingsError::Invalid(
                "dispatcher.max_job_attempts must be at least 1".to_string(),
            ));
        }
        if self.job_sizing.max_items_per_job == 0 {
            return Err(SettingsError::Invalid(
                "job_sizing.max_items_per_job must be at least 1".to_string(),
            ));
        }
        if let Some(rate) = &self.blacklist.failure_rate {
            if rate.window == 0 || !(0.0..=1.0).contains(&rate.threshold) {
                return Err(SettingsError::Invalid(
                    "blacklist.failure_rate needs a non-empty window and a threshold in [0, 1]"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = GridSettings::from_json(&json!({
            "dispatcher": { "plan_retry_budget": 4 },
            "blacklist": { "scope": "function_target", "rule_ttl_ms": 60000 },
            "view": { "recompilation": { "policy": "deferred", "after_cycles": 10 } }
        }))
        .expect("valid settings");

        assert_eq!(settings.dispatcher.plan_retry_budget, 4);
        assert_eq!(settings.dispatcher.max_job_attempts, 2);
        assert_eq!(settings.blacklist.scope, BlacklistScope::FunctionTarget);
        assert_eq!(settings.blacklist.consecutive_failures, Some(3));
        assert_eq!(settings.blacklist.rule_ttl(), Some(Duration::from_secs(60)));
        assert_eq!(
            settings.view.recompilation,
            RecompilationPolicy::Deferred {
                after_cycles: Some(10)
            }
        );
        assert_eq!(settings.job_sizing, JobSizingSettings::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(GridSettings::from_json(&json!({ "dispatcher": { "max_job_attempts": 0 } })).is_err());
        assert!(GridSettings::from_json(&json!({
            "blacklist": { "failure_rate": { "window": 10, "threshold": 1.5 } }
        }))
        .is_err());
    }
}
