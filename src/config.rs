//! Engine limits and timeouts.
//!
//! Every ceiling the control loop enforces lives here. Defaults are usable as-is;
//! the binary layers `AGENT_*` environment variables on top (after `.env` is loaded).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Plans longer than this are truncated and closed with a `complete` step.
    pub max_plan_steps: usize,
    /// Global safety valve: step executions per run, shared with replanning.
    pub max_step_executions: u32,
    /// Retries of the same step before it counts as failed.
    pub max_retries: u32,
    /// Replans allowed after a step exhausts its retries.
    pub max_replans: u32,
    pub hard_wait_ceiling_ms: u64,
    pub retry_delay_ms: u64,
    pub oracle_timeout_ms: u64,
    pub action_timeout_ms: u64,
    /// Consecutive unparseable oracle turns before recovery kicks in.
    pub unknown_response_threshold: u32,
    pub recent_actions_window: usize,
    pub replan_history_window: usize,
    pub observation_max_chars: usize,
    pub screenshot_dir: PathBuf,
    pub command_output_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_plan_steps: 15,
            max_step_executions: 50,
            max_retries: 2,
            max_replans: 1,
            hard_wait_ceiling_ms: 5_000,
            retry_delay_ms: 500,
            oracle_timeout_ms: 60_000,
            action_timeout_ms: 30_000,
            unknown_response_threshold: 3,
            recent_actions_window: 5,
            replan_history_window: 10,
            observation_max_chars: 4_000,
            screenshot_dir: default_screenshot_dir(),
            command_output_limit_bytes: 20_000,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `AGENT_*` variables present in the environment.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        override_from_env("AGENT_MAX_PLAN_STEPS", &mut cfg.max_plan_steps);
        override_from_env("AGENT_MAX_STEP_EXECUTIONS", &mut cfg.max_step_executions);
        override_from_env("AGENT_MAX_RETRIES", &mut cfg.max_retries);
        override_from_env("AGENT_MAX_REPLANS", &mut cfg.max_replans);
        override_from_env("AGENT_WAIT_CEILING_MS", &mut cfg.hard_wait_ceiling_ms);
        override_from_env("AGENT_RETRY_DELAY_MS", &mut cfg.retry_delay_ms);
        override_from_env("AGENT_ORACLE_TIMEOUT_MS", &mut cfg.oracle_timeout_ms);
        override_from_env("AGENT_ACTION_TIMEOUT_MS", &mut cfg.action_timeout_ms);
        override_from_env("AGENT_UNKNOWN_THRESHOLD", &mut cfg.unknown_response_threshold);
        if let Ok(dir) = std::env::var("AGENT_SCREENSHOT_DIR") {
            cfg.screenshot_dir = PathBuf::from(dir);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_plan_steps < 2 {
            return Err(anyhow!("max_plan_steps must be >= 2"));
        }
        if self.max_step_executions == 0 {
            return Err(anyhow!("max_step_executions must be > 0"));
        }
        if self.hard_wait_ceiling_ms == 0 {
            return Err(anyhow!("hard_wait_ceiling_ms must be > 0"));
        }
        if self.oracle_timeout_ms == 0 || self.action_timeout_ms == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.unknown_response_threshold == 0 {
            return Err(anyhow!("unknown_response_threshold must be > 0"));
        }
        Ok(())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_screenshot_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("task-agent")
        .join("screenshots")
}

fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparseable config override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let cfg = EngineConfig {
            hard_wait_ceiling_ms: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn override_ignores_garbage() {
        let mut slot = 7u32;
        unsafe { std::env::set_var("AGENT_TEST_OVERRIDE_GARBAGE", "not-a-number") };
        override_from_env("AGENT_TEST_OVERRIDE_GARBAGE", &mut slot);
        assert_eq!(slot, 7);
        unsafe { std::env::set_var("AGENT_TEST_OVERRIDE_GARBAGE", " 12 ") };
        override_from_env("AGENT_TEST_OVERRIDE_GARBAGE", &mut slot);
        assert_eq!(slot, 12);
    }
}
