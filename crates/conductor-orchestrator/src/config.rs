use conductor_core::{ConductorError, ConductorResult};
use conductor_session::JournalConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Everything read from `conductor.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Concurrent tasks one agent may hold.
    #[serde(default = "default_max_agent_load")]
    pub max_agent_load: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound on assignments made by a single tick.
    #[serde(default = "default_dispatch_batch")]
    pub dispatch_batch: usize,
    /// Retry budget for tasks that do not set their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Score multiplier applied once per retry.
    #[serde(default = "default_retry_penalty")]
    pub retry_penalty: f64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_agent_load: default_max_agent_load(),
            tick_interval_ms: default_tick_interval_ms(),
            dispatch_batch: default_dispatch_batch(),
            default_max_retries: default_max_retries(),
            retry_penalty: default_retry_penalty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Silence after which an active agent is marked stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Silence after which a stale agent is marked offline.
    #[serde(default = "default_offline_after_secs")]
    pub offline_after_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            offline_after_secs: default_offline_after_secs(),
        }
    }
}

impl LivenessConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_secs(self.offline_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Assignments per agent.
    #[serde(default = "default_assignment_limit")]
    pub assignment: RateLimitConfig,
    /// Submissions per submitter.
    #[serde(default = "default_submission_limit")]
    pub submission: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            assignment: default_assignment_limit(),
            submission: default_submission_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            write_retries: default_write_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl PersistenceConfig {
    pub fn journal(&self) -> JournalConfig {
        JournalConfig {
            write_retries: self.write_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            ..JournalConfig::default()
        }
    }
}

fn default_max_agent_load() -> usize {
    5
}
fn default_tick_interval_ms() -> u64 {
    250
}
fn default_dispatch_batch() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_penalty() -> f64 {
    0.5
}
fn default_sweep_interval_secs() -> u64 {
    5
}
fn default_stale_after_secs() -> u64 {
    30
}
fn default_offline_after_secs() -> u64 {
    300
}
fn default_assignment_limit() -> RateLimitConfig {
    RateLimitConfig {
        max_requests: 20,
        window_secs: 10,
    }
}
fn default_submission_limit() -> RateLimitConfig {
    RateLimitConfig {
        max_requests: 100,
        window_secs: 10,
    }
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/workflows")
}
fn default_snapshot_interval_secs() -> u64 {
    60
}
fn default_write_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    100
}

impl ConductorConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml(input: &str) -> ConductorResult<Self> {
        let config: Self = toml_from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConductorResult<()> {
        let c = &self.coordination;
        if c.max_agent_load == 0 {
            return Err(ConductorError::Config(
                "coordination.max_agent_load must be at least 1".into(),
            ));
        }
        if c.dispatch_batch == 0 {
            return Err(ConductorError::Config(
                "coordination.dispatch_batch must be at least 1".into(),
            ));
        }
        if c.tick_interval_ms == 0 {
            return Err(ConductorError::Config(
                "coordination.tick_interval_ms must be positive".into(),
            ));
        }
        if !(c.retry_penalty > 0.0 && c.retry_penalty <= 1.0) {
            return Err(ConductorError::Config(format!(
                "coordination.retry_penalty must be in (0, 1], got {}",
                c.retry_penalty
            )));
        }

        let l = &self.liveness;
        if l.sweep_interval_secs == 0 || l.stale_after_secs == 0 {
            return Err(ConductorError::Config(
                "liveness intervals must be positive".into(),
            ));
        }
        if l.offline_after_secs <= l.stale_after_secs {
            return Err(ConductorError::Config(
                "liveness.offline_after_secs must exceed stale_after_secs".into(),
            ));
        }

        for (name, limit) in [
            ("assignment", &self.rate_limit.assignment),
            ("submission", &self.rate_limit.submission),
        ] {
            if limit.max_requests == 0 || limit.window_secs == 0 {
                return Err(ConductorError::Config(format!(
                    "rate_limit.{name} needs max_requests and window_secs above zero"
                )));
            }
        }

        if self.persistence.snapshot_interval_secs == 0 {
            return Err(ConductorError::Config(
                "persistence.snapshot_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn toml_from_str(input: &str) -> ConductorResult<ConductorConfig> {
    toml::from_str(input).map_err(|e| ConductorError::Config(format!("invalid config: {e}")))
}
