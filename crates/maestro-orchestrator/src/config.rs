use crate::breaker::BreakerConfig;
use crate::executor::RetryPolicy;
use maestro_core::{AgentId, MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Engine settings, usually loaded from `maestro.toml`.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Executor calls in flight per workflow run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Workflows admitted at once; further submissions are refused.
    #[serde(default = "default_max_active_workflows")]
    pub max_active_workflows: usize,
    /// Retry and backoff for transient executor failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-agent circuit breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Subscriber delivery.
    #[serde(default)]
    pub events: EventsConfig,
    /// Where checkpoints are kept.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Authority weight per agent id; agents not listed get `default_authority`.
    #[serde(default)]
    pub authority_weights: HashMap<AgentId, f64>,
    /// Weight of agents missing from `authority_weights`.
    #[serde(default = "default_authority")]
    pub default_authority: f64,
}

/// Delivery settings for event subscribers.
///
/// Each subscriber is fed through an unbounded channel, so publishing never
/// waits on a slow subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Attempts per event before a subscriber is reported as failed.
    #[serde(default = "default_delivery_attempts")]
    pub delivery_attempts: u32,
    /// Pause between two delivery attempts of the same event.
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
}

/// Checkpoint storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackendKind {
    /// Kept in process memory.
    #[default]
    Memory,
    /// One file per workflow under `dir`.
    File,
}

/// Checkpoint storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Storage backend.
    #[serde(default)]
    pub backend: CheckpointBackendKind,
    /// Directory of the file backend.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

fn default_max_concurrency() -> usize {
    8
}
fn default_max_active_workflows() -> usize {
    10
}
fn default_authority() -> f64 {
    1.0
}
fn default_delivery_attempts() -> u32 {
    3
}
fn default_redelivery_delay_ms() -> u64 {
    100
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./data/checkpoints")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_active_workflows: default_max_active_workflows(),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            events: EventsConfig::default(),
            checkpoint: CheckpointConfig::default(),
            authority_weights: HashMap::new(),
            default_authority: default_authority(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            delivery_attempts: default_delivery_attempts(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackendKind::default(),
            dir: default_checkpoint_dir(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> MaestroResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| MaestroError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> MaestroResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MaestroError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> MaestroResult<()> {
        if self.max_concurrency == 0 {
            return Err(MaestroError::Config("max_concurrency must be at least 1".into()));
        }
        if self.max_active_workflows == 0 {
            return Err(MaestroError::Config(
                "max_active_workflows must be at least 1".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(MaestroError::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        let weights = self
            .authority_weights
            .iter()
            .map(|(agent, w)| (agent.as_str(), *w))
            .chain(std::iter::once(("default_authority", self.default_authority)));
        for (name, w) in weights {
            if !w.is_finite() || w < 0.0 {
                return Err(MaestroError::Config(format!(
                    "authority weight for '{name}' must be a non-negative number"
                )));
            }
        }
        Ok(())
    }

    /// Authority weight configured for an agent.
    pub fn authority_for(&self, agent_id: &str) -> f64 {
        self.authority_weights
            .get(agent_id)
            .copied()
            .unwrap_or(self.default_authority)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.max_active_workflows, 10);
        assert_eq!(config.checkpoint.backend, CheckpointBackendKind::Memory);
    }

    #[test]
    fn full_config_parses() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            max_concurrency = 4

            [retry]
            max_retries = 2
            backoff_base_ms = 10

            [breaker]
            failure_threshold = 3
            reset_timeout_ms = 1000

            [breaker.overrides.flaky]
            failure_threshold = 1

            [checkpoint]
            backend = "file"
            dir = "/tmp/maestro"

            [authority_weights]
            reviewer = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.backoff_max_ms, 30_000);
        assert_eq!(config.breaker.for_agent("flaky").0, 1);
        assert_eq!(config.breaker.for_agent("other").0, 3);
        assert_eq!(config.checkpoint.backend, CheckpointBackendKind::File);
        assert_eq!(config.authority_for("reviewer"), 2.0);
        assert_eq!(config.authority_for("writer"), 1.0);
    }

    #[test]
    fn events_section_parses() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [events]
            delivery_attempts = 5
            redelivery_delay_ms = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.events.delivery_attempts, 5);
        assert_eq!(config.events.redelivery_delay_ms, 20);

        let defaults = OrchestratorConfig::from_toml_str("[events]\n").unwrap();
        assert_eq!(defaults.events, EventsConfig::default());
        assert_eq!(defaults.events.redelivery_delay_ms, 100);
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(OrchestratorConfig::from_toml_str("max_concurrency = 0").is_err());
        assert!(OrchestratorConfig::from_toml_str("[authority_weights]\nx = -1.0").is_err());
        assert!(OrchestratorConfig::from_toml_str("max_concurrency = \"many\"").is_err());
    }
}
