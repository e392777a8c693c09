//! Drover configuration.
//!
//! One TOML file (`.drover/config.toml` in the repository by default) with
//! concrete sections. Every section is a plain record with serde defaults,
//! and [`DroverConfig::validate`] does the per-field range checks, so a
//! config that loads and validates is safe to hand to any component.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use drover_state::error::{DroverError, Result};

use crate::launcher::backoff::BackoffStrategy;

/// Which launcher backend spawns workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    #[default]
    Subprocess,
    Container,
}

/// Worker pool and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub max_concurrent: u32,
    pub timeout_minutes: u32,
    /// Policy retries for a failed task (reset to pending).
    pub retry_attempts: u32,
    pub launcher: LauncherKind,
    pub spawn_retry_attempts: u32,
    pub spawn_backoff_strategy: BackoffStrategy,
    pub spawn_backoff_base_seconds: u64,
    pub spawn_backoff_max_seconds: u64,
    pub auto_respawn: bool,
    pub max_respawn_attempts: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            timeout_minutes: 60,
            retry_attempts: 1,
            launcher: LauncherKind::Subprocess,
            spawn_retry_attempts: 3,
            spawn_backoff_strategy: BackoffStrategy::Exponential,
            spawn_backoff_base_seconds: 2,
            spawn_backoff_max_seconds: 30,
            auto_respawn: true,
            max_respawn_attempts: 2,
        }
    }
}

/// Heartbeat cadence and stall detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_seconds: u64,
    pub stall_timeout_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            stall_timeout_seconds: 120,
        }
    }
}

/// Port range reserved for workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub range_start: u16,
    pub range_end: u16,
    pub ports_per_worker: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 7860,
            range_end: 7960,
            ports_per_worker: 1,
        }
    }
}

/// Host resource limits, mostly consumed by the container launcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub container_memory_limit: String,
    pub container_cpu_limit: f64,
    pub gpu_enabled: bool,
    pub min_disk_gb: f64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            container_memory_limit: "4g".into(),
            container_cpu_limit: 2.0,
            gpu_enabled: false,
            min_disk_gb: 1.0,
        }
    }
}

/// Container backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    pub network: String,
    /// Host directories (credentials etc.) mounted read-only into workers.
    pub credential_dirs: Vec<PathBuf>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "drover-worker:latest".into(),
            network: "drover".into(),
            credential_dirs: Vec::new(),
        }
    }
}

/// Spawn/task-failure circuit breaker (backpressure).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            cooldown_seconds: 60,
        }
    }
}

/// Merge-flow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub target_branch: String,
    pub skip_gates: bool,
    pub skip_tests: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            target_branch: "main".into(),
            skip_gates: false,
            skip_tests: false,
        }
    }
}

/// Log-file placement for workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".drover/logs"),
        }
    }
}

/// One quality gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_gate_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub coverage_threshold: Option<u32>,
}

fn default_gate_timeout() -> u64 {
    300
}

/// Optional three-tier verification commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationTiersConfig {
    pub syntax: Option<String>,
    pub correctness: Option<String>,
    pub quality: Option<String>,
}

/// Task-verification execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub tiers: Option<VerificationTiersConfig>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30,
            max_timeout_seconds: 600,
            tiers: None,
        }
    }
}

/// The coding-agent command the worker runs. The agent itself is an
/// external collaborator; drover only spawns it and reads its exit code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".into(),
            args: vec!["-p".into()],
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    pub workers: WorkersConfig,
    pub heartbeat: HeartbeatConfig,
    pub ports: PortsConfig,
    pub resources: ResourcesConfig,
    pub container: ContainerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub merge: MergeConfig,
    pub logging: LoggingConfig,
    pub verification: VerificationConfig,
    pub agent: AgentConfig,
    pub quality_gates: Vec<QualityGate>,
}

impl DroverConfig {
    /// Conventional config path inside a repository.
    pub fn path_in_repo(repo_path: &Path) -> PathBuf {
        repo_path.join(".drover").join("config.toml")
    }

    /// Load from a repository, falling back to defaults when the file does
    /// not exist.
    pub fn load(repo_path: &Path) -> Result<Self> {
        let path = Self::path_in_repo(repo_path);
        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DroverError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| {
            DroverError::config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Per-field range checks. Kept in one place so every load path hits
    /// them.
    pub fn validate(&self) -> Result<()> {
        fn range<T: PartialOrd + std::fmt::Display + Copy>(
            field: &str,
            value: T,
            min: T,
            max: T,
        ) -> Result<()> {
            if value < min || value > max {
                return Err(DroverError::Validation {
                    message: format!("{field} = {value} outside allowed range {min}..={max}"),
                    field: Some(field.to_string()),
                });
            }
            Ok(())
        }

        range("workers.max_concurrent", self.workers.max_concurrent, 1, 10)?;
        range("workers.timeout_minutes", self.workers.timeout_minutes, 1, 120)?;
        range("workers.retry_attempts", self.workers.retry_attempts, 0, 10)?;
        range(
            "workers.spawn_retry_attempts",
            self.workers.spawn_retry_attempts,
            1,
            10,
        )?;
        range(
            "workers.spawn_backoff_base_seconds",
            self.workers.spawn_backoff_base_seconds,
            1,
            600,
        )?;
        range(
            "workers.spawn_backoff_max_seconds",
            self.workers.spawn_backoff_max_seconds,
            1,
            3600,
        )?;
        range(
            "workers.max_respawn_attempts",
            self.workers.max_respawn_attempts,
            0,
            5,
        )?;
        range(
            "heartbeat.interval_seconds",
            self.heartbeat.interval_seconds,
            5,
            300,
        )?;
        range(
            "heartbeat.stall_timeout_seconds",
            self.heartbeat.stall_timeout_seconds,
            30,
            600,
        )?;
        if self.ports.range_start >= self.ports.range_end {
            return Err(DroverError::Validation {
                message: format!(
                    "ports.range_start ({}) must be below ports.range_end ({})",
                    self.ports.range_start, self.ports.range_end
                ),
                field: Some("ports".into()),
            });
        }
        range(
            "resources.container_cpu_limit",
            self.resources.container_cpu_limit,
            0.1,
            32.0,
        )?;
        range(
            "circuit_breaker.failure_threshold",
            self.circuit_breaker.failure_threshold,
            1,
            20,
        )?;
        range(
            "circuit_breaker.cooldown_seconds",
            self.circuit_breaker.cooldown_seconds,
            5,
            600,
        )?;
        range(
            "verification.default_timeout_seconds",
            self.verification.default_timeout_seconds,
            1,
            self.verification.max_timeout_seconds,
        )?;
        for gate in &self.quality_gates {
            if gate.name.is_empty() || gate.command.is_empty() {
                return Err(DroverError::Validation {
                    message: format!("quality gate {:?} needs a name and a command", gate.name),
                    field: Some("quality_gates".into()),
                });
            }
            range("quality_gates.timeout", gate.timeout, 1, 3600)?;
        }
        if self.agent.command.is_empty() {
            return Err(DroverError::Validation {
                message: "agent.command must not be empty".into(),
                field: Some("agent.command".into()),
            });
        }
        Ok(())
    }

    pub fn get_gate(&self, name: &str) -> Option<&QualityGate> {
        self.quality_gates.iter().find(|g| g.name == name)
    }
}
