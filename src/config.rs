//! TOML configuration for stressgen.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working engine. The config file path can be overridden with
//! the `STRESSGEN_CONFIG` environment variable.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::packet::{tcp, TemplateOptions};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "STRESSGEN_CONFIG";
/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/stressgen/stressgen.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StressConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StressConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded stressgen configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `STRESSGEN_CONFIG`.
    /// 2. `/etc/stressgen/stressgen.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "STRESSGEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.governor.validate()?;
        if self.engine.report_interval_ms == 0 {
            anyhow::bail!("engine.report_interval_ms must be positive");
        }
        if self.engine.stop_grace_ms == 0 {
            anyhow::bail!("engine.stop_grace_ms must be positive");
        }
        if self.engine.default_parallelism == Some(0) {
            anyhow::bail!("engine.default_parallelism must be at least 1");
        }
        if self.template.pool_size == 0 {
            anyhow::bail!("template.pool_size must be at least 1");
        }
        if self.template.ttl == 0 {
            anyhow::bail!("template.ttl must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Worker pool and session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How workers are run.
    pub worker_mode: WorkerMode,
    /// Worker count when a session does not specify one. `None` uses the
    /// number of available CPUs.
    pub default_parallelism: Option<usize>,
    /// Cadence of snapshot delivery to the reporting sink.
    pub report_interval_ms: u64,
    /// How long `stop` waits for workers to exit before forcing them.
    pub stop_grace_ms: u64,
    /// Program launched for process workers. `None` re-executes the current
    /// binary's `worker` subcommand.
    pub worker_program: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_mode: WorkerMode::Thread,
            default_parallelism: None,
            report_interval_ms: 1000,
            stop_grace_ms: 2000,
            worker_program: None,
        }
    }
}

impl EngineConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Concurrency strategy for workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// One OS thread per worker inside this process.
    Thread,
    /// One child process per worker, each with its own send primitive.
    Process,
}

impl std::str::FromStr for WorkerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "thread" => Ok(WorkerMode::Thread),
            "process" => Ok(WorkerMode::Process),
            other => anyhow::bail!("unknown worker mode '{}' (expected thread or process)", other),
        }
    }
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

/// Burst-size feedback loop bounds and tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Smallest burst the governor will shrink to.
    pub min_burst: u32,
    /// Largest burst the governor will grow to.
    pub max_burst: u32,
    /// Burst size a worker starts with.
    pub initial_burst: u32,
    /// Measurement windows shorter than this are not acted on.
    pub min_interval_ms: u64,
    /// Below `lower_ratio * target` the burst doubles.
    pub lower_ratio: f64,
    /// Above `upper_ratio * target` the burst halves.
    pub upper_ratio: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            min_burst: 16,
            max_burst: 262_144,
            initial_burst: 2048,
            min_interval_ms: 100,
            lower_ratio: 0.95,
            upper_ratio: 1.05,
        }
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Packet template pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Number of pre-built packet variants per session.
    pub pool_size: usize,
    /// TTL for hand-built IPv4 headers.
    pub ttl: u8,
    /// Window advertised in TCP SYN packets.
    pub tcp_window: u16,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            ttl: tcp::DEFAULT_TTL,
            tcp_window: tcp::DEFAULT_WINDOW,
        }
    }
}

impl TemplateConfig {
    /// Pool builder options for one session.
    pub fn template_options(
        &self,
        packet_size: usize,
        target_port: u16,
        source: Ipv4Addr,
    ) -> TemplateOptions {
        TemplateOptions {
            packet_size,
            pool_size: self.pool_size,
            target_port,
            source,
            ttl: self.ttl,
            tcp_window: self.tcp_window,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,
    /// `text` or `json`.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
