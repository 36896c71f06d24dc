// ABOUTME: Configuration loading and management for switchyard
// ABOUTME: TOML config with router, limits, and per-backend command overrides

use crate::backend::{Backend, CliBackend, CommandTemplate};
use crate::breaker::{BreakerSettings, BreakerTable};
use crate::orchestrator::Orchestrator;
use crate::router::{validate_order, BackendRouter, DEFAULT_PREFERRED};
use crate::types::{BackendInvokeRequest, BackendName};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Workspace directory requests run in when none is given
    pub workspace: Option<PathBuf>,
    /// Candidate ordering and circuit breaker settings
    pub router: RouterConfig,
    /// Per-attempt resource limits
    pub limits: LimitsConfig,
    /// Command overrides per backend
    pub backends: BackendsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Order tried in auto mode
    pub preferred: Vec<BackendName>,
    /// Consecutive failures before a backend's breaker opens
    pub failure_threshold: u32,
    /// How long an open breaker blocks before admitting a trial
    pub reset_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            preferred: DEFAULT_PREFERRED.to_vec(),
            failure_threshold: 3,
            reset_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Wall-clock deadline per attempt, from spawn
    pub timeout_ms: u64,
    /// Cumulative stdout+stderr cap per attempt
    pub max_output_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            max_output_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub claude: BackendCommandConfig,
    pub codex: BackendCommandConfig,
}

/// Overrides layered on top of a backend's stock command template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendCommandConfig {
    /// Path to the binary (defaults to the backend name on PATH)
    pub binary: Option<String>,
    /// Full argument list; replaces the stock arguments entirely
    pub args: Option<Vec<String>>,
    /// Extra environment variables for the process
    pub env: BTreeMap<String, String>,
}

impl Config {
    /// Get the XDG config directory for switchyard (~/.config/switchyard)
    pub fn config_dir() -> PathBuf {
        // Respect XDG_CONFIG_HOME if set, otherwise use ~/.config
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("switchyard")
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from XDG config directory
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            // No config found, use defaults
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_order(&self.router.preferred).context("router.preferred")?;
        if self.router.failure_threshold == 0 {
            bail!("router.failure_threshold must be greater than zero");
        }
        if self.router.reset_timeout_ms == 0 {
            bail!("router.reset_timeout_ms must be greater than zero");
        }
        if self.limits.timeout_ms == 0 {
            bail!("limits.timeout_ms must be greater than zero");
        }
        if self.limits.max_output_bytes == 0 {
            bail!("limits.max_output_bytes must be greater than zero");
        }
        for name in BackendName::ALL {
            if self.template(name).binary.trim().is_empty() {
                bail!("backends.{name}.binary must not be empty");
            }
        }
        Ok(())
    }

    /// Get the workspace directory, defaulting to the current directory
    pub fn workspace_path(&self) -> PathBuf {
        match &self.workspace {
            Some(path) => PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned()),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.router.failure_threshold,
            reset_timeout: Duration::from_millis(self.router.reset_timeout_ms),
        }
    }

    /// The effective command template for a backend
    pub fn template(&self, name: BackendName) -> CommandTemplate {
        let overrides = match name {
            BackendName::Claude => &self.backends.claude,
            BackendName::Codex => &self.backends.codex,
        };
        let mut template = CommandTemplate::default_for(name);
        if let Some(binary) = &overrides.binary {
            template.binary = shellexpand::tilde(binary).into_owned();
        }
        if let Some(args) = &overrides.args {
            template.args = args.clone();
        }
        template.env.extend(overrides.env.clone());
        template
    }

    /// Build a request carrying the configured limits
    pub fn request(
        &self,
        prompt: impl Into<String>,
        session_id: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
    ) -> BackendInvokeRequest {
        BackendInvokeRequest::new(prompt, session_id, workspace_dir)
            .with_timeout(Duration::from_millis(self.limits.timeout_ms))
            .with_max_output_bytes(self.limits.max_output_bytes)
    }

    /// Wire breakers, router and CLI adapters into an orchestrator
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let breakers = Arc::new(BreakerTable::new(self.breaker_settings()));
        let router = BackendRouter::new(self.router.preferred.clone(), breakers)
            .context("Failed to build backend router")?;
        let backends: Vec<Arc<dyn Backend>> = BackendName::ALL
            .into_iter()
            .map(|name| Arc::new(CliBackend::new(name, self.template(name))) as Arc<dyn Backend>)
            .collect();
        Ok(Orchestrator::new(router, backends))
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        r#"# switchyard configuration
# Location: ~/.config/switchyard/config.toml

# Workspace directory requests run in (defaults to the current directory)
# workspace = "~/projects"

[router]
# Order tried in auto mode
preferred = ["claude", "codex"]
# Consecutive failures before a backend is skipped
failure_threshold = 3
# Cooldown before a tripped backend gets a trial request
reset_timeout_ms = 30000

[limits]
timeout_ms = 300000
max_output_bytes = 8388608

[backends.claude]
# binary = "claude"
# args = ["--print", "--output-format", "stream-json", "--verbose", "--include-partial-messages", "--dangerously-skip-permissions", "{prompt}"]

[backends.codex]
# binary = "codex"
# args = ["exec", "--json", "--skip-git-repo-check", "--sandbox", "workspace-write", "-C", "{workspace}", "{prompt}"]
# env = { RUST_LOG = "warn" }
"#
        .to_string()
    }

    /// Initialize config directory and create default config if needed
    pub fn init() -> Result<PathBuf> {
        Self::init_at(&Self::config_path())
    }

    /// Write the default config to `path` unless a file is already there
    pub fn init_at(path: &Path) -> Result<PathBuf> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        }

        if !path.exists() {
            std::fs::write(path, Self::default_toml())
                .with_context(|| format!("Failed to write config: {}", path.display()))?;
        }

        Ok(path.to_path_buf())
    }
}
