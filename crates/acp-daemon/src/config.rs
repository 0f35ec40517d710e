//! Daemon configuration: `daemon.toml` overlaid with command-line flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

use acp_control::ControlConfig;

/// Top-level configuration from `daemon.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Listen address of the control plane (or of the relay).
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Directory holding task rows, approvals, progress and `events.jsonl`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Bearer token callers must present. `serve` generates one when unset.
    #[serde(default)]
    pub token: Option<String>,

    /// Reconciliation loop period.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Cap on concurrently running tasks; 0 means unlimited.
    #[serde(default = "default_max_running")]
    pub max_running: usize,

    /// Auto-reject approvals pending longer than this. Unset: wait forever.
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,

    #[serde(default)]
    pub relay: RelayConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_dir: default_data_dir(),
            token: None,
            reconcile_interval_ms: default_reconcile_interval_ms(),
            max_running: default_max_running(),
            approval_timeout_secs: None,
            relay: RelayConfig::default(),
        }
    }
}

/// Relay gateway configuration (`[relay]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Base URL of the upstream control plane, e.g. `http://10.0.0.5:7420`.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Token the relay presents to the upstream.
    #[serde(default)]
    pub upstream_token: Option<String>,

    /// Per-request forwarding timeout.
    #[serde(default = "default_relay_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            upstream_token: None,
            timeout_ms: default_relay_timeout_ms(),
        }
    }
}

// Serde default functions
fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".acp")
}

fn default_reconcile_interval_ms() -> u64 {
    1000
}

fn default_max_running() -> usize {
    4
}

fn default_relay_timeout_ms() -> u64 {
    10_000
}

/// Flags shared by `serve` and `relay`. Every flag overrides the file.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Path to daemon.toml (defaults to <data-dir>/daemon.toml when present).
    #[arg(long, env = "ACP_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "ACP_BIND")]
    pub bind: Option<String>,

    #[arg(long, env = "ACP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "ACP_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[arg(long)]
    pub reconcile_interval_ms: Option<u64>,

    #[arg(long)]
    pub max_running: Option<usize>,

    #[arg(long)]
    pub approval_timeout_secs: Option<u64>,

    #[arg(long, env = "ACP_UPSTREAM")]
    pub upstream: Option<String>,

    #[arg(long, env = "ACP_UPSTREAM_TOKEN", hide_env_values = true)]
    pub upstream_token: Option<String>,

    #[arg(long)]
    pub upstream_timeout_ms: Option<u64>,
}

impl DaemonConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Try to load config, returning defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the effective config: an explicit `--config` must exist,
    /// otherwise `<data-dir>/daemon.toml` is used when present.
    pub fn resolve(args: &ConfigArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => {
                let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);
                Self::load_or_default(&data_dir.join("daemon.toml"))?
            }
        };
        config.apply(args);
        Ok(config)
    }

    /// Overlay command-line flags.
    pub fn apply(&mut self, args: &ConfigArgs) {
        if let Some(bind) = &args.bind {
            self.bind = bind.clone();
        }
        if let Some(dir) = &args.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(token) = &args.token {
            self.token = Some(token.clone());
        }
        if let Some(ms) = args.reconcile_interval_ms {
            self.reconcile_interval_ms = ms;
        }
        if let Some(n) = args.max_running {
            self.max_running = n;
        }
        if let Some(secs) = args.approval_timeout_secs {
            self.approval_timeout_secs = Some(secs);
        }
        if let Some(upstream) = &args.upstream {
            self.relay.upstream = Some(upstream.clone());
        }
        if let Some(token) = &args.upstream_token {
            self.relay.upstream_token = Some(token.clone());
        }
        if let Some(ms) = args.upstream_timeout_ms {
            self.relay.timeout_ms = ms;
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.bind))
    }

    /// The control plane's own view of this config.
    pub fn control_config(&self) -> Result<ControlConfig> {
        if self.reconcile_interval_ms == 0 {
            bail!("reconcile_interval_ms must be greater than zero");
        }
        let mut control = ControlConfig::for_data_dir(&self.data_dir);
        control.reconcile_interval = Duration::from_millis(self.reconcile_interval_ms);
        control.max_running = self.max_running;
        control.approval_timeout = self.approval_timeout_secs.map(Duration::from_secs);
        Ok(control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = DaemonConfig::default();
        assert_eq!(config.bind, "127.0.0.1:7420");
        assert_eq!(config.data_dir, PathBuf::from(".acp"));
        assert_eq!(config.reconcile_interval_ms, 1000);
        assert_eq!(config.max_running, 4);
        assert!(config.token.is_none());
        assert!(config.approval_timeout_secs.is_none());
        assert_eq!(config.relay.timeout_ms, 10_000);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            max_running = 0

            [relay]
            upstream = "http://cp.internal:7420"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_running, 0);
        assert_eq!(config.bind, "127.0.0.1:7420");
        assert_eq!(config.relay.upstream.as_deref(), Some("http://cp.internal:7420"));
        assert_eq!(config.relay.timeout_ms, 10_000);
    }

    #[test]
    fn flags_override_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        std::fs::write(&path, "bind = \"0.0.0.0:9000\"\ntoken = \"from-file\"\n").unwrap();

        let args = ConfigArgs {
            config: Some(path),
            token: Some("from-flag".into()),
            approval_timeout_secs: Some(60),
            ..ConfigArgs::default()
        };
        let config = DaemonConfig::resolve(&args).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.token.as_deref(), Some("from-flag"));

        let control = config.control_config().unwrap();
        assert_eq!(control.approval_timeout, Some(Duration::from_secs(60)));
        assert_eq!(control.max_running, 4);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let args = ConfigArgs {
            config: Some(PathBuf::from("/nonexistent/daemon.toml")),
            ..ConfigArgs::default()
        };
        assert!(DaemonConfig::resolve(&args).is_err());
    }

    #[test]
    fn data_dir_config_is_picked_up() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("daemon.toml"), "max_running = 9\n").unwrap();
        let args = ConfigArgs {
            data_dir: Some(dir.path().to_path_buf()),
            ..ConfigArgs::default()
        };
        let config = DaemonConfig::resolve(&args).unwrap();
        assert_eq!(config.max_running, 9);
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = DaemonConfig {
            reconcile_interval_ms: 0,
            ..DaemonConfig::default()
        };
        assert!(config.control_config().is_err());
        assert!(DaemonConfig::default().bind_addr().is_ok());
    }
}
