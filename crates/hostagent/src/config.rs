//! Agent configuration.
//!
//! Layered the usual way: compiled defaults, then the TOML file, then
//! `HOSTAGENT__*` environment variables (`HOSTAGENT__SUPERVISOR__KILL_TIMEOUT_SECS=5`).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::allowlist::ProcessPathAllowList;
use crate::containers::CliContainerLookup;
use crate::supervisor::SupervisorConfig;
use crate::transport::default_endpoint;

pub const APP_NAME: &str = "hostagent";
const ENV_PREFIX: &str = "HOSTAGENT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Force debug logging.
    pub debug: bool,
    /// Named pipe (Windows) or socket path the agent listens on.
    pub listen: String,
    pub white_list: WhiteListConfig,
    pub supervisor: SupervisorSection,
    pub containers: ContainersConfig,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            debug: false,
            listen: default_endpoint(),
            white_list: WhiteListConfig::default(),
            supervisor: SupervisorSection::default(),
            containers: ContainersConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WhiteListConfig {
    /// Binaries clients may start. Empty allows any path.
    pub process_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub binary_prefix: String,
    pub kill_timeout_secs: u64,
    pub keepalive_timeout_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            binary_prefix: defaults.binary_prefix,
            kill_timeout_secs: defaults.kill_timeout.as_secs(),
            keepalive_timeout_secs: defaults.keepalive_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainersConfig {
    /// Docker-compatible CLIs used to look up containers for volume mounts,
    /// tried in order.
    pub runtimes: Vec<String>,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            runtimes: vec!["docker".to_string(), "nerdctl".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AgentConfig {
    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            anyhow::bail!("listen could not be blank");
        }
        if self
            .white_list
            .process_paths
            .iter()
            .any(|p| p.trim().is_empty())
        {
            anyhow::bail!("white_list.process_paths could not contain a blank path");
        }
        if self.supervisor.binary_prefix.trim().is_empty() {
            anyhow::bail!("supervisor.binary_prefix could not be blank");
        }
        if self.containers.runtimes.iter().any(|r| r.trim().is_empty()) {
            anyhow::bail!("containers.runtimes could not contain a blank entry");
        }
        if self.supervisor.kill_timeout_secs == 0 {
            anyhow::bail!("supervisor.kill_timeout_secs must be positive");
        }
        if self.supervisor.keepalive_timeout_secs == 0 {
            anyhow::bail!("supervisor.keepalive_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            binary_prefix: self.supervisor.binary_prefix.clone(),
            kill_timeout: Duration::from_secs(self.supervisor.kill_timeout_secs),
            keepalive_timeout: Duration::from_secs(self.supervisor.keepalive_timeout_secs),
        }
    }

    pub fn container_lookup(&self) -> CliContainerLookup {
        CliContainerLookup::new(self.containers.runtimes.clone())
    }

    pub fn allow_list(&self) -> ProcessPathAllowList {
        ProcessPathAllowList::new(&self.white_list.process_paths)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing config to TOML")
    }
}

/// Load the layered configuration. A missing file is not an error.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let defaults = AgentConfig::default();
    let built = Config::builder()
        .set_default("listen", defaults.listen.clone())?
        .set_default("logging.level", defaults.logging.level.clone())?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("loading config from {}", path.display()))?;

    let mut config: AgentConfig = built
        .try_deserialize()
        .context("parsing configuration")?;

    config.white_list.process_paths = config
        .white_list
        .process_paths
        .iter()
        .map(|p| expand_str_path(p).map(|e| e.display().to_string()))
        .collect::<Result<_>>()?;

    config.validate()?;
    Ok(config)
}

/// Write a commented default config file to `path`.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let body = format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n{}",
        path.display(),
        AgentConfig::default().to_toml()?
    );
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    dirs::config_dir()
        .map(|dir| dir.join(APP_NAME))
        .context("unable to determine configuration directory")
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}
