use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fmt, fs, path::Path, time::Duration};

use crate::{endpoint::EndpointSpec, pipe::JoinPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub connections: Vec<Rule>,
    /// Upper bound on dialing a destination.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// One `source -> destination` forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub source_port: EndpointSpec,
    pub dst_port: EndpointSpec,
    #[serde(default)]
    pub join_policy: JoinPolicy,
}

const fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl Config {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config as valid YAML")
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config as valid TOML")
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source_port, self.dst_port)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.version)?;
        for rule in &self.connections {
            writeln!(f, "{rule}")?;
        }
        Ok(())
    }
}

/// Loads the config file, parsing `.toml` files as TOML and anything else as
/// YAML. Endpoints are not validated here.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let config = if is_toml {
        Config::from_toml_str(&content)
    } else {
        Config::from_yaml_str(&content)
    };
    config.with_context(|| format!("Invalid config file {}", path.display()))
}
