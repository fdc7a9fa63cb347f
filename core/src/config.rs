//! Agent configuration (ambient stack — not named as a distinct component
//! in the component table, but every deployable form of this agent needs
//! one). File-backed with CLI override, in the shape `espflash` and its
//! sibling pack repos use `toml` + `clap` for: defaults baked into the
//! struct via `serde(default)`, an optional on-disk file layered on top.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_adapter_dir() -> PathBuf {
    PathBuf::from("./adapters/defs")
}

fn default_boot_timeout_ms() -> u64 {
    4_000
}

/// Everything the daemon needs at startup. Loaded from an optional TOML
/// file and then overridden field-by-field by CLI flags in
/// `board-agent`'s `main`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_adapter_dir")]
    pub adapter_descriptor_dir: PathBuf,

    #[serde(default = "default_boot_timeout_ms")]
    pub boot_timeout_ms: u64,

    #[serde(default)]
    pub prerequisites_url: Option<String>,

    #[serde(default)]
    pub commit_index_url: Option<String>,

    #[serde(default)]
    pub flasher_url: Option<String>,

    #[serde(default)]
    pub firmware_base_url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            baud_rate: default_baud_rate(),
            adapter_descriptor_dir: default_adapter_dir(),
            boot_timeout_ms: default_boot_timeout_ms(),
            prerequisites_url: None,
            commit_index_url: None,
            flasher_url: None,
            firmware_base_url: None,
        }
    }
}

impl AgentConfig {
    /// Loads `path` if it exists; returns the all-defaults config
    /// otherwise. A present-but-malformed file is an error — silently
    /// falling back would mask a typo in the operator's config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default config-file location: `<config dir>/board-agent/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("board", "whitecat", "board-agent")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Default cache directory for downloaded archives.
    pub fn default_cache_dir() -> Option<PathBuf> {
        ProjectDirs::from("board", "whitecat", "board-agent")
            .map(|dirs| dirs.cache_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = AgentConfig::load(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(cfg.bind_address, "127.0.0.1:8080");
        assert_eq!(cfg.baud_rate, 115_200);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "board-agent-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "bind_address = \"0.0.0.0:9000\"\n").unwrap();

        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.bind_address, "0.0.0.0:9000");
        assert_eq!(cfg.baud_rate, 115_200);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
