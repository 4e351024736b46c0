//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use burrow_core::error::{BurrowError, BurrowResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Address the control listener binds.
    #[serde(default = "default_ctl_addr")]
    pub ctl_addr: String,
    /// Host string advertised in every public and internal address. An IP
    /// literal or hostname; never auto-detected.
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            ctl_addr: default_ctl_addr(),
            host: default_host(),
        }
    }
}

fn default_ctl_addr() -> String {
    "0.0.0.0:2222".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ctl_addr: String,
    pub host: String,
}

impl ServerConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used silently. CLI
    /// arguments, when `Some`, take precedence over file values.
    pub fn load(
        config_path: Option<&Path>,
        cli_ctl_addr: Option<&str>,
        cli_host: Option<&str>,
    ) -> BurrowResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| BurrowError::Other(format!("config parse error: {e}")))?
            } else {
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self {
            ctl_addr: cli_ctl_addr
                .map(|s| s.to_string())
                .unwrap_or(file_config.server.ctl_addr),
            host: cli_host
                .map(|s| s.to_string())
                .unwrap_or(file_config.server.host),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file() {
        let cfg = ServerConfig::load(None, None, None).unwrap();
        assert_eq!(cfg.ctl_addr, "0.0.0.0:2222");
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn cli_overrides_win() {
        let cfg = ServerConfig::load(None, Some("0.0.0.0:9000"), Some("relay.example.org")).unwrap();
        assert_eq!(cfg.ctl_addr, "0.0.0.0:9000");
        assert_eq!(cfg.host, "relay.example.org");
    }

    #[test]
    fn file_values_parse() {
        let parsed: ConfigFile = toml::from_str(
            "[server]\nctl_addr = \"0.0.0.0:3333\"\nhost = \"198.51.100.7\"\n",
        )
        .unwrap();
        assert_eq!(parsed.server.ctl_addr, "0.0.0.0:3333");
        assert_eq!(parsed.server.host, "198.51.100.7");
    }
}
