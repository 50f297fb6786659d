//! Daemon configuration (TOML).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::url::DEFAULT_PORT;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub log_level: String,
    pub log_file: String,
    pub instances: Vec<InstanceConfig>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            log_level: "info".to_string(),
            log_file: "stdout".to_string(),
            instances: Vec::new(),
        }
    }
}

/// One exported subtree. Read-only after daemon start.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub name: String,
    pub path: PathBuf,
    pub password: String,
    /// Comma-separated exclude patterns, also handed to clients at auth.
    pub exclude: String,
    pub host_allow: String,
    pub host_deny: String,
    pub log_level: String,
    pub log_file: String,
}

pub fn load(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut cfg: Config =
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
    for inst in &mut cfg.instances {
        if inst.name.is_empty() {
            inst.name = "default".to_string();
        }
        if inst.log_level.is_empty() {
            inst.log_level = "info".to_string();
        }
        if inst.log_file.is_empty() {
            inst.log_file = "stdout".to_string();
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let toml = r#"
address = "0.0.0.0"
port = 7963
log_level = "warn"
log_file = "/var/log/fleetsync.log"

[[instances]]
name = "media"
path = "/srv/media"
password = "secret"
exclude = "*.tmp,cache/"
host_allow = "10.0.0.0/8"
host_deny = "10.9.0.0/16"

[[instances]]
path = "/srv/other"
"#;
        let mut cfg: Config = toml::from_str(toml).unwrap();
        for inst in &mut cfg.instances {
            if inst.name.is_empty() {
                inst.name = "default".to_string();
            }
        }
        assert_eq!(cfg.address, "0.0.0.0");
        assert_eq!(cfg.port, 7963);
        assert_eq!(cfg.instances.len(), 2);
        assert_eq!(cfg.instances[0].name, "media");
        assert_eq!(cfg.instances[0].exclude, "*.tmp,cache/");
        assert_eq!(cfg.instances[1].name, "default");
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.address, "127.0.0.1");
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.log_file, "stdout");
        assert!(cfg.instances.is_empty());
    }

    #[test]
    fn load_normalizes_instance_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetsync.toml");
        fs::write(&path, "[[instances]]\npath = \"/data\"\n").unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.instances[0].name, "default");
        assert_eq!(cfg.instances[0].log_level, "info");
        assert_eq!(cfg.instances[0].log_file, "stdout");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load(Path::new("/nonexistent/fleetsync.toml")).is_err());
    }
}
