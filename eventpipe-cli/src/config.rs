//! On-disk bootstrap config, following `cognitod::config::Config`:
//! `#[serde(default)]` per-field defaults, missing/unparseable file
//! falls back to `Config::default()`, path overridable via an env var.

use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/eventpipe/eventpipe.toml";
const ENV_CONFIG_PATH: &str = "EVENTPIPE_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Loads from `path`, or `$EVENTPIPE_CONFIG`, or the default path, in
    /// that order. A missing or unparseable file yields defaults rather
    /// than an error — the CLI's flags alone are enough to run.
    pub fn load(path: Option<&std::path::Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var(ENV_CONFIG_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_circular_buffer_mb")]
    pub circular_buffer_mb: usize,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub rundown_keyword: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            circular_buffer_mb: default_circular_buffer_mb(),
            providers: Vec::new(),
            rundown_keyword: 0,
        }
    }
}

fn default_circular_buffer_mb() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Some(std::path::Path::new("/nonexistent/eventpipe.toml")));
        assert_eq!(config.session.circular_buffer_mb, 256);
        assert!(config.session.providers.is_empty());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eventpipe.toml");
        std::fs::write(&path, "[session]\nproviders = [\"*\"]\n").unwrap();
        let config = Config::load(Some(path.as_path()));
        assert_eq!(config.session.providers, vec!["*".to_string()]);
        assert_eq!(config.session.circular_buffer_mb, 256);
    }
}
