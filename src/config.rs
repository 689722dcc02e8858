//! Configuration file support for annex-batch
//!
//! Config files are loaded in order (later overrides earlier):
//! 1. `~/.config/annex-batch/config.toml` (user defaults)
//! 2. `.annex-batch.toml` in the repository root (project overrides)
//!
//! CLI flags override all config file values.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Configuration options loaded from config files
///
/// # Example
///
/// ```toml
/// # ~/.config/annex-batch/config.toml or .annex-batch.toml
/// annex_command = ["git", "annex"]   # Command prefix for every subprocess
/// response_timeout_ms = 30000        # Treat a silent process as dead
/// shutdown_grace_ms = 2000           # Wait after EOF before SIGTERM
/// cache_capacity = 64                # Cached enumeration results
/// verbose = false                    # Enable debug logging
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command prefix the batch subcommand is appended to
    pub annex_command: Option<Vec<String>>,
    /// Per-response timeout; unset blocks until the process answers or dies
    pub response_timeout_ms: Option<u64>,
    /// Grace period between closing stdin and SIGTERM on shutdown
    pub shutdown_grace_ms: Option<u64>,
    /// Maximum number of cached enumeration results across repositories
    pub cache_capacity: Option<usize>,
    /// Enable verbose mode by default
    pub verbose: Option<bool>,
}

impl Config {
    /// Load configuration from user and project config files
    pub fn load(project_root: &Path) -> Self {
        let user_config = dirs::config_dir()
            .map(|d| d.join("annex-batch/config.toml"))
            .and_then(|p| Self::load_file(&p))
            .unwrap_or_default();

        let project_config =
            Self::load_file(&project_root.join(".annex-batch.toml")).unwrap_or_default();

        // Project overrides user
        let merged = user_config.override_with(project_config);
        tracing::debug!(
            annex_command = ?merged.annex_command,
            response_timeout_ms = ?merged.response_timeout_ms,
            shutdown_grace_ms = ?merged.shutdown_grace_ms,
            cache_capacity = ?merged.cache_capacity,
            verbose = ?merged.verbose,
            "Effective config after merge"
        );
        merged
    }

    /// Load configuration from a specific file
    pub(crate) fn load_file(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", path.display(), e);
                return None;
            }
        };

        match toml::from_str::<Self>(&content) {
            Ok(config) => {
                if matches!(&config.annex_command, Some(c) if c.is_empty()) {
                    tracing::warn!(
                        "Ignoring empty annex_command in {}, using default",
                        path.display()
                    );
                }
                tracing::debug!(path = %path.display(), "Loaded config");
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Layer another config on top (other overrides self where present)
    pub fn override_with(self, other: Self) -> Self {
        Config {
            annex_command: other
                .annex_command
                .filter(|c| !c.is_empty())
                .or(self.annex_command),
            response_timeout_ms: other.response_timeout_ms.or(self.response_timeout_ms),
            shutdown_grace_ms: other.shutdown_grace_ms.or(self.shutdown_grace_ms),
            cache_capacity: other.cache_capacity.or(self.cache_capacity),
            verbose: other.verbose.or(self.verbose),
        }
    }

    // ===== Accessors with defaults =====

    /// Default grace period before SIGTERM on shutdown
    pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;
    /// Default number of cached enumeration results
    pub const DEFAULT_CACHE_CAPACITY: usize = 64;

    /// Command prefix, `git annex` unless configured
    pub fn annex_command_or_default(&self) -> Vec<String> {
        match &self.annex_command {
            Some(c) if !c.is_empty() => c.clone(),
            _ => vec!["git".to_string(), "annex".to_string()],
        }
    }

    /// Response timeout; `None` (or 0) blocks indefinitely
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(
            self.shutdown_grace_ms
                .unwrap_or(Self::DEFAULT_SHUTDOWN_GRACE_MS),
        )
    }

    /// Cache capacity with default fallback, never zero
    pub fn cache_capacity_or_default(&self) -> usize {
        self.cache_capacity
            .filter(|&c| c > 0)
            .unwrap_or(Self::DEFAULT_CACHE_CAPACITY)
    }

    /// Get verbose mode with default fallback (false)
    pub fn verbose_or_default(&self) -> bool {
        self.verbose.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_valid_config() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join(".annex-batch.toml");
        std::fs::write(
            &config_path,
            "annex_command = [\"git-annex\"]\nresponse_timeout_ms = 500\n",
        )
        .unwrap();

        let config = Config::load_file(&config_path).unwrap();
        assert_eq!(config.annex_command, Some(vec!["git-annex".to_string()]));
        assert_eq!(config.response_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_file(&dir.path().join("nonexistent.toml"));
        assert!(config.is_none());
    }

    #[test]
    fn test_load_malformed_toml() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join(".annex-batch.toml");
        std::fs::write(&config_path, "not valid [[[").unwrap();

        let config = Config::load_file(&config_path);
        assert!(config.is_none());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.annex_command_or_default(), vec!["git", "annex"]);
        assert_eq!(config.response_timeout(), None);
        assert_eq!(config.shutdown_grace(), Duration::from_millis(2000));
        assert_eq!(config.cache_capacity_or_default(), 64);
        assert!(!config.verbose_or_default());
    }

    #[test]
    fn test_zero_values_fall_back() {
        let config = Config {
            response_timeout_ms: Some(0),
            cache_capacity: Some(0),
            annex_command: Some(vec![]),
            ..Default::default()
        };
        assert_eq!(config.response_timeout(), None);
        assert_eq!(config.cache_capacity_or_default(), 64);
        assert_eq!(config.annex_command_or_default(), vec!["git", "annex"]);
    }

    #[test]
    fn test_merge_override() {
        let base = Config {
            annex_command: Some(vec!["git-annex".into()]),
            response_timeout_ms: Some(100),
            ..Default::default()
        };
        let override_cfg = Config {
            response_timeout_ms: Some(200),
            cache_capacity: Some(8),
            annex_command: Some(vec![]),
            ..Default::default()
        };

        let merged = base.override_with(override_cfg);
        assert_eq!(merged.response_timeout_ms, Some(200));
        assert_eq!(merged.cache_capacity, Some(8));
        // Empty command in the overlay does not clobber the base
        assert_eq!(merged.annex_command, Some(vec!["git-annex".to_string()]));
    }
}
