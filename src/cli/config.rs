//! Repository root detection and config file application

use std::path::{Path, PathBuf};

use annex_batch::Config;

use super::Cli;

/// Find the repository root by walking up from `start` to the first
/// directory containing `.git` (a directory, or a file for worktrees).
pub(crate) fn find_repo_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Root the CLI operates on: `-C` if given, else the enclosing repository,
/// else the current directory.
pub(crate) fn resolve_root(cli: &Cli) -> PathBuf {
    if let Some(repo) = &cli.repo {
        return repo.clone();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_repo_root(&cwd).unwrap_or_else(|| {
        tracing::debug!("No enclosing git repository, using current directory");
        cwd
    })
}

/// Apply CLI flags on top of the config files. Flags always win.
pub(crate) fn apply_cli_overrides(cli: &mut Cli, config: Config) -> Config {
    if !cli.verbose && config.verbose_or_default() {
        cli.verbose = true;
    }
    config.override_with(Config {
        response_timeout_ms: cli.timeout_ms,
        verbose: Some(cli.verbose),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_find_repo_root_walks_up() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_repo_root(&nested).as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_flags_override_config() {
        let mut cli = Cli::parse_from(["annex-batch", "--timeout-ms", "250", "keys"]);
        let config = Config {
            response_timeout_ms: Some(5000),
            verbose: Some(true),
            ..Default::default()
        };
        let merged = apply_cli_overrides(&mut cli, config);
        assert_eq!(merged.response_timeout_ms, Some(250));
        assert!(cli.verbose);
        assert!(merged.verbose_or_default());
    }

    #[test]
    fn test_config_kept_without_flags() {
        let mut cli = Cli::parse_from(["annex-batch", "keys"]);
        let config = Config {
            response_timeout_ms: Some(5000),
            ..Default::default()
        };
        let merged = apply_cli_overrides(&mut cli, config);
        assert_eq!(merged.response_timeout_ms, Some(5000));
        assert!(!cli.verbose);
    }
}
