//! One-shot git-annex invocations
//!
//! Everything that is not a long-lived batch process: `init`, `version`,
//! `fromkey`, the `find`/`get` actions and the whole-repository
//! `metadata --json` listings the enumeration cache is filled from. Each
//! call spawns one process, waits for it and captures its output. Nothing
//! here is retried.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output};
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::cache::EnumerationSource;
use crate::config::Config;
use crate::types::{ActionRecord, FoundFile, Key, MetadataRecord};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Path '{}' is not in a git repository", .0.display())]
    NotAGitRepo(PathBuf),
    #[error("Repository version '{0}' is invalid")]
    InvalidVersion(String),
    #[error("`{}` failed ({status}): {stderr}", .args.join(" "))]
    CommandFailed {
        args: Vec<String>,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Malformed output from `{command}`: {source}")]
    Json {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unrecognized git-annex version {0:?}")]
    UnparsableVersion(String),
    #[error("git-annex {found} is older than the required {minimum}")]
    UnsupportedVersion {
        found: AnnexVersion,
        minimum: AnnexVersion,
    },
    #[error("Empty annex command prefix")]
    EmptyCommand,
    #[error("Path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),
}

/// Leading `major.minor` of `git annex version --raw`, e.g. `8.20210223`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AnnexVersion {
    pub major: u32,
    pub minor: u64,
}

impl AnnexVersion {
    /// Oldest git-annex with the batch JSON metadata interface this crate speaks.
    pub const MINIMUM: AnnexVersion = AnnexVersion {
        major: 6,
        minor: 20170101,
    };

    pub fn parse(raw: &str) -> Option<Self> {
        static VERSION_RE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^([0-9]+)\.([0-9]+)").expect("valid regex"));
        let caps = VERSION_RE.captures(raw.trim())?;
        Some(Self {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
        })
    }
}

impl fmt::Display for AnnexVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Which files a `find` or `get` covers.
///
/// Empty means the whole worktree. `match_opts` are passed through as-is
/// (`--in=here`, `--metadata=tag=x`, `--not`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub paths: Vec<PathBuf>,
    pub match_opts: Vec<String>,
    pub branch: Option<String>,
}

impl Selection {
    pub fn paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn matching(mut self, opt: impl Into<String>) -> Self {
        self.match_opts.push(opt.into());
        self
    }

    /// Operate on files in `branch` instead of the worktree.
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    fn push_paths(&self, args: &mut Vec<String>) -> Result<(), RunnerError> {
        for path in &self.paths {
            let path = path
                .to_str()
                .ok_or_else(|| RunnerError::NonUtf8Path(path.clone()))?;
            args.push(path.to_string());
        }
        Ok(())
    }

    fn push_options(&self, args: &mut Vec<String>) {
        args.extend(self.match_opts.iter().cloned());
        args.extend(self.branch.as_ref().map(|b| format!("--branch={}", b)));
    }
}

/// Runs one-shot `git annex` commands in a repository root.
#[derive(Debug, Clone)]
pub struct AnnexRunner {
    root: PathBuf,
    prefix: Vec<String>,
}

const NOT_A_REPO: &str = "not in a git repository";
const BAD_VERSION_OPTION: &str = "option --version:";

impl AnnexRunner {
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            root: root.into(),
            prefix: config.annex_command_or_default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run with captured output, whatever the exit status.
    pub fn output<I, S>(&self, args: I) -> Result<Output, RunnerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (program, rest) = self.prefix.split_first().ok_or(RunnerError::EmptyCommand)?;
        if !self.root.is_dir() {
            return Err(RunnerError::NotAGitRepo(self.root.clone()));
        }
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        tracing::debug!(program = %program, args = ?args, root = %self.root.display(), "Running");

        Command::new(program)
            .args(rest)
            .args(&args)
            .current_dir(&self.root)
            .output()
            .map_err(|source| RunnerError::Io {
                program: program.clone(),
                source,
            })
    }

    /// Run and return stdout. Non-zero exit is an error carrying stderr.
    pub fn run<I, S>(&self, args: I) -> Result<String, RunnerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let output = self.output(&args)?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            if stderr.to_lowercase().contains(NOT_A_REPO) {
                return Err(RunnerError::NotAGitRepo(self.root.clone()));
            }
            tracing::debug!(status = %output.status, stderr = %stderr.trim(), "Command failed");
            return Err(RunnerError::CommandFailed {
                args,
                status: output.status,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `git annex init [description] [--version=N]`
    pub fn init(&self, description: Option<&str>, version: Option<&str>) -> Result<(), RunnerError> {
        let _span = tracing::info_span!("annex_init", root = %self.root.display()).entered();
        let mut args = vec!["init".to_string()];
        args.extend(description.map(str::to_string));
        args.extend(version.map(|v| format!("--version={}", v)));

        match self.run(&args) {
            Ok(_) => Ok(()),
            Err(RunnerError::CommandFailed { stderr, .. })
                if stderr.contains(BAD_VERSION_OPTION) =>
            {
                Err(RunnerError::InvalidVersion(
                    version.unwrap_or_default().to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Installed git-annex version (`version --raw`).
    pub fn version(&self) -> Result<AnnexVersion, RunnerError> {
        let raw = self.run(["version", "--raw"])?;
        AnnexVersion::parse(&raw).ok_or_else(|| RunnerError::UnparsableVersion(raw.trim().to_string()))
    }

    /// Fail unless git-annex is at least [`AnnexVersion::MINIMUM`].
    pub fn ensure_supported(&self) -> Result<AnnexVersion, RunnerError> {
        let found = self.version()?;
        tracing::debug!(version = %found, "git-annex version");
        if found < AnnexVersion::MINIMUM {
            return Err(RunnerError::UnsupportedVersion {
                found,
                minimum: AnnexVersion::MINIMUM,
            });
        }
        Ok(found)
    }

    /// Run and decode stdout as one JSON object per line.
    fn json_lines<T: DeserializeOwned>(&self, args: &[String]) -> Result<Vec<T>, RunnerError> {
        let stdout = self.run(args)?;
        stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| RunnerError::Json {
                    command: args.join(" "),
                    source,
                })
            })
            .collect()
    }

    /// Every metadata record: one per worktree file, or with `all` one per
    /// key known to the repository.
    pub fn metadata_records(&self, all: bool) -> Result<Vec<MetadataRecord>, RunnerError> {
        let mut args = vec!["metadata".to_string(), "--json".to_string()];
        if all {
            args.push("--all".to_string());
        }
        self.json_lines(&args)
    }

    /// `find --json`: annexed files matching `selection`.
    pub fn find(&self, selection: &Selection) -> Result<Vec<FoundFile>, RunnerError> {
        let mut args = vec!["find".to_string(), "--json".to_string()];
        selection.push_paths(&mut args)?;
        selection.push_options(&mut args);
        self.json_lines(&args)
    }

    /// `get --json`: fetch content for `selection`, or for one `key`.
    ///
    /// git-annex exits non-zero when any transfer fails, which surfaces
    /// as [`RunnerError::CommandFailed`].
    pub fn get(
        &self,
        selection: &Selection,
        key: Option<&Key>,
    ) -> Result<Vec<ActionRecord>, RunnerError> {
        let _span = tracing::info_span!("annex_get", root = %self.root.display()).entered();
        let mut args = vec!["get".to_string(), "--json".to_string()];
        selection.push_paths(&mut args)?;
        args.extend(key.map(|k| format!("--key={}", k)));
        selection.push_options(&mut args);
        self.json_lines(&args)
    }

    /// `fromkey KEY FILE`: add a worktree file pointing at a known key.
    pub fn fromkey(&self, key: &Key, file: &Path) -> Result<(), RunnerError> {
        let file = file
            .to_str()
            .ok_or_else(|| RunnerError::NonUtf8Path(file.to_path_buf()))?;
        self.run(["fromkey", key.as_str(), file])?;
        Ok(())
    }
}

impl EnumerationSource for AnnexRunner {
    fn repository(&self) -> &Path {
        &self.root
    }

    fn all_keys(&self) -> Result<BTreeSet<Key>, RunnerError> {
        Ok(self
            .metadata_records(true)?
            .into_iter()
            .filter_map(|r| r.key.map(Key::from))
            .collect())
    }

    fn worktree_keys(&self) -> Result<BTreeSet<Key>, RunnerError> {
        Ok(self
            .metadata_records(false)?
            .into_iter()
            .filter_map(|r| r.key.map(Key::from))
            .collect())
    }

    fn all_files(&self) -> Result<BTreeSet<PathBuf>, RunnerError> {
        Ok(self
            .metadata_records(false)?
            .into_iter()
            .filter_map(|r| r.file.map(PathBuf::from))
            .collect())
    }

    fn all_fields(&self) -> Result<BTreeSet<String>, RunnerError> {
        Ok(self
            .metadata_records(true)?
            .iter()
            .flat_map(|r| r.user_fields().map(str::to_string))
            .collect())
    }
}
