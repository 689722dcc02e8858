//! Supervised git-annex batch process
//!
//! A [`BatchProcess`] owns at most one running [`LineChannel`] for one
//! (repository, command kind) pair. Every [`invoke`](BatchProcess::invoke)
//! is a full write-then-read round trip; nothing is pipelined.
//!
//! Recovery: when the subprocess turns out dead (or silent past the
//! configured timeout) the request is retried exactly once on a fresh
//! subprocess. A second failure is returned as [`BatchError::Process`].
//! Protocol errors are never retried.

mod command;

pub use command::{BatchShape, CommandKind};

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::channel::{ChannelError, LineChannel};
use crate::codec::{Codec, ProtocolError};
use crate::config::Config;
use crate::runner::RunnerError;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to start {kind} batch process in {}: {source}", .repo.display())]
    Spawn {
        repo: PathBuf,
        kind: CommandKind,
        #[source]
        source: ChannelError,
    },
    #[error("{kind} batch process in {} failed after one restart: {source}", .repo.display())]
    Process {
        repo: PathBuf,
        kind: CommandKind,
        #[source]
        source: ChannelError,
    },
    #[error("Protocol error from {kind} batch process in {}: {source}", .repo.display())]
    Protocol {
        repo: PathBuf,
        kind: CommandKind,
        #[source]
        source: ProtocolError,
    },
    #[error("Path '{}' is not in a git repository", .0.display())]
    NotAGitRepo(PathBuf),
    #[error("{kind} batch process speaks {expected}, not {requested}")]
    ShapeMismatch {
        kind: CommandKind,
        expected: BatchShape,
        requested: BatchShape,
    },
    #[error("Empty annex command prefix")]
    EmptyCommand,
    #[error("Path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),
    #[error("git-annex version check failed")]
    Version(#[source] RunnerError),
}

/// Substrings git and git-annex print when run outside a repository.
const NOT_A_REPO_MARKERS: [&str; 2] = ["not in a git repository", "not a git repository"];

fn mentions_not_a_repo(err: &ChannelError) -> bool {
    let msg = err.to_string().to_lowercase();
    NOT_A_REPO_MARKERS.iter().any(|m| msg.contains(m))
}

/// One long-lived batch subprocess, started lazily and restarted on death.
#[derive(Debug)]
pub struct BatchProcess {
    repo: PathBuf,
    kind: CommandKind,
    prefix: Vec<String>,
    timeout: Option<Duration>,
    grace: Duration,
    channel: Option<LineChannel>,
    starts: usize,
}

impl BatchProcess {
    /// Create a stopped process for `kind` in `repo`.
    ///
    /// Nothing is spawned until [`start`](Self::start) or the first
    /// [`invoke`](Self::invoke).
    pub fn new(repo: impl Into<PathBuf>, kind: CommandKind, config: &Config) -> Self {
        Self {
            repo: repo.into(),
            kind,
            prefix: config.annex_command_or_default(),
            timeout: config.response_timeout(),
            grace: config.shutdown_grace(),
            channel: None,
            starts: 0,
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// How many subprocesses have been spawned over this handle's lifetime.
    pub fn starts(&self) -> usize {
        self.starts
    }

    pub fn pid(&self) -> Option<u32> {
        self.channel.as_ref().map(LineChannel::pid)
    }

    /// True if a subprocess has been started and has not exited.
    pub fn is_running(&mut self) -> bool {
        self.channel.as_mut().is_some_and(LineChannel::is_alive)
    }

    /// True if a subprocess was started and has since exited.
    pub fn is_dead(&mut self) -> bool {
        self.channel.is_some() && !self.is_running()
    }

    /// Ensure a live subprocess, spawning (or respawning) one if needed.
    pub fn start(&mut self) -> Result<(), BatchError> {
        if self.is_running() {
            return Ok(());
        }
        if self.channel.is_some() {
            tracing::info!(
                kind = %self.kind,
                repo = %self.repo.display(),
                "Batch process exited, restarting"
            );
            self.discard();
        }

        if !self.repo.is_dir() {
            return Err(BatchError::NotAGitRepo(self.repo.clone()));
        }
        let command = self
            .kind
            .command(&self.prefix, &self.repo)
            .ok_or(BatchError::EmptyCommand)?;
        let channel = LineChannel::spawn(command, self.grace).map_err(|source| {
            BatchError::Spawn {
                repo: self.repo.clone(),
                kind: self.kind,
                source,
            }
        })?;

        tracing::debug!(
            kind = %self.kind,
            repo = %self.repo.display(),
            pid = channel.pid(),
            "Started batch process"
        );
        self.starts += 1;
        self.channel = Some(channel);
        Ok(())
    }

    /// Kill the current subprocess (if any) and start a fresh one.
    pub fn restart(&mut self) -> Result<(), BatchError> {
        self.discard();
        self.start()
    }

    /// Gracefully stop the subprocess. A later `invoke` starts a new one.
    pub fn shutdown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            tracing::debug!(kind = %self.kind, pid = channel.pid(), "Shutting down batch process");
            channel.shutdown();
        }
    }

    /// Send one request and decode its response.
    ///
    /// Starts the subprocess on first use. If it is dead (or times out), it
    /// is restarted and the request retried exactly once.
    pub fn invoke<C: Codec>(
        &mut self,
        codec: &C,
        request: &C::Request,
    ) -> Result<C::Response, BatchError> {
        if C::SHAPE != self.kind.shape() {
            return Err(BatchError::ShapeMismatch {
                kind: self.kind,
                expected: self.kind.shape(),
                requested: C::SHAPE,
            });
        }
        let _span = tracing::info_span!("batch_invoke", kind = %self.kind).entered();

        let line = codec.encode(request).map_err(|e| self.protocol(e))?;
        let expected = codec.response_lines(request);

        self.start()?;
        let lines = match self.roundtrip(&line, expected) {
            Ok(lines) => lines,
            Err(first) if first.is_dead() => {
                if mentions_not_a_repo(&first) {
                    self.discard();
                    return Err(BatchError::NotAGitRepo(self.repo.clone()));
                }
                tracing::warn!(
                    kind = %self.kind,
                    repo = %self.repo.display(),
                    error = %first,
                    "Batch process died, restarting and retrying once"
                );
                self.restart()?;
                match self.roundtrip(&line, expected) {
                    Ok(lines) => lines,
                    Err(second) => {
                        self.discard();
                        return Err(self.process_error(second));
                    }
                }
            }
            Err(ChannelError::EmbeddedNewline(l)) => {
                return Err(self.protocol(ProtocolError::EmbeddedNewline(l)));
            }
            Err(other) => {
                self.discard();
                return Err(self.process_error(other));
            }
        };

        codec.decode(&lines).map_err(|e| self.protocol(e))
    }

    fn roundtrip(&mut self, line: &str, expected: usize) -> Result<Vec<String>, ChannelError> {
        let timeout = self.timeout;
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| ChannelError::Dead("not started".to_string()))?;
        channel.send(line)?;
        channel.receive_lines(expected, timeout)
    }

    /// Drop the current subprocess without ceremony.
    fn discard(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.kill();
        }
    }

    fn protocol(&self, source: ProtocolError) -> BatchError {
        BatchError::Protocol {
            repo: self.repo.clone(),
            kind: self.kind,
            source,
        }
    }

    fn process_error(&self, source: ChannelError) -> BatchError {
        if mentions_not_a_repo(&source) {
            return BatchError::NotAGitRepo(self.repo.clone());
        }
        BatchError::Process {
            repo: self.repo.clone(),
            kind: self.kind,
            source,
        }
    }
}

impl Drop for BatchProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}
