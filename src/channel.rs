//! Line channel to one subprocess
//!
//! Owns a child process with piped stdio. A reader thread forwards stdout
//! lines over a crossbeam channel (so a receive can race a deadline), and a
//! second thread keeps the last few stderr lines for error messages.
//!
//! The channel never restarts itself. Once the child has exited every
//! `send`/`receive` fails with [`ChannelError::Dead`]; restarting is the
//! owner's job.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use thiserror::Error;

/// Number of stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long to wait after SIGTERM before killing outright.
const TERM_WAIT: Duration = Duration::from_millis(500);
/// How long to wait for an exit status once stdout has closed.
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Process is dead ({0})")]
    Dead(String),
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Line contains a line break: {0:?}")]
    EmbeddedNewline(String),
}

impl ChannelError {
    /// Dead and timed-out processes both go down the restart path.
    pub fn is_dead(&self) -> bool {
        matches!(self, ChannelError::Dead(_) | ChannelError::Timeout(_))
    }
}

/// Synchronous line pipe to a single child process.
#[derive(Debug)]
pub struct LineChannel {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_reader: Option<JoinHandle<()>>,
    grace: Duration,
    finished: bool,
}

impl LineChannel {
    /// Spawn `command` with all three stdio streams piped.
    ///
    /// `grace` is how long [`shutdown`](Self::shutdown) waits for the child
    /// to exit on its own after stdin is closed.
    pub fn spawn(mut command: Command, grace: Duration) -> Result<Self, ChannelError> {
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ChannelError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ChannelError::Dead("stdout was not captured".to_string()));
            }
        };

        let (tx, rx) = unbounded::<String>();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(pid, error = %e, "stdout read failed");
                        break;
                    }
                }
            }
        });

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_reader = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    tracing::debug!(pid, "stderr: {}", line);
                    let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        tracing::debug!(pid, program = %program, "Spawned line channel");

        Ok(Self {
            child,
            stdin,
            lines: rx,
            stderr_tail,
            stderr_reader,
            grace,
            finished: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// True while the child has not exited.
    pub fn is_alive(&mut self) -> bool {
        !self.finished && matches!(self.child.try_wait(), Ok(None))
    }

    /// Write one line (a newline is appended) and flush.
    pub fn send(&mut self, line: &str) -> Result<(), ChannelError> {
        if line.contains(['\n', '\r']) {
            return Err(ChannelError::EmbeddedNewline(line.to_string()));
        }
        if !self.is_alive() {
            return Err(self.dead("exited before write"));
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ChannelError::Dead("stdin already closed".to_string()));
        };

        let result = stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.write_all(b"\n"))
            .and_then(|_| stdin.flush());
        if let Err(e) = result {
            return Err(self.dead(&format!("write failed: {e}")));
        }

        tracing::debug!(pid = self.child.id(), "-> {}", line);
        Ok(())
    }

    /// Block for the next stdout line, at most `timeout` if given.
    ///
    /// Lines already produced by a child that has since exited are still
    /// delivered; only an empty, closed stdout reports the child dead.
    pub fn receive(&mut self, timeout: Option<Duration>) -> Result<String, ChannelError> {
        let received = match timeout {
            Some(t) => match self.lines.recv_timeout(t) {
                Ok(line) => Ok(line),
                Err(RecvTimeoutError::Timeout) => return Err(ChannelError::Timeout(t)),
                Err(RecvTimeoutError::Disconnected) => Err(()),
            },
            None => self.lines.recv().map_err(|_| ()),
        };

        match received {
            Ok(mut line) => {
                if line.ends_with('\r') {
                    line.pop();
                }
                tracing::debug!(pid = self.child.id(), "<- {}", line);
                Ok(line)
            }
            Err(()) => Err(self.dead("stdout closed")),
        }
    }

    /// Receive exactly `count` lines.
    pub fn receive_lines(
        &mut self,
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>, ChannelError> {
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(self.receive(timeout)?);
        }
        Ok(lines)
    }

    /// Last stderr lines, oldest first.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|p| p.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Close stdin, give the child `grace` to exit, then SIGTERM, then kill.
    ///
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        drop(self.stdin.take());

        if self.wait_for_exit(self.grace).is_none() {
            tracing::debug!(pid = self.child.id(), "Child ignored EOF, terminating");
            self.terminate();
            if self.wait_for_exit(TERM_WAIT).is_none() {
                tracing::warn!(pid = self.child.id(), "Child ignored SIGTERM, killing");
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
        self.finished = true;
    }

    /// Kill immediately. Used when the child is considered hung.
    pub fn kill(&mut self) {
        if self.finished {
            return;
        }
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.finished = true;
    }

    fn wait_for_exit(&mut self, limit: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + limit;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(pid = self.child.id(), error = %e, "try_wait failed");
                    return None;
                }
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
        let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            let _ = self.child.kill();
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.kill();
    }

    /// Build a `Dead` error carrying the exit status and stderr tail.
    fn dead(&mut self, what: &str) -> ChannelError {
        let status = self.wait_for_exit(EXIT_STATUS_WAIT);
        // Let the stderr reader drain what the child wrote before exiting
        if let Some(reader) = &self.stderr_reader {
            let deadline = Instant::now() + EXIT_STATUS_WAIT;
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(EXIT_POLL_INTERVAL);
            }
        }
        let mut msg = what.to_string();
        if let Some(status) = status {
            msg.push_str(&format!(", {status}"));
        }
        let tail = self.stderr_tail();
        if !tail.is_empty() {
            msg.push_str(&format!(", stderr: {tail}"));
        }
        ChannelError::Dead(msg)
    }
}

impl Drop for LineChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
