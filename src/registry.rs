//! Table of running batch processes
//!
//! One [`BatchProcess`] per (repository, command kind). The registry is an
//! ordinary value: construct it, pass it down, and tear it down with
//! [`ProcessRegistry::shutdown_all`] (or by dropping it). It never outlives
//! the host program and is never persisted.
//!
//! Lookups and inserts happen under one table lock, so concurrent first use
//! of the same pair yields the same handle. Starting the subprocess happens
//! under the handle's own lock, so exactly one subprocess is spawned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::batch::{BatchError, BatchProcess, CommandKind};
use crate::codec::Codec;
use crate::config::Config;

/// Shared, serialized handle to one batch process.
pub type ProcessHandle = Arc<Mutex<BatchProcess>>;

type RegistryKey = (PathBuf, CommandKind);

#[derive(Debug)]
pub struct ProcessRegistry {
    config: Config,
    table: Mutex<HashMap<RegistryKey, ProcessHandle>>,
}

/// Lock a process handle, recovering from a poisoned mutex.
///
/// A panic mid-request can leave the subprocess mid-response; the next
/// invoke on a desynchronized stream surfaces as a protocol or process
/// error rather than a panic.
pub fn lock(handle: &ProcessHandle) -> MutexGuard<'_, BatchProcess> {
    handle.lock().unwrap_or_else(|p| p.into_inner())
}

impl ProcessRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RegistryKey, ProcessHandle>> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Repository identity: canonical path when resolvable.
    fn identity(repo: &Path) -> PathBuf {
        dunce::canonicalize(repo).unwrap_or_else(|_| repo.to_path_buf())
    }

    /// Return the live process for (`repo`, `kind`), starting it if needed.
    ///
    /// Idempotent: repeated calls return the same handle. A process found
    /// dead is restarted in place.
    pub fn get(&self, repo: &Path, kind: CommandKind) -> Result<ProcessHandle, BatchError> {
        let key = (Self::identity(repo), kind);
        let handle = {
            let mut table = self.table();
            Arc::clone(table.entry(key.clone()).or_insert_with(|| {
                tracing::debug!(kind = %kind, repo = %key.0.display(), "Registering batch process");
                Arc::new(Mutex::new(BatchProcess::new(key.0.clone(), kind, &self.config)))
            }))
        };

        let start = lock(&handle).start();
        if let Err(e) = start {
            // Leave no broken entry behind; the next get starts from scratch
            let mut table = self.table();
            if table.get(&key).is_some_and(|h| Arc::ptr_eq(h, &handle)) {
                table.remove(&key);
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Look up (or start) the process and run one request through it.
    pub fn invoke<C: Codec>(
        &self,
        repo: &Path,
        kind: CommandKind,
        codec: &C,
        request: &C::Request,
    ) -> Result<C::Response, BatchError> {
        let handle = self.get(repo, kind)?;
        let mut process = lock(&handle);
        process.invoke(codec, request)
    }

    /// True if a process for the pair is tracked (running or not).
    pub fn contains(&self, repo: &Path, kind: CommandKind) -> bool {
        self.table().contains_key(&(Self::identity(repo), kind))
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Stop and forget one process. Returns false if none was tracked.
    pub fn shutdown(&self, repo: &Path, kind: CommandKind) -> bool {
        let removed = self.table().remove(&(Self::identity(repo), kind));
        match removed {
            Some(handle) => {
                lock(&handle).shutdown();
                true
            }
            None => false,
        }
    }

    /// Stop every process tracked for one repository.
    pub fn shutdown_repo(&self, repo: &Path) -> usize {
        let id = Self::identity(repo);
        let handles: Vec<ProcessHandle> = {
            let mut table = self.table();
            let keys: Vec<RegistryKey> = table.keys().filter(|(r, _)| *r == id).cloned().collect();
            keys.into_iter().filter_map(|k| table.remove(&k)).collect()
        };
        for handle in &handles {
            lock(handle).shutdown();
        }
        handles.len()
    }

    /// Stop every tracked process and empty the table.
    pub fn shutdown_all(&self) {
        let handles: Vec<(RegistryKey, ProcessHandle)> = self.table().drain().collect();
        if !handles.is_empty() {
            tracing::info!(count = handles.len(), "Shutting down batch processes");
        }
        for ((repo, kind), handle) in handles {
            tracing::debug!(kind = %kind, repo = %repo.display(), "Stopping batch process");
            lock(&handle).shutdown();
        }
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
