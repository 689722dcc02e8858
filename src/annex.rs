//! Repository handle tying the layers together
//!
//! A [`Session`] owns the process registry and the enumeration cache for
//! the host program. [`Session::open`] hands out an [`Annex`] bound to one
//! repository root; all handles opened from the same session share batch
//! subprocesses and cached listings.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use crate::batch::{BatchError, CommandKind};
use crate::cache::{AnnexCache, CachePolicy};
use crate::codec::{KeyValueCodec, MetadataCodec, RawCodec};
use crate::config::Config;
use crate::metadata::{MetadataBackend, MetadataView, Target};
use crate::registry::ProcessRegistry;
use crate::runner::{AnnexRunner, AnnexVersion, RunnerError, Selection};
use crate::types::{ActionRecord, FoundFile, Key, MetadataQuery, MetadataRecord};

/// Process-lifetime state: running batch processes and cached listings.
#[derive(Debug)]
pub struct Session {
    config: Config,
    registry: ProcessRegistry,
    cache: AnnexCache,
    version: OnceCell<AnnexVersion>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self {
            registry: ProcessRegistry::new(config.clone()),
            cache: AnnexCache::new(config.cache_capacity_or_default()),
            version: OnceCell::new(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &AnnexCache {
        &self.cache
    }

    /// Bind a handle to an existing, annex-initialized repository root.
    ///
    /// The first open in a session refuses git-annex older than
    /// [`AnnexVersion::MINIMUM`]. Beyond that only checks that the
    /// directory exists; a directory that is not a repository is reported
    /// by the first command run in it.
    pub fn open(&self, root: impl AsRef<Path>) -> Result<Annex<'_>, BatchError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(BatchError::NotAGitRepo(root.to_path_buf()));
        }
        let root = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        tracing::debug!(root = %root.display(), "Opening repository");
        match self.ensure_supported(&root) {
            Ok(_) => {}
            Err(RunnerError::NotAGitRepo(path)) => return Err(BatchError::NotAGitRepo(path)),
            Err(e) => return Err(BatchError::Version(e)),
        }
        Ok(Annex {
            runner: AnnexRunner::new(&root, &self.config),
            session: self,
            root,
        })
    }

    /// Installed git-annex version, checked against the minimum once per session.
    pub fn ensure_supported(&self, root: &Path) -> Result<AnnexVersion, RunnerError> {
        self.version
            .get_or_try_init(|| AnnexRunner::new(root, &self.config).ensure_supported())
            .copied()
    }

    /// Stop every batch process. Handles stay usable; the next request
    /// starts fresh processes.
    pub fn shutdown(&self) {
        self.registry.shutdown_all();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// One repository, as seen through a [`Session`].
#[derive(Debug)]
pub struct Annex<'s> {
    session: &'s Session,
    root: PathBuf,
    runner: AnnexRunner,
}

fn utf8(path: &Path) -> Result<&str, BatchError> {
    path.to_str()
        .ok_or_else(|| BatchError::NonUtf8Path(path.to_path_buf()))
}

/// Empty raw answers mean "not found".
fn non_empty(line: String) -> Option<String> {
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

impl<'s> Annex<'s> {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    /// One-shot command runner for this repository.
    pub fn runner(&self) -> &AnnexRunner {
        &self.runner
    }

    fn raw(&self, kind: CommandKind, arg: &str) -> Result<Option<String>, BatchError> {
        self.session
            .registry
            .invoke(&self.root, kind, &RawCodec, arg)
            .map(non_empty)
    }

    /// Key of an annexed worktree file; `None` if the file is not annexed.
    pub fn lookupkey(&self, path: &Path) -> Result<Option<Key>, BatchError> {
        Ok(self.raw(CommandKind::LookupKey, utf8(path)?)?.map(Key::from))
    }

    /// Key the file's content would get if it were added.
    pub fn calckey(&self, path: &Path) -> Result<Option<Key>, BatchError> {
        Ok(self.raw(CommandKind::CalcKey, utf8(path)?)?.map(Key::from))
    }

    /// Object path of a key's content, relative to the root; `None` if the
    /// content is not present locally.
    pub fn contentlocation(&self, key: &Key) -> Result<Option<PathBuf>, BatchError> {
        Ok(self
            .raw(CommandKind::ContentLocation, key.as_str())?
            .map(PathBuf::from))
    }

    /// Same as [`contentlocation`](Self::contentlocation), joined onto the root.
    pub fn contentlocation_absolute(&self, key: &Key) -> Result<Option<PathBuf>, BatchError> {
        Ok(self.contentlocation(key)?.map(|p| self.root.join(p)))
    }

    /// Parsed key fields (`backend`, `bytesize`, `keyname`, hash directories).
    pub fn examinekey(&self, key: &Key) -> Result<Vec<(String, String)>, BatchError> {
        self.session.registry.invoke(
            &self.root,
            CommandKind::ExamineKey,
            &KeyValueCodec::default(),
            key.as_str(),
        )
    }

    /// Live metadata view of a key.
    pub fn metadata(&self, key: impl Into<Key>) -> MetadataView<'_, Self> {
        MetadataView::new(self, Target::Key(key.into()))
    }

    /// Live metadata view of a worktree file (path relative to the root).
    pub fn file_metadata(&self, path: impl Into<PathBuf>) -> MetadataView<'_, Self> {
        MetadataView::new(self, Target::File(path.into()))
    }

    pub fn keys(&self, policy: CachePolicy) -> Result<BTreeSet<Key>, RunnerError> {
        self.session.cache.keys(&self.runner, policy)
    }

    /// Keys no worktree file points at.
    pub fn absent_keys(&self, policy: CachePolicy) -> Result<BTreeSet<Key>, RunnerError> {
        self.session.cache.absent_keys(&self.runner, policy)
    }

    pub fn files(&self, policy: CachePolicy) -> Result<BTreeSet<PathBuf>, RunnerError> {
        self.session.cache.files(&self.runner, policy)
    }

    pub fn fields(&self, policy: CachePolicy) -> Result<BTreeSet<String>, RunnerError> {
        self.session.cache.fields(&self.runner, policy)
    }

    /// Annexed files matching `selection`. Not cached.
    pub fn find(&self, selection: &Selection) -> Result<Vec<FoundFile>, RunnerError> {
        self.runner.find(selection)
    }

    /// Fetch content for `selection`, or for one key.
    pub fn get(
        &self,
        selection: &Selection,
        key: Option<&Key>,
    ) -> Result<Vec<ActionRecord>, RunnerError> {
        self.runner.get(selection, key)
    }

    /// Add a worktree file for a known key. Cached listings are dropped.
    pub fn fromkey(&self, key: &Key, file: &Path) -> Result<(), RunnerError> {
        self.runner.fromkey(key, file)?;
        self.invalidate();
        Ok(())
    }

    /// Forget cached listings for this repository.
    pub fn invalidate(&self) {
        self.session.cache.invalidate(&self.root);
    }

    /// Stop this repository's batch processes.
    pub fn shutdown(&self) -> usize {
        self.session.registry.shutdown_repo(&self.root)
    }
}

impl MetadataBackend for Annex<'_> {
    fn query_metadata(&self, query: &MetadataQuery) -> Result<MetadataRecord, BatchError> {
        self.session.registry.invoke(
            &self.root,
            CommandKind::Metadata,
            &MetadataCodec::new(),
            query,
        )
    }
}
