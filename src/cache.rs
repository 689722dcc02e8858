//! Memoized repository enumerations
//!
//! Listing every key, file or field name means a full `git annex metadata`
//! walk, so results are kept per repository in an LRU. Entries are filled
//! on first use and reused until [`AnnexCache::invalidate`] is called.
//! Writes through a [`MetadataView`](crate::MetadataView) do not
//! invalidate anything: the cache assumes the caller is the only mutator
//! for the length of a session.
//!
//! [`CachePolicy::Bypass`] fetches fresh results without storing them, so a
//! later cached call still sees the old entry unless the caller invalidates.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;

use crate::runner::RunnerError;
use crate::types::Key;

/// Whether an enumeration may be answered from the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    #[default]
    Use,
    /// Fetch fresh; the cache is neither read nor updated
    Bypass,
}

impl CachePolicy {
    pub fn from_use_cache(use_cache: bool) -> Self {
        if use_cache {
            CachePolicy::Use
        } else {
            CachePolicy::Bypass
        }
    }
}

/// Whole-repository listings the cache can memoize.
pub trait EnumerationSource {
    /// Repository these listings describe.
    fn repository(&self) -> &Path;
    /// Every key the repository knows about.
    fn all_keys(&self) -> Result<BTreeSet<Key>, RunnerError>;
    /// Keys referenced by a file in the current worktree.
    fn worktree_keys(&self) -> Result<BTreeSet<Key>, RunnerError>;
    /// Annexed files in the current worktree, relative to the root.
    fn all_files(&self) -> Result<BTreeSet<PathBuf>, RunnerError>;
    /// Every user-visible metadata field name in use.
    fn all_fields(&self) -> Result<BTreeSet<String>, RunnerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Enumeration {
    Keys,
    WorktreeKeys,
    Files,
    Fields,
}

impl Enumeration {
    const ALL: [Enumeration; 4] = [
        Enumeration::Keys,
        Enumeration::WorktreeKeys,
        Enumeration::Files,
        Enumeration::Fields,
    ];
}

#[derive(Debug, Clone)]
enum Entry {
    Keys(BTreeSet<Key>),
    Files(BTreeSet<PathBuf>),
    Fields(BTreeSet<String>),
}

type CacheKey = (PathBuf, Enumeration);

/// Per-repository enumeration results, bounded LRU.
#[derive(Debug)]
pub struct AnnexCache {
    entries: Mutex<LruCache<CacheKey, Entry>>,
}

impl AnnexCache {
    /// Capacity counts entries (one per repository and listing kind).
    /// Zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<CacheKey, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn identity(repo: &Path) -> PathBuf {
        dunce::canonicalize(repo).unwrap_or_else(|_| repo.to_path_buf())
    }

    pub fn keys<S: EnumerationSource + ?Sized>(
        &self,
        source: &S,
        policy: CachePolicy,
    ) -> Result<BTreeSet<Key>, RunnerError> {
        self.cached(source, Enumeration::Keys, policy, |s| s.all_keys().map(Entry::Keys))
            .map(|e| match e {
                Entry::Keys(k) => k,
                _ => BTreeSet::new(),
            })
    }

    /// Keys with no file in the current worktree (all keys minus worktree keys).
    pub fn absent_keys<S: EnumerationSource + ?Sized>(
        &self,
        source: &S,
        policy: CachePolicy,
    ) -> Result<BTreeSet<Key>, RunnerError> {
        let all = self.keys(source, policy)?;
        let present = self
            .cached(source, Enumeration::WorktreeKeys, policy, |s| {
                s.worktree_keys().map(Entry::Keys)
            })
            .map(|e| match e {
                Entry::Keys(k) => k,
                _ => BTreeSet::new(),
            })?;
        Ok(all.difference(&present).cloned().collect())
    }

    pub fn files<S: EnumerationSource + ?Sized>(
        &self,
        source: &S,
        policy: CachePolicy,
    ) -> Result<BTreeSet<PathBuf>, RunnerError> {
        self.cached(source, Enumeration::Files, policy, |s| s.all_files().map(Entry::Files))
            .map(|e| match e {
                Entry::Files(f) => f,
                _ => BTreeSet::new(),
            })
    }

    pub fn fields<S: EnumerationSource + ?Sized>(
        &self,
        source: &S,
        policy: CachePolicy,
    ) -> Result<BTreeSet<String>, RunnerError> {
        self.cached(source, Enumeration::Fields, policy, |s| s.all_fields().map(Entry::Fields))
            .map(|e| match e {
                Entry::Fields(f) => f,
                _ => BTreeSet::new(),
            })
    }

    /// Drop every cached listing for one repository.
    pub fn invalidate(&self, repo: &Path) {
        let id = Self::identity(repo);
        let mut entries = self.entries();
        for what in Enumeration::ALL {
            entries.pop(&(id.clone(), what));
        }
        tracing::debug!(repo = %id.display(), "Invalidated enumeration cache");
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Fetch runs outside the lock; concurrent misses may both fetch and the
    /// later result wins.
    fn cached<S, F>(
        &self,
        source: &S,
        what: Enumeration,
        policy: CachePolicy,
        fetch: F,
    ) -> Result<Entry, RunnerError>
    where
        S: EnumerationSource + ?Sized,
        F: FnOnce(&S) -> Result<Entry, RunnerError>,
    {
        let key = (Self::identity(source.repository()), what);
        if policy == CachePolicy::Use {
            if let Some(hit) = self.entries().get(&key) {
                tracing::trace!(what = ?what, "Enumeration cache hit");
                return Ok(hit.clone());
            }
        }

        let _span = tracing::debug_span!("enumerate", what = ?what, policy = ?policy).entered();
        let fresh = fetch(source)?;
        if policy == CachePolicy::Use {
            self.entries().put(key, fresh.clone());
        }
        Ok(fresh)
    }
}

impl Default for AnnexCache {
    fn default() -> Self {
        Self::new(crate::config::Config::DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// Mutable in-memory repository listing with call counting.
    struct FakeRepo {
        root: PathBuf,
        keys: RefCell<BTreeSet<Key>>,
        files: RefCell<BTreeSet<PathBuf>>,
        calls: Cell<usize>,
    }

    impl FakeRepo {
        fn new(root: &str, keys: &[&str]) -> Self {
            Self {
                root: PathBuf::from(root),
                keys: RefCell::new(keys.iter().map(|k| Key::from(*k)).collect()),
                files: RefCell::new(BTreeSet::new()),
                calls: Cell::new(0),
            }
        }

        fn add_key(&self, key: &str) {
            self.keys.borrow_mut().insert(key.into());
        }
    }

    impl EnumerationSource for FakeRepo {
        fn repository(&self) -> &Path {
            &self.root
        }

        fn all_keys(&self) -> Result<BTreeSet<Key>, RunnerError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.keys.borrow().clone())
        }

        fn worktree_keys(&self) -> Result<BTreeSet<Key>, RunnerError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.keys.borrow().iter().take(1).cloned().collect())
        }

        fn all_files(&self) -> Result<BTreeSet<PathBuf>, RunnerError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.files.borrow().clone())
        }

        fn all_fields(&self) -> Result<BTreeSet<String>, RunnerError> {
            self.calls.set(self.calls.get() + 1);
            Err(RunnerError::EmptyCommand)
        }
    }

    fn keys(names: &[&str]) -> BTreeSet<Key> {
        names.iter().map(|k| Key::from(*k)).collect()
    }

    #[test]
    fn test_cached_keys_ignore_changes() {
        let repo = FakeRepo::new("/fake/a", &["K1"]);
        let cache = AnnexCache::default();
        let first = cache.keys(&repo, CachePolicy::Use).unwrap();
        repo.add_key("K2");
        let second = cache.keys(&repo, CachePolicy::Use).unwrap();
        assert_eq!(first, second);
        assert_eq!(repo.calls.get(), 1);
    }

    #[test]
    fn test_bypass_sees_changes_without_storing() {
        let repo = FakeRepo::new("/fake/a", &["K1"]);
        let cache = AnnexCache::default();
        cache.keys(&repo, CachePolicy::Use).unwrap();
        repo.add_key("K2");

        assert_eq!(cache.keys(&repo, CachePolicy::Bypass).unwrap(), keys(&["K1", "K2"]));
        // Bypass did not refresh the entry
        assert_eq!(cache.keys(&repo, CachePolicy::Use).unwrap(), keys(&["K1"]));
    }

    #[test]
    fn test_invalidate_refetches() {
        let repo = FakeRepo::new("/fake/a", &["K1"]);
        let cache = AnnexCache::default();
        cache.keys(&repo, CachePolicy::Use).unwrap();
        repo.add_key("K2");
        cache.invalidate(repo.repository());
        assert_eq!(cache.keys(&repo, CachePolicy::Use).unwrap(), keys(&["K1", "K2"]));
        assert_eq!(repo.calls.get(), 2);
    }

    #[test]
    fn test_bypass_on_empty_cache_stores_nothing() {
        let repo = FakeRepo::new("/fake/a", &["K1"]);
        let cache = AnnexCache::default();
        cache.files(&repo, CachePolicy::Bypass).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_repositories_are_separate() {
        let a = FakeRepo::new("/fake/a", &["A"]);
        let b = FakeRepo::new("/fake/b", &["B"]);
        let cache = AnnexCache::default();
        assert_eq!(cache.keys(&a, CachePolicy::Use).unwrap(), keys(&["A"]));
        assert_eq!(cache.keys(&b, CachePolicy::Use).unwrap(), keys(&["B"]));
        cache.invalidate(a.repository());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let a = FakeRepo::new("/fake/a", &["A"]);
        let b = FakeRepo::new("/fake/b", &["B"]);
        let cache = AnnexCache::new(1);
        cache.keys(&a, CachePolicy::Use).unwrap();
        cache.keys(&b, CachePolicy::Use).unwrap();
        cache.keys(&a, CachePolicy::Use).unwrap();
        assert_eq!(a.calls.get(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_absent_keys() {
        let repo = FakeRepo::new("/fake/a", &["K1", "K2", "K3"]);
        let cache = AnnexCache::default();
        assert_eq!(
            cache.absent_keys(&repo, CachePolicy::Use).unwrap(),
            keys(&["K2", "K3"])
        );
    }

    #[test]
    fn test_errors_not_cached() {
        let repo = FakeRepo::new("/fake/a", &[]);
        let cache = AnnexCache::default();
        assert!(cache.fields(&repo, CachePolicy::Use).is_err());
        assert!(cache.fields(&repo, CachePolicy::Use).is_err());
        assert_eq!(repo.calls.get(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_policy_from_flag() {
        assert_eq!(CachePolicy::from_use_cache(true), CachePolicy::Use);
        assert_eq!(CachePolicy::from_use_cache(false), CachePolicy::Bypass);
        assert_eq!(CachePolicy::default(), CachePolicy::Use);
    }
}
