//! Mutable view over one annexed object's metadata
//!
//! A [`MetadataView`] is bound to one key (or worktree file) and reads and
//! writes through `git annex metadata --batch --json`. The first read fills
//! a local copy of the field set; every write goes to the tool immediately
//! and replaces the local copy with the field set the tool answers with, so
//! reads after a write through the same view need no round trip.
//!
//! The local copy is not told about changes made elsewhere (another view,
//! another process, a direct `git annex metadata` call). Use
//! [`MetadataView::refresh`] to pick those up.
//!
//! Field values are sets (see [`Values`]). Reserved names (`key`, `file`,
//! `*lastchanged`) are rejected locally on write and never enumerated;
//! `*lastchanged` fields stay readable through [`MetadataView::get`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::batch::BatchError;
use crate::types::{
    is_internal, is_reserved, FieldSet, Key, MetadataQuery, MetadataRecord, Values,
};

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("Field '{0}' is reserved and cannot be written")]
    ReservedField(String),
    #[error("git-annex rejected metadata request for {target}: {note}")]
    Rejected { target: Target, note: String },
    #[error("Path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),
}

/// Anything that can answer a metadata batch request.
///
/// Implemented by [`Annex`](crate::Annex) on top of the process registry.
pub trait MetadataBackend {
    fn query_metadata(&self, query: &MetadataQuery) -> Result<MetadataRecord, BatchError>;
}

/// What a view is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Key(Key),
    /// Path relative to the repository root
    File(PathBuf),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Key(k) => write!(f, "key {}", k),
            Target::File(p) => write!(f, "file {}", p.display()),
        }
    }
}

impl Target {
    fn query(&self) -> Result<MetadataQuery, MetadataError> {
        match self {
            Target::Key(k) => Ok(MetadataQuery::for_key(k)),
            Target::File(p) => p
                .to_str()
                .map(MetadataQuery::for_file)
                .ok_or_else(|| MetadataError::NonUtf8Path(p.clone())),
        }
    }
}

fn check_writable(field: &str) -> Result<(), MetadataError> {
    if is_reserved(field) {
        return Err(MetadataError::ReservedField(field.to_string()));
    }
    Ok(())
}

/// Live metadata mapping for one annexed object.
pub struct MetadataView<'a, B: ?Sized> {
    backend: &'a B,
    target: Target,
    key: Option<Key>,
    fields: Option<FieldSet>,
}

impl<'a, B: MetadataBackend + ?Sized> MetadataView<'a, B> {
    pub fn new(backend: &'a B, target: Target) -> Self {
        let key = match &target {
            Target::Key(k) => Some(k.clone()),
            Target::File(_) => None,
        };
        Self {
            backend,
            target,
            key,
            fields: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// True once the field set has been fetched.
    pub fn is_loaded(&self) -> bool {
        self.fields.is_some()
    }

    /// The object's key, resolved through the tool for file targets.
    pub fn key(&mut self) -> Result<Option<Key>, MetadataError> {
        if self.key.is_none() {
            self.load()?;
        }
        Ok(self.key.clone())
    }

    /// Values of `field`; empty for a field that was never written.
    ///
    /// `*lastchanged` timestamps are readable, `key` and `file` always
    /// read as empty.
    pub fn get(&mut self, field: &str) -> Result<Values, MetadataError> {
        if is_internal(field) {
            return Ok(Values::new());
        }
        Ok(self.load()?.get(field).cloned().unwrap_or_default())
    }

    /// Membership. `*lastchanged` fields count; `key`/`file` never do.
    pub fn contains(&mut self, field: &str) -> Result<bool, MetadataError> {
        if is_internal(field) {
            return Ok(false);
        }
        Ok(self.load()?.contains_key(field))
    }

    /// User-visible field names.
    pub fn fields(&mut self) -> Result<BTreeSet<String>, MetadataError> {
        Ok(self
            .load()?
            .keys()
            .filter(|name| !is_reserved(name))
            .cloned()
            .collect())
    }

    pub fn len(&mut self) -> Result<usize, MetadataError> {
        Ok(self.fields()?.len())
    }

    pub fn is_empty(&mut self) -> Result<bool, MetadataError> {
        Ok(self.len()? == 0)
    }

    /// Owned copy of the user-visible fields and their values.
    pub fn snapshot(&mut self) -> Result<FieldSet, MetadataError> {
        Ok(self
            .load()?
            .iter()
            .filter(|(name, _)| !is_reserved(name))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect())
    }

    /// Replace every value of `field`. An empty iterator deletes it.
    pub fn set<I, S>(&mut self, field: &str, values: I) -> Result<(), MetadataError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update([(field, values)])
    }

    /// Same as `set(field, [])`. Deleting an absent field is a no-op.
    pub fn delete(&mut self, field: &str) -> Result<(), MetadataError> {
        self.set(field, Vec::<String>::new())
    }

    /// Replace several fields in one round trip.
    ///
    /// Nothing is sent if any field name is reserved.
    pub fn update<I, F, V, S>(&mut self, pairs: I) -> Result<(), MetadataError>
    where
        I: IntoIterator<Item = (F, V)>,
        F: AsRef<str>,
        V: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (field, values) in pairs {
            let field = field.as_ref();
            check_writable(field)?;
            let values: Values = values.into_iter().map(Into::into).collect();
            changes.insert(field.to_string(), values.into_iter().collect());
        }
        if changes.is_empty() {
            return Ok(());
        }

        let mut query = self.target.query()?;
        query.fields = Some(changes);
        self.send(&query)?;
        Ok(())
    }

    /// Delete every user-visible field in one round trip.
    pub fn clear(&mut self) -> Result<(), MetadataError> {
        let names = self.fields()?;
        self.update(names.into_iter().map(|n| (n, Vec::<String>::new())))
    }

    /// Drop the local copy and fetch the current state from the tool.
    pub fn refresh(&mut self) -> Result<(), MetadataError> {
        self.fields = None;
        self.load()?;
        Ok(())
    }

    fn load(&mut self) -> Result<&FieldSet, MetadataError> {
        if self.fields.is_none() {
            let query = self.target.query()?;
            self.send(&query)?;
        }
        // send() always fills the local copy on success
        Ok(self.fields.get_or_insert_with(FieldSet::new))
    }

    /// One round trip; the local copy is replaced only on success.
    fn send(&mut self, query: &MetadataQuery) -> Result<(), MetadataError> {
        let _span = tracing::debug_span!("metadata_query", target = %self.target).entered();
        let record = self.backend.query_metadata(query)?;
        if !record.success {
            return Err(MetadataError::Rejected {
                target: self.target.clone(),
                note: record.failure_note(),
            });
        }
        if let Some(k) = &record.key {
            self.key = Some(Key::new(k.as_str()));
        }
        self.fields = Some(record.field_set());
        Ok(())
    }
}

impl<B: ?Sized> fmt::Debug for MetadataView<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataView")
            .field("target", &self.target)
            .field("key", &self.key)
            .field("loaded", &self.fields.is_some())
            .finish()
    }
}
