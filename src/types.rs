//! Core data model: keys, field sets and the metadata wire records
//!
//! The metadata records mirror `git annex metadata --batch --json` exactly;
//! member names and omission rules are part of the tool's contract.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix of the internally maintained timestamp fields
/// (`lastchanged`, `author-lastchanged`, ...).
pub const LASTCHANGED_SUFFIX: &str = "lastchanged";

/// Content address assigned by git-annex to a file's content.
///
/// Opaque to this crate. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Values of one metadata field.
///
/// git-annex stores each field as a set and answers in sorted order, so the
/// canonical representation is a sorted, duplicate-free set.
pub type Values = BTreeSet<String>;

/// Field name → values, as returned by the tool (reserved names included).
pub type FieldSet = BTreeMap<String, Values>;

/// True for the timestamp fields git-annex maintains itself.
pub fn is_lastchanged(field: &str) -> bool {
    field.ends_with(LASTCHANGED_SUFFIX)
}

/// True for `key` and `file`, which the tool uses to address objects and
/// which are never readable as metadata.
pub fn is_internal(field: &str) -> bool {
    field == "key" || field == "file"
}

/// True for names that are never surfaced as user metadata: exactly `key`,
/// exactly `file`, or any `*lastchanged` timestamp.
pub fn is_reserved(field: &str) -> bool {
    is_internal(field) || is_lastchanged(field)
}

/// One request line for `metadata --batch --json`.
///
/// Absent members are omitted from the encoded line, never sent as `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Fields to replace. An empty value list deletes the field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, Vec<String>>>,
}

impl MetadataQuery {
    pub fn for_key(key: &Key) -> Self {
        Self {
            key: Some(key.as_str().to_string()),
            ..Default::default()
        }
    }

    pub fn for_file(file: impl Into<String>) -> Self {
        Self {
            file: Some(file.into()),
            ..Default::default()
        }
    }

    /// Attach a field replacement to this query.
    pub fn with_field<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields
            .get_or_insert_with(BTreeMap::new)
            .insert(field.into(), values.into_iter().map(Into::into).collect());
        self
    }
}

/// One response line from `metadata --batch --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub command: String,
    #[serde(default)]
    pub note: String,
    pub success: bool,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<String>>,
    /// Failure details; newer git-annex reports here and leaves `note` empty.
    #[serde(
        default,
        rename = "error-messages",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub error_messages: Vec<String>,
}

impl MetadataRecord {
    /// Why the tool refused the request: `note`, or the joined
    /// `error-messages` when the note is empty.
    pub fn failure_note(&self) -> String {
        if self.note.trim().is_empty() {
            self.error_messages.join("; ")
        } else {
            self.note.clone()
        }
    }

    /// The tool's field map in canonical set form. A field with no values
    /// does not exist.
    pub fn field_set(&self) -> FieldSet {
        self.fields
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| (name.clone(), values.iter().cloned().collect()))
            .collect()
    }

    /// Names of user-visible fields, reserved names filtered out.
    pub fn user_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .map(String::as_str)
            .filter(|name| !is_reserved(name))
    }
}

/// One line of `find --json`: an annexed worktree file and its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundFile {
    pub file: String,
    pub key: String,
    #[serde(default)]
    pub backend: Option<String>,
    /// Decimal byte count, or absent for keys without a size.
    #[serde(default)]
    pub bytesize: Option<String>,
}

/// One line of an action command such as `get --json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub command: String,
    #[serde(default)]
    pub note: String,
    pub success: bool,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(
        default,
        rename = "error-messages",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub error_messages: Vec<String>,
}
