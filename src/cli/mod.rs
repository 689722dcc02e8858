//! CLI implementation for annex-batch

mod batch;
mod config;

pub(crate) use config::{apply_cli_overrides, resolve_root};

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use annex_batch::{
    Annex, AnnexVersion, CachePolicy, Key, MetadataView, RunnerError, Selection, Session,
};

#[derive(Parser)]
#[command(name = "annex-batch")]
#[command(about = "Query and edit git-annex metadata through persistent batch processes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Repository root (default: enclosing git repository)
    #[arg(short = 'C', long = "repo", global = true, env = "ANNEX_BATCH_REPO")]
    pub repo: Option<PathBuf>,

    /// Treat a batch process silent for this many milliseconds as dead
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Show debug info (sets RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Query(Query),
    /// Initialize git-annex in the repository
    Init {
        /// Repository description
        description: Option<String>,
        /// Annex repository version
        #[arg(long = "repo-version")]
        repo_version: Option<String>,
    },
    /// Show the installed git-annex version
    Version,
    /// Read commands from stdin, one JSON result per line
    Batch,
}

/// Commands available both on the command line and in batch mode.
#[derive(Subcommand, Debug)]
pub(crate) enum Query {
    /// Key of an annexed file
    Lookupkey {
        file: PathBuf,
    },
    /// Key a file's content would get
    Calckey {
        file: PathBuf,
    },
    /// Object path of a key's content
    Location {
        key: String,
        /// Join onto the repository root
        #[arg(long)]
        absolute: bool,
    },
    /// Backend, size and hash directories of a key
    Examinekey {
        key: String,
    },
    /// Show or edit metadata of a file or key
    Meta(MetaArgs),
    /// List keys
    Keys {
        /// Only keys with no file in the worktree
        #[arg(long)]
        absent: bool,
        /// Re-read instead of using cached results
        #[arg(long)]
        no_cache: bool,
    },
    /// List annexed files
    Files {
        #[arg(long)]
        no_cache: bool,
    },
    /// List metadata field names in use
    Fields {
        #[arg(long)]
        no_cache: bool,
    },
    /// List annexed files matching the given paths and options
    Find(SelectArgs),
    /// Fetch content of matching files
    Get {
        #[command(flatten)]
        select: SelectArgs,
        /// Fetch a single key instead of files
        #[arg(long)]
        key: Option<String>,
    },
    /// Add a worktree file for a key already known to the repository
    Fromkey {
        key: String,
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
pub(crate) struct SelectArgs {
    /// Files or directories (default: whole worktree)
    paths: Vec<PathBuf>,
    /// git-annex matching option, e.g. --match=--in=here (repeatable)
    #[arg(long = "match", value_name = "OPTION", allow_hyphen_values = true)]
    match_opts: Vec<String>,
    /// Operate on files in this branch
    #[arg(long)]
    branch: Option<String>,
}

impl From<SelectArgs> for Selection {
    fn from(args: SelectArgs) -> Self {
        Selection {
            paths: args.paths,
            match_opts: args.match_opts,
            branch: args.branch,
        }
    }
}

#[derive(Args, Debug)]
pub(crate) struct MetaArgs {
    /// Annexed file, relative to the repository root
    #[arg(required_unless_present = "key", conflicts_with = "key")]
    file: Option<PathBuf>,
    /// Address by key instead of file
    #[arg(long)]
    key: Option<String>,
    /// Replace a field: name=v1,v2 (name= deletes)
    #[arg(long = "set", value_name = "NAME=VALUES")]
    set: Vec<String>,
    /// Delete a field
    #[arg(long = "delete", value_name = "NAME")]
    delete: Vec<String>,
}

/// Parse `name=v1,v2`. Empty values are dropped, so `name=` deletes.
fn parse_assignment(assignment: &str) -> Result<(String, Vec<String>)> {
    let Some((name, values)) = assignment.split_once('=') else {
        bail!("Expected NAME=VALUES, got '{}'", assignment);
    };
    if name.is_empty() {
        bail!("Empty field name in '{}'", assignment);
    }
    let values = values
        .split(',')
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    Ok((name.to_string(), values))
}

fn policy(no_cache: bool) -> CachePolicy {
    CachePolicy::from_use_cache(!no_cache)
}

fn cmd_meta(annex: &Annex<'_>, args: MetaArgs) -> Result<serde_json::Value> {
    let mut view: MetadataView<'_, Annex<'_>> = match (args.key, args.file) {
        (Some(key), _) => annex.metadata(key),
        (None, Some(file)) => annex.file_metadata(file),
        (None, None) => bail!("Either a file or --key is required"),
    };

    let mut changes = Vec::with_capacity(args.set.len() + args.delete.len());
    for assignment in &args.set {
        changes.push(parse_assignment(assignment)?);
    }
    changes.extend(args.delete.into_iter().map(|name| (name, Vec::new())));
    if !changes.is_empty() {
        view.update(changes)
            .with_context(|| format!("Failed to update metadata of {}", view.target()))?;
    }

    let fields = view.snapshot()?;
    Ok(json!({
        "key": view.key()?,
        "fields": fields,
    }))
}

/// Run one query against an open repository.
pub(crate) fn dispatch(annex: &Annex<'_>, query: Query) -> Result<serde_json::Value> {
    let _span = tracing::debug_span!("dispatch", query = ?query).entered();
    match query {
        Query::Lookupkey { file } => {
            let key = annex.lookupkey(&file)?;
            Ok(json!({"file": file, "key": key}))
        }
        Query::Calckey { file } => {
            let key = annex.calckey(&file)?;
            Ok(json!({"file": file, "key": key}))
        }
        Query::Location { key, absolute } => {
            let key = Key::from(key);
            let location = if absolute {
                annex.contentlocation_absolute(&key)?
            } else {
                annex.contentlocation(&key)?
            };
            Ok(json!({"key": key, "location": location}))
        }
        Query::Examinekey { key } => {
            let key = Key::from(key);
            let pairs: serde_json::Map<String, serde_json::Value> = annex
                .examinekey(&key)?
                .into_iter()
                .map(|(name, value)| (name, serde_json::Value::String(value)))
                .collect();
            Ok(json!({"key": key, "fields": pairs}))
        }
        Query::Meta(args) => cmd_meta(annex, args),
        Query::Keys { absent, no_cache } => {
            let keys = if absent {
                annex.absent_keys(policy(no_cache))?
            } else {
                annex.keys(policy(no_cache))?
            };
            Ok(json!({"keys": keys}))
        }
        Query::Files { no_cache } => Ok(json!({"files": annex.files(policy(no_cache))?})),
        Query::Fields { no_cache } => Ok(json!({"fields": annex.fields(policy(no_cache))?})),
        Query::Find(select) => Ok(json!({"found": annex.find(&select.into())?})),
        Query::Get { select, key } => {
            let key = key.map(Key::from);
            Ok(json!({"results": annex.get(&select.into(), key.as_ref())?}))
        }
        Query::Fromkey { key, file } => {
            let key = Key::from(key);
            annex.fromkey(&key, &file)?;
            Ok(json!({"key": key, "file": file}))
        }
    }
}

/// Serialize a JSON value to a line on stdout. Returns Err on write
/// failure (broken pipe).
pub(crate) fn write_json_line(
    out: &mut impl std::io::Write,
    value: &serde_json::Value,
) -> std::io::Result<()> {
    match serde_json::to_string(value) {
        Ok(s) => writeln!(out, "{}", s),
        Err(e) => {
            tracing::warn!(error = %e, "JSON serialization failed");
            writeln!(out, r#"{{"error":"JSON serialization failed"}}"#)
        }
    }
}

/// Report the version without failing on an old one, so this works where
/// [`Session::open`] refuses.
fn cmd_version(session: &Session, root: &Path) -> Result<serde_json::Value> {
    let (found, supported) = match session.ensure_supported(root) {
        Ok(found) => (found, true),
        Err(RunnerError::UnsupportedVersion { found, .. }) => (found, false),
        Err(e) => return Err(e.into()),
    };
    Ok(json!({
        "version": found.to_string(),
        "minimum": AnnexVersion::MINIMUM.to_string(),
        "supported": supported,
    }))
}

/// Run CLI with pre-parsed arguments and the merged config.
pub fn run_with(cli: Cli, root: PathBuf, config: annex_batch::Config) -> Result<()> {
    let session = Session::new(config);
    let open = || {
        session
            .open(&root)
            .with_context(|| format!("Cannot open repository {}", root.display()))
    };

    let value = match cli.command {
        Commands::Batch => return batch::cmd_batch(&open()?),
        Commands::Version => cmd_version(&session, &root)?,
        Commands::Init {
            description,
            repo_version,
        } => {
            let annex = open()?;
            annex
                .runner()
                .init(description.as_deref(), repo_version.as_deref())?;
            json!({"initialized": annex.root()})
        }
        Commands::Query(query) => dispatch(&open()?, query)?,
    };

    let mut stdout = std::io::stdout();
    write_json_line(&mut stdout, &value)?;
    session.shutdown();
    Ok(())
}
