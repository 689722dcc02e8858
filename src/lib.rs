//! # annex-batch - git-annex batch process driver
//!
//! Drive git-annex's long-running `--batch` subprocesses from Rust and use
//! the annex metadata store as an in-process mutable mapping, without one
//! process spawn per operation.
//!
//! ## Layers
//!
//! - **LineChannel**: one subprocess, synchronous line send/receive
//! - **BatchProcess**: typed request/response over a channel, restarted
//!   and retried once when the subprocess dies
//! - **ProcessRegistry**: one batch process per (repository, command kind),
//!   started lazily and shared
//! - **MetadataView**: a key's (or file's) metadata fields, read once and
//!   written through
//! - **AnnexCache**: memoized key/file/field listings per repository
//!
//! ## Quick Start
//!
//! ```no_run
//! use annex_batch::{CachePolicy, Config, Session};
//!
//! # fn main() -> anyhow::Result<()> {
//! let session = Session::new(Config::load(std::path::Path::new(".")));
//! let annex = session.open(".")?;
//!
//! if let Some(key) = annex.lookupkey("photo.jpg".as_ref())? {
//!     let mut meta = annex.metadata(key);
//!     meta.set("tag", ["holiday", "2017"])?;
//!     println!("{:?}", meta.get("tag")?);
//! }
//!
//! for field in annex.fields(CachePolicy::Use)? {
//!     println!("{field}");
//! }
//! session.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod annex;
pub mod batch;
pub mod cache;
pub mod channel;
pub mod codec;
pub mod config;
pub mod metadata;
pub mod registry;
pub mod runner;
pub mod types;

pub use annex::{Annex, Session};
pub use batch::{BatchError, BatchProcess, BatchShape, CommandKind};
pub use cache::{AnnexCache, CachePolicy, EnumerationSource};
pub use channel::{ChannelError, LineChannel};
pub use codec::{Codec, JsonCodec, KeyValueCodec, MetadataCodec, ProtocolError, RawCodec};
pub use config::Config;
pub use metadata::{MetadataBackend, MetadataError, MetadataView, Target};
pub use registry::ProcessRegistry;
pub use runner::{AnnexRunner, AnnexVersion, RunnerError, Selection};
pub use types::{ActionRecord, FieldSet, FoundFile, Key, MetadataQuery, MetadataRecord, Values};
