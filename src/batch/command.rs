//! Batch command kinds and their wire shapes

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;

/// Request/response shape of a batch command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchShape {
    /// One argument in, one line out
    Raw,
    /// One JSON object in, one JSON object out
    Json,
    /// One argument in, one line of delimited `name=value` pairs out
    KeyValue,
}

impl fmt::Display for BatchShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchShape::Raw => "raw",
            BatchShape::Json => "json",
            BatchShape::KeyValue => "key/value",
        };
        f.write_str(s)
    }
}

/// Format handed to `examinekey`; git-annex expands the `\t`/`\n` escapes.
const EXAMINEKEY_FORMAT: &str = "--format=backend=${backend}\\tbytesize=${bytesize}\\tkeyname=${keyname}\\thashdirlower=${hashdirlower}\\thashdirmixed=${hashdirmixed}\\n";

/// The git-annex batch commands this crate drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    Metadata,
    LookupKey,
    CalcKey,
    ContentLocation,
    ExamineKey,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::Metadata,
        CommandKind::LookupKey,
        CommandKind::CalcKey,
        CommandKind::ContentLocation,
        CommandKind::ExamineKey,
    ];

    /// Subcommand and flags appended to the configured annex command.
    pub fn args(self) -> &'static [&'static str] {
        match self {
            CommandKind::Metadata => &["metadata", "--batch", "--json"],
            CommandKind::LookupKey => &["lookupkey", "--batch"],
            CommandKind::CalcKey => &["calckey", "--batch"],
            CommandKind::ContentLocation => &["contentlocation", "--batch"],
            CommandKind::ExamineKey => &["examinekey", "--batch", EXAMINEKEY_FORMAT],
        }
    }

    pub fn shape(self) -> BatchShape {
        match self {
            CommandKind::Metadata => BatchShape::Json,
            CommandKind::LookupKey | CommandKind::CalcKey | CommandKind::ContentLocation => {
                BatchShape::Raw
            }
            CommandKind::ExamineKey => BatchShape::KeyValue,
        }
    }

    pub fn name(self) -> &'static str {
        self.args()[0]
    }

    /// Build the full command line, run from `repo`.
    ///
    /// Returns `None` for an empty prefix.
    pub(crate) fn command(self, prefix: &[String], repo: &Path) -> Option<Command> {
        let (program, rest) = prefix.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(rest).args(self.args()).current_dir(repo);
        Some(cmd)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("Unknown batch command '{}'", s))
    }
}
