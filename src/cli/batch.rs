//! Batch mode: persistent session, JSONL output
//!
//! Reads commands from stdin and answers each with one JSON line on stdout.
//! One [`Annex`] handle serves the whole session, so git-annex batch
//! subprocesses are started once and reused across commands.
//!
//! Besides the regular queries, `invalidate` drops cached listings and
//! `quit`/`exit` end the session. Empty lines and `#` comments are skipped.

use std::io::{BufRead, Write};

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

use annex_batch::Annex;

use super::{dispatch, write_json_line, Query};

/// Maximum batch stdin line length (1MB). Longer lines are rejected.
const MAX_BATCH_LINE_LEN: usize = 1_048_576;

#[derive(Parser, Debug)]
#[command(
    no_binary_name = true,
    disable_help_subcommand = true,
    disable_help_flag = true
)]
struct BatchInput {
    #[command(subcommand)]
    cmd: BatchCmd,
}

#[derive(Subcommand, Debug)]
enum BatchCmd {
    #[command(flatten)]
    Query(Query),
    /// Drop cached key/file/field listings
    Invalidate,
}

fn execute(annex: &Annex<'_>, tokens: &[String]) -> serde_json::Value {
    let input = match BatchInput::try_parse_from(tokens) {
        Ok(input) => input,
        Err(e) => return json!({"error": e.to_string().trim_end()}),
    };
    match input.cmd {
        BatchCmd::Invalidate => {
            annex.invalidate();
            json!({"invalidated": true})
        }
        BatchCmd::Query(query) => dispatch(annex, query).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Batch command failed");
            json!({"error": format!("{:#}", e)})
        }),
    }
}

/// Entry point for `annex-batch batch`.
pub(crate) fn cmd_batch(annex: &Annex<'_>) -> Result<()> {
    let _span = tracing::info_span!("cmd_batch", root = %annex.root().display()).entered();

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut errors = 0usize;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stdin line");
                break;
            }
        };

        if line.len() > MAX_BATCH_LINE_LEN {
            errors += 1;
            if writeln!(stdout, r#"{{"error":"Line too long (max 1MB)"}}"#).is_err() {
                break;
            }
            let _ = stdout.flush();
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
            break;
        }

        let value = match shell_words::split(trimmed) {
            Ok(tokens) if tokens.is_empty() => continue,
            Ok(tokens) => execute(annex, &tokens),
            Err(e) => json!({"error": format!("Parse error: {}", e)}),
        };
        if value.get("error").is_some() {
            errors += 1;
        }
        if write_json_line(&mut stdout, &value).is_err() {
            break;
        }
        let _ = stdout.flush();
    }

    tracing::debug!(errors, "Batch session ended");
    Ok(())
}
