//! Common test fixtures and helpers
//!
//! Usage in test files:
//! ```ignore
//! mod common;
//! use common::FakeAnnex;
//! ```
//!
//! Tests never need a real git-annex: [`FakeAnnex`] writes a shell script
//! that answers the batch protocols from fixed tables and points
//! `annex_command` at it.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use annex_batch::Config;
use tempfile::TempDir;

/// Key the fake reports for the worktree file `foo`.
pub const FOO_KEY: &str = "SHA256E-s3--foo";
/// Key known to the repository with no worktree file.
pub const ORPHAN_KEY: &str = "SHA256E-s5--orphan";

/// Fake git-annex covering every batch command plus the one-shot
/// `version`, `init`, `find`, `get`, `fromkey` and `metadata --json`
/// listings.
///
/// `metadata --batch --json` echoes the request's `fields` back as the
/// resulting state, which is what the real tool answers after a write.
pub const STANDARD_SCRIPT: &str = r#"#!/bin/sh
cmd="$1"
shift
case "$cmd" in
lookupkey)
    while IFS= read -r l; do
        case "$l" in
        foo) echo "SHA256E-s3--foo" ;;
        *) echo "" ;;
        esac
    done
    ;;
calckey)
    while IFS= read -r l; do echo "SHA256E-s0--calc-$l"; done
    ;;
contentlocation)
    while IFS= read -r l; do
        case "$l" in
        SHA256E-s3--foo) echo ".git/annex/objects/Xy/Zw/$l/$l" ;;
        *) echo "" ;;
        esac
    done
    ;;
examinekey)
    while IFS= read -r l; do
        printf 'backend=SHA256E\tbytesize=3\tkeyname=%s\thashdirlower=abc/def/\thashdirmixed=Xy/Zw/\n' "$l"
    done
    ;;
metadata)
    if [ "$1" = "--batch" ]; then
        while IFS= read -r l; do
            case "$l" in
            *'"file":"missing"'*)
                echo '{"command":"metadata","note":"not an annexed file","success":false,"key":null,"file":"missing","fields":{}}'
                continue
                ;;
            *'"file":"gone"'*)
                echo '{"command":"metadata","note":"","success":false,"file":"gone","error-messages":["gone not found"]}'
                continue
                ;;
            esac
            key=$(printf '%s' "$l" | sed -n 's/.*"key":"\([^"]*\)".*/\1/p')
            [ -z "$key" ] && key="SHA256E-s3--foo"
            fields=$(printf '%s' "$l" | sed -n 's/.*"fields":\({.*}\)}$/\1/p')
            [ -z "$fields" ] && fields='{"author":["me"],"author-lastchanged":["2017-07-14@02-40-00"],"lastchanged":["2017-07-14@02-40-00"]}'
            echo "{\"command\":\"metadata\",\"note\":\"\",\"success\":true,\"key\":\"$key\",\"file\":null,\"fields\":$fields}"
        done
    elif [ "$*" = "--json --all" ]; then
        echo '{"command":"metadata","note":"","success":true,"key":"SHA256E-s3--foo","file":null,"fields":{"author":["me"],"lastchanged":["2017-07-14@02-40-00"]}}'
        echo '{"command":"metadata","note":"","success":true,"key":"SHA256E-s5--orphan","file":null,"fields":{"numbers":["1","2"]}}'
    else
        echo '{"command":"metadata","note":"","success":true,"key":"SHA256E-s3--foo","file":"foo","fields":{"author":["me"]}}'
    fi
    ;;
find)
    echo '{"key":"SHA256E-s3--foo","file":"foo","backend":"SHA256E","bytesize":"3","humansize":"3 B"}'
    ;;
get)
    echo '{"command":"get","note":"(from origin...) ok","success":true,"key":"SHA256E-s3--foo","file":"foo"}'
    ;;
fromkey)
    ;;
version)
    echo "8.20210223"
    ;;
init)
    ;;
*)
    echo "git-annex: Unknown command '$cmd'" >&2
    exit 1
    ;;
esac
"#;

/// Temporary repository directory plus a fake annex executable.
///
/// The script lives outside the repository so listings never see it.
pub struct FakeAnnex {
    /// Repository root
    pub repo: PathBuf,
    /// Path of the fake executable
    pub script: PathBuf,
    /// Temp directory (kept alive to prevent cleanup)
    _dir: TempDir,
}

impl FakeAnnex {
    pub fn new() -> Self {
        Self::with_script(STANDARD_SCRIPT)
    }

    /// Use a custom script body (must start with a shebang).
    pub fn with_script(body: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let repo = dir.path().join("repo");
        fs::create_dir_all(repo.join(".git")).expect("Failed to create repo dir");
        let script = dir.path().join("fake-annex");
        write_executable(&script, body);
        Self {
            repo,
            script,
            _dir: dir,
        }
    }

    /// Config running the fake instead of `git annex`.
    pub fn config(&self) -> Config {
        Config {
            annex_command: Some(vec![self.script.to_string_lossy().into_owned()]),
            response_timeout_ms: Some(5_000),
            shutdown_grace_ms: Some(200),
            ..Default::default()
        }
    }

    /// Write `.annex-batch.toml` into the repository so the binary picks
    /// up the fake.
    pub fn write_project_config(&self) {
        let content = format!(
            "annex_command = [{:?}]\nresponse_timeout_ms = 5000\nshutdown_grace_ms = 200\n",
            self.script.to_string_lossy()
        );
        fs::write(self.repo.join(".annex-batch.toml"), content)
            .expect("Failed to write project config");
    }
}

pub fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).expect("Failed to write script");
    let mut perms = fs::metadata(path).expect("Failed to stat script").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("Failed to chmod script");
}

/// Script answering `version --raw` with `version` and nothing else.
pub fn version_script(version: &str) -> String {
    format!("#!/bin/sh\n[ \"$1\" = version ] && echo {version}\nexit 0\n")
}

/// Config running an inline `sh -c` script, for one-off behaviors.
pub fn sh_config(script: &str) -> Config {
    Config {
        annex_command: Some(vec![
            "sh".into(),
            "-c".into(),
            script.into(),
            "fake-annex".into(),
        ]),
        response_timeout_ms: Some(5_000),
        shutdown_grace_ms: Some(200),
        ..Default::default()
    }
}

/// SIGKILL a process from outside, as a crash would.
pub fn kill_externally(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("Failed to run kill");
    assert!(status.success(), "kill -9 {pid} failed");
}

/// Poll until `cond` holds or `limit` passes.
pub fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
