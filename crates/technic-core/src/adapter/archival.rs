//! Mailbox archival through the scripting host.
//!
//! The configured program is spawned once per call with `{mailbox}` and
//! `{subject}` substituted into its arguments. The script owns idempotence:
//! it must exit 0 when the mailbox is already archived.
//!
//! # Exit codes
//! - `0`: archived (or already archived)
//! - listed in `permanent_exit_codes`: will never succeed
//! - anything else, or killed by a signal: transient

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ArchivalConfig;
use crate::types::{ActionKind, Backend};

use super::{unsupported, Adapter, DispatchResult};

/// Trailing stderr kept in `last_error`.
const STDERR_SNIPPET: usize = 300;

pub struct ArchivalAdapter {
    program: String,
    args: Vec<String>,
    permanent_exit_codes: Vec<i32>,
}

impl ArchivalAdapter {
    pub fn new(cfg: &ArchivalConfig) -> Self {
        Self {
            program: cfg.program.trim().to_string(),
            args: cfg.args.clone(),
            permanent_exit_codes: cfg.permanent_exit_codes.clone(),
        }
    }

    fn build_command(&self, mailbox: &str, subject: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| expand(a, mailbox, subject)));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // An abandoned call (dispatch timeout) must not leave the script running.
            .kill_on_drop(true);
        cmd
    }

    async fn archive(&self, mailbox: &str, subject: &str) -> DispatchResult {
        let output = match self.build_command(mailbox, subject).output().await {
            Ok(output) => output,
            Err(e) => {
                return match e.kind() {
                    ErrorKind::NotFound | ErrorKind::PermissionDenied => DispatchResult::permanent(
                        format!("cannot run '{}': {e}", self.program),
                    ),
                    _ => DispatchResult::transient(format!("failed to spawn '{}': {e}", self.program)),
                };
            }
        };

        if output.status.success() {
            return DispatchResult::Success;
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = tail(stderr.trim(), STDERR_SNIPPET);
        match output.status.code() {
            Some(code) if self.permanent_exit_codes.contains(&code) => {
                DispatchResult::permanent(format!("archival script exited with {code}: {stderr}"))
            }
            Some(code) => {
                DispatchResult::transient(format!("archival script exited with {code}: {stderr}"))
            }
            None => DispatchResult::transient(format!(
                "archival script terminated by signal: {stderr}"
            )),
        }
    }
}

fn tail(s: &str, max_chars: usize) -> &str {
    let count = s.chars().count();
    if count <= max_chars {
        return s;
    }
    let skip = count - max_chars;
    let start = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &s[start..]
}

/// Substitute `{mailbox}` and `{subject}` in one left-to-right pass, so
/// placeholder text inside a substituted value is left alone.
fn expand(arg: &str, mailbox: &str, subject: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let from = &rest[start..];
        if let Some(after) = from.strip_prefix("{mailbox}") {
            out.push_str(mailbox);
            rest = after;
        } else if let Some(after) = from.strip_prefix("{subject}") {
            out.push_str(subject);
            rest = after;
        } else {
            out.push('{');
            rest = &from[1..];
        }
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl Adapter for ArchivalAdapter {
    fn backend(&self) -> Backend {
        Backend::Archival
    }

    async fn apply(&self, kind: ActionKind, target_resource: &str, subject: &str) -> DispatchResult {
        match kind {
            ActionKind::ArchiveMailbox => self.archive(target_resource, subject).await,
            other => unsupported(Backend::Archival, other),
        }
    }
}
