//! Git plumbing for working copies.
//!
//! Network operations shell out to the `git` CLI with `GIT_SSH_COMMAND`
//! pinned to the daemon key; local inspection goes through libgit2.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use git2::Repository;

/// SSH options used for every git network operation. Host keys are not
/// verified so freshly provisioned hosts work without a known_hosts entry.
const SSH_OPTIONS: &str = "-o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no";

/// Quote a value for the POSIX shell git uses to run `GIT_SSH_COMMAND`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the `ssh` command line forced onto git.
pub fn ssh_command(key: &Path) -> String {
    format!(
        "ssh -i {} {}",
        shell_quote(&key.to_string_lossy()),
        SSH_OPTIONS
    )
}

/// Check that a branch name is safe to pass to git as a positional argument.
///
/// Mirrors the relevant parts of `git check-ref-format --branch`, and
/// additionally forbids a leading `-` so the value can never parse as an option.
pub fn validate_branch(branch: &str) -> bool {
    if branch.is_empty() || branch.starts_with('-') || branch.starts_with('/') {
        return false;
    }
    if branch.ends_with('/') || branch.ends_with('.') || branch.ends_with(".lock") {
        return false;
    }
    if branch.contains("..") || branch.contains("@{") || branch.contains("//") {
        return false;
    }
    !branch
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
}

/// Whether `path` already holds git metadata.
pub fn is_initialized(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Current HEAD commit and branch of a working copy, if readable.
pub fn head_info(path: &Path) -> Option<(String, Option<String>)> {
    let repo = Repository::open(path).ok()?;
    let head = repo.head().ok()?;
    let commit = head.peel_to_commit().ok()?;
    let branch = if head.is_branch() {
        head.shorthand().map(str::to_string)
    } else {
        None
    };
    Some((commit.id().to_string(), branch))
}

/// Runs `git` subcommands with a fixed SSH command.
#[derive(Debug, Clone)]
pub struct GitCli {
    ssh_command: String,
}

impl GitCli {
    pub fn new(ssh_key: &Path) -> Self {
        Self {
            ssh_command: ssh_command(ssh_key),
        }
    }

    pub fn ssh_command(&self) -> &str {
        &self.ssh_command
    }

    /// Run `git <args>` in `dir`, returning stdout. Non-zero exit is an error
    /// carrying git's stderr.
    pub async fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_SSH_COMMAND", &self.ssh_command)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.first().unwrap_or(&"")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "git {} exited with {:?}: {}",
                args.join(" "),
                output.status.code(),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
