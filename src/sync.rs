//! Repository synchronization.
//!
//! Each trigger walks a project's working copy through
//!
//! ```text
//! Uninitialized ─clone─> Ready ─fetch─> CheckingUpdate ─┬─ exit 0 ─> UpToDate
//!                                                        ├─ exit 1 ─> Pulling ─> build queued
//!                                                        └─ other  ─> error (notify)
//! ```
//!
//! Any failed step aborts the cycle without building. Cycles touching the
//! same working copy are serialized by a lock on its path; different working
//! copies sync concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;

use crate::config::Project;
use crate::errors::{SyncError, SyncStage};
use crate::git::{self, GitCli};
use crate::job::BuildJob;
use crate::notify::Notifier;
use crate::queue::BuildQueue;

/// Result of `ensure_initialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    AlreadyInitialized,
    Cloned,
}

/// Decision reported by the check-update script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    Available,
}

/// How a sync cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    BuildQueued,
    Failed(SyncStage),
}

/// Entry point the webhook listener uses to trigger a sync.
#[async_trait]
pub trait ProjectSync: Send + Sync {
    async fn sync(&self, project: Project) -> SyncOutcome;
}

/// Async locks keyed on the resolved working-copy path, created on first
/// use. Projects sharing a `path` override share a lock.
#[derive(Default)]
struct WorkingCopyLocks {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkingCopyLocks {
    fn get(&self, working_copy: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(working_copy.to_path_buf()).or_default().clone()
    }
}

pub struct Synchronizer {
    data_dir: PathBuf,
    git: GitCli,
    check_script: PathBuf,
    queue: BuildQueue,
    notifier: Notifier,
    locks: WorkingCopyLocks,
}

impl Synchronizer {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        ssh_key: &Path,
        check_script: impl Into<PathBuf>,
        queue: BuildQueue,
        notifier: Notifier,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            git: GitCli::new(ssh_key),
            check_script: check_script.into(),
            queue,
            notifier,
            locks: WorkingCopyLocks::default(),
        }
    }

    pub fn working_copy(&self, project: &Project) -> PathBuf {
        project.working_copy(&self.data_dir)
    }

    fn branch<'a>(&self, project: &'a Project) -> Result<&'a str, SyncError> {
        let branch = project.repo.branch.as_str();
        if git::validate_branch(branch) {
            Ok(branch)
        } else {
            Err(SyncError::InvalidBranch {
                project: project.key.clone(),
                branch: branch.to_string(),
            })
        }
    }

    fn command_error(project: &Project, stage: SyncStage, source: anyhow::Error) -> SyncError {
        SyncError::Command {
            project: project.key.clone(),
            stage,
            source,
        }
    }

    /// Clone the project's repository if its working copy has no git
    /// metadata yet. Does nothing for an existing checkout.
    pub async fn ensure_initialized(&self, project: &Project) -> Result<InitOutcome, SyncError> {
        let path = self.working_copy(project);
        if git::is_initialized(&path) {
            tracing::debug!(project = %project.key, "project is initialized");
            return Ok(InitOutcome::AlreadyInitialized);
        }

        tracing::info!(project = %project.key, path = %path.display(), "project needs initialization");
        let branch = self.branch(project)?;
        let fail = |e| Self::command_error(project, SyncStage::Cloning, e);

        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))
            .map_err(fail)?;
        self.git
            .run(&path, &["clone", "--", &project.repo.url, "."])
            .await
            .map_err(fail)?;
        self.git
            .run(&path, &["config", "core.sshCommand", self.git.ssh_command()])
            .await
            .map_err(fail)?;
        let upstream = format!("origin/{}", branch);
        self.git
            .run(&path, &["checkout", "-B", branch, "--track", &upstream])
            .await
            .map_err(fail)?;

        tracing::info!(project = %project.key, branch, "repository cloned");
        Ok(InitOutcome::Cloned)
    }

    /// Fetch the tracked branch from `origin`.
    pub async fn fetch(&self, project: &Project) -> Result<(), SyncError> {
        let branch = self.branch(project)?;
        self.git
            .run(&self.working_copy(project), &["fetch", "origin", branch])
            .await
            .map_err(|e| Self::command_error(project, SyncStage::Fetching, e))?;
        Ok(())
    }

    /// Run the check-update script in the working copy and map its exit code.
    pub async fn check_update(&self, project: &Project) -> Result<UpdateStatus, SyncError> {
        let output = tokio::process::Command::new("sh")
            .arg("-xe")
            .arg(&self.check_script)
            .current_dir(self.working_copy(project))
            .env("GIT_SSH_COMMAND", self.git.ssh_command())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.check_script.display()))
            .map_err(|e| Self::command_error(project, SyncStage::CheckingUpdate, e))?;

        let code = output.status.code();
        tracing::info!(project = %project.key, exit_code = ?code, "check-update finished");
        tracing::debug!(
            project = %project.key,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "check-update trace"
        );

        match code {
            Some(0) => Ok(UpdateStatus::UpToDate),
            Some(1) => Ok(UpdateStatus::Available),
            code => Err(SyncError::UnexpectedCheckCode {
                project: project.key.clone(),
                code,
            }),
        }
    }

    /// Pull the tracked branch into the working copy.
    pub async fn pull(&self, project: &Project) -> Result<(), SyncError> {
        let branch = self.branch(project)?;
        let stdout = self
            .git
            .run(&self.working_copy(project), &["pull", "origin", branch])
            .await
            .map_err(|e| Self::command_error(project, SyncStage::Pulling, e))?;
        tracing::info!(project = %project.key, "{}", stdout.trim());
        Ok(())
    }

    /// Hand the project to the build queue.
    pub fn enqueue_build(&self, project: &Project) {
        tracing::info!(project = %project.key, pending = self.queue.pending(), "queueing build");
        let project = project.clone();
        let path = self.working_copy(&project);
        let notifier = self.notifier.clone();
        self.queue.push(project.key.clone(), move |cancel| async move {
            BuildJob::new(project, path).execute(&notifier, cancel).await;
        });
    }

    /// Run one full sync cycle for `project`.
    pub async fn update_repository(&self, project: &Project) -> SyncOutcome {
        let lock = self.locks.get(&self.working_copy(project));
        let _guard = lock.lock().await;

        tracing::info!(project = %project.key, "checking if update is needed");
        match self.run_cycle(project).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let stage = e.stage();
                tracing::error!(project = %project.key, %stage, "sync aborted: {}", e);
                if let Some(text) = failure_message(stage, &project.key) {
                    self.notifier.send(project, text);
                }
                SyncOutcome::Failed(stage)
            }
        }
    }

    async fn run_cycle(&self, project: &Project) -> Result<SyncOutcome, SyncError> {
        self.ensure_initialized(project).await?;
        self.fetch(project).await?;
        match self.check_update(project).await? {
            UpdateStatus::UpToDate => {
                tracing::info!(project = %project.key, "project is up-to-date");
                Ok(SyncOutcome::UpToDate)
            }
            UpdateStatus::Available => {
                tracing::info!(project = %project.key, "updating repository");
                self.pull(project).await?;
                self.enqueue_build(project);
                Ok(SyncOutcome::BuildQueued)
            }
        }
    }
}

/// Chat message for a failed stage. Pull failures are only logged.
fn failure_message(stage: SyncStage, key: &str) -> Option<String> {
    match stage {
        SyncStage::Cloning => Some(format!("Error cloning repo {}", key)),
        SyncStage::Fetching => Some(format!("Error fetching repo {}", key)),
        SyncStage::CheckingUpdate => Some(format!("Error checking repo {}", key)),
        SyncStage::Pulling => None,
    }
}

#[async_trait]
impl ProjectSync for Synchronizer {
    async fn sync(&self, project: Project) -> SyncOutcome {
        self.update_repository(&project).await
    }
}
