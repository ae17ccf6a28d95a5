//! Build job execution.
//!
//! A job runs the project's build script with `sh -xe` inside the working
//! copy, buffers its output in memory, and reports the outcome through the
//! notifier once the process exits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Project;
use crate::errors::BuildError;
use crate::git;
use crate::notify::Notifier;

/// How long to keep draining pipes after the build process exits. Background
/// processes spawned by a build can hold the pipes open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl BuildResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.duration_ms / 1000
    }
}

/// Variables parsed from `<working_copy>/.env`.
///
/// A missing or unparseable file yields an empty overlay.
pub fn load_env_file(working_copy: &Path) -> HashMap<String, String> {
    let path = working_copy.join(".env");
    let Ok(iter) = dotenvy::from_path_iter(&path) else {
        return HashMap::new();
    };
    match iter.collect::<Result<HashMap<_, _>, _>>() {
        Ok(vars) => vars,
        Err(e) => {
            tracing::warn!(path = %path.display(), "ignoring unparseable .env: {}", e);
            HashMap::new()
        }
    }
}

/// Full environment for a build: the daemon's own environment, then `.env`,
/// then `PROJECT_PATH`.
pub fn build_env(working_copy: &Path) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();

    env.extend(load_env_file(working_copy));
    env.insert(
        "PROJECT_PATH".to_string(),
        working_copy.to_string_lossy().into_owned(),
    );
    env
}

/// A queued build bound to one project.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub project: Project,
    pub working_copy: PathBuf,
    pub started_at: DateTime<Utc>,
    pub env: HashMap<String, String>,
    started: Instant,
}

impl BuildJob {
    /// Capture the start time and environment. Call when the job begins
    /// executing, not when it is enqueued.
    pub fn new(project: Project, working_copy: PathBuf) -> Self {
        let env = build_env(&working_copy);
        Self {
            project,
            working_copy,
            started_at: Utc::now(),
            env,
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Spawn the build script and wait for it. When `cancel` fires, the
    /// script's whole process group is killed and the result is marked as
    /// timed out.
    pub async fn run(&self, cancel: CancellationToken) -> Result<BuildResult, BuildError> {
        let mut std_cmd = std::process::Command::new("sh");
        std_cmd
            .arg("-xe")
            .arg(&self.project.build_script)
            .current_dir(&self.working_copy)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| BuildError::SpawnFailed {
            script: self.project.build_script.clone(),
            source,
        })?;

        let (stdout_buf, mut stdout_task) = capture(child.stdout.take());
        let (stderr_buf, mut stderr_task) = capture(child.stderr.take());

        let (status, timed_out) = tokio::select! {
            status = child.wait() => (status.map_err(BuildError::WaitFailed)?, false),
            _ = cancel.cancelled() => {
                tracing::warn!(project = %self.project.key, "killing timed-out build");
                kill_process_group(&mut child);
                (child.wait().await.map_err(BuildError::WaitFailed)?, true)
            }
        };

        let drained = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
            let _ = (&mut stdout_task).await;
            let _ = (&mut stderr_task).await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!(project = %self.project.key, "build output pipes still open after exit");
            stdout_task.abort();
            stderr_task.abort();
        }

        Ok(BuildResult {
            exit_code: status.code(),
            stdout: take_text(&stdout_buf),
            stderr: take_text(&stderr_buf),
            duration_ms: self.elapsed_ms(),
            timed_out,
        })
    }

    /// Run the build and send its lifecycle notifications.
    ///
    /// Success sends one message; failure, timeout, or spawn errors send
    /// exactly three, in order: summary, stdout, stderr.
    pub async fn execute(self, notifier: &Notifier, cancel: CancellationToken) -> BuildResult {
        let project = &self.project;
        let commit = git::head_info(&self.working_copy).map(|(sha, _)| sha);
        tracing::info!(
            project = %project.key,
            script = %project.build_script.display(),
            commit = commit.as_deref().unwrap_or("unknown"),
            "executing build"
        );
        notifier.send(project, format!("{} started", project.key));

        let result = match self.run(cancel).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(project = %project.key, "build could not run: {}", e);
                BuildResult {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration_ms: self.elapsed_ms(),
                    timed_out: false,
                }
            }
        };

        if result.success() {
            tracing::info!(project = %project.key, duration_ms = result.duration_ms, "build finished");
            notifier.send(
                project,
                format!("{} success in {}s", project.key, result.elapsed_secs()),
            );
        } else {
            let summary = if result.timed_out {
                format!("{} timed out in {}s", project.key, result.elapsed_secs())
            } else {
                format!("{} failure in {}s", project.key, result.elapsed_secs())
            };
            tracing::warn!(
                project = %project.key,
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                "build failed"
            );
            notifier.send(project, summary);
            notifier.send(project, format!("stdout:\n{}", result.stdout));
            notifier.send(project, format!("stderr:\n{}", result.stderr));
        }

        result
    }
}

/// Drain `reader` into a shared buffer on a background task.
fn capture<R>(reader: Option<R>) -> (Arc<Mutex<Vec<u8>>>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = buf.clone();
    let task = tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut guard) = sink.lock() {
                        guard.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    (buf, task)
}

fn take_text(buf: &Mutex<Vec<u8>>) -> String {
    buf.lock()
        .map(|guard| String::from_utf8_lossy(&guard).into_owned())
        .unwrap_or_default()
}

fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // The child leads its own process group, so this reaches every
            // process the build script started.
            let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
            if rc == 0 {
                return;
            }
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!("failed to kill build process: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RepoConfig, SlackConfig};
    use crate::notify::testing::RecordingTransport;
    use tempfile::tempdir;

    fn create_test_script(dir: &Path, name: &str, content: &str) -> PathBuf {
        let script_path = dir.join(name);
        std::fs::write(&script_path, content).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    fn project(script: PathBuf, working_copy: &Path) -> Project {
        Project {
            key: "api".to_string(),
            repo: RepoConfig {
                url: "git@github.com:acme/api.git".to_string(),
                branch: "master".to_string(),
            },
            path: Some(working_copy.to_path_buf()),
            build_script: script,
            slack: Some(SlackConfig {
                webhook_url: "https://hooks.example.com/x".to_string(),
                channel: None,
                username: None,
                icon: None,
            }),
        }
    }

    #[test]
    fn test_env_overlay_and_project_path() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "FOO=bar\n# comment\nQUOTED=\"a b\"\n").unwrap();

        let env = build_env(dir.path());
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("QUOTED").map(String::as_str), Some("a b"));
        assert_eq!(
            env.get("PROJECT_PATH").map(String::as_str),
            Some(dir.path().to_str().unwrap())
        );
        // Inherited from the test process.
        assert!(env.contains_key("PATH"));
    }

    #[test]
    fn test_missing_env_file_is_empty_overlay() {
        let dir = tempdir().unwrap();
        assert!(load_env_file(dir.path()).is_empty());
        let env = build_env(dir.path());
        assert!(!env.contains_key("FOO"));
        assert!(env.contains_key("PROJECT_PATH"));
    }

    #[test]
    fn test_env_without_env_file_is_inherited_plus_project_path() {
        let dir = tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("README"), "hi\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("hookci", "hookci@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();

        let inherited: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let env = build_env(dir.path());

        let mut extra: Vec<&str> = env
            .keys()
            .filter(|k| !inherited.contains_key(*k))
            .map(String::as_str)
            .collect();
        extra.sort();
        assert_eq!(extra, vec!["PROJECT_PATH"]);
        for (key, value) in &inherited {
            if key != "PROJECT_PATH" {
                assert_eq!(env.get(key), Some(value));
            }
        }
    }

    #[test]
    fn test_unparseable_env_file_is_empty_overlay() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "GOOD=1\nthis is not valid\n").unwrap();
        assert!(load_env_file(dir.path()).is_empty());
    }

    #[test]
    fn test_project_path_cannot_be_overridden_by_env_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "PROJECT_PATH=/elsewhere\n").unwrap();
        let env = build_env(dir.path());
        assert_eq!(
            env.get("PROJECT_PATH").map(String::as_str),
            Some(dir.path().to_str().unwrap())
        );
    }

    #[tokio::test]
    async fn test_build_observes_env_and_captures_output() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "FOO=bar\n").unwrap();
        let script = create_test_script(
            dir.path(),
            "build.sh",
            "#!/bin/sh\necho \"foo=$FOO path=$PROJECT_PATH\"\necho warn >&2\n",
        );

        let job = BuildJob::new(project(script, dir.path()), dir.path().to_path_buf());
        let result = job.run(CancellationToken::new()).await.unwrap();

        assert!(result.success());
        assert!(
            result
                .stdout
                .contains(&format!("foo=bar path={}", dir.path().display()))
        );
        // `sh -x` traces commands to stderr as well.
        assert!(result.stderr.contains("warn"));
    }

    #[tokio::test]
    async fn test_build_runs_in_working_copy() {
        let dir = tempdir().unwrap();
        let script = create_test_script(dir.path(), "build.sh", "#!/bin/sh\npwd\n");
        let job = BuildJob::new(project(script, dir.path()), dir.path().to_path_buf());
        let result = job.run(CancellationToken::new()).await.unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            PathBuf::from(result.stdout.trim()).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_failed_build_sends_three_ordered_notifications() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "build.sh",
            "#!/bin/sh\necho compiling\necho 'error: boom' >&2\nexit 3\n",
        );
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(None, transport.clone());

        let job = BuildJob::new(project(script, dir.path()), dir.path().to_path_buf());
        let result = job.execute(&notifier, CancellationToken::new()).await;
        assert_eq!(result.exit_code, Some(3));

        let texts = transport.wait_for(4).await;
        assert_eq!(texts.len(), 4);
        assert_eq!(texts[0], "api started");
        assert_eq!(texts[1], "api failure in 0s");
        assert!(texts[2].starts_with("stdout:\n"));
        assert!(texts[2].contains("compiling"));
        assert!(texts[3].starts_with("stderr:\n"));
        assert!(texts[3].contains("error: boom"));
    }

    #[tokio::test]
    async fn test_successful_build_sends_one_result_notification() {
        let dir = tempdir().unwrap();
        let script = create_test_script(dir.path(), "build.sh", "#!/bin/sh\nexit 0\n");
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(None, transport.clone());

        let job = BuildJob::new(project(script, dir.path()), dir.path().to_path_buf());
        let result = job.execute(&notifier, CancellationToken::new()).await;
        assert!(result.success());

        let texts = transport.wait_for(2).await;
        assert_eq!(texts, vec!["api started", "api success in 0s"]);
    }

    #[tokio::test]
    async fn test_missing_script_reports_failure() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(None, transport.clone());

        let job = BuildJob::new(
            project(dir.path().join("does-not-exist.sh"), dir.path()),
            dir.path().to_path_buf(),
        );
        let result = job.execute(&notifier, CancellationToken::new()).await;
        assert!(!result.success());

        let texts = transport.wait_for(4).await;
        assert_eq!(texts.len(), 4);
        assert_eq!(texts[1], "api failure in 0s");
    }

    #[tokio::test]
    async fn test_timed_out_build_sends_three_ordered_notifications() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "build.sh",
            "#!/bin/sh\necho compiling\necho 'still linking' >&2\nsleep 30\n",
        );
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(None, transport.clone());
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let job = BuildJob::new(project(script, dir.path()), dir.path().to_path_buf());
        let result = job.execute(&notifier, token).await;
        assert!(result.timed_out);

        let texts = transport.wait_for(4).await;
        assert_eq!(texts.len(), 4);
        assert_eq!(texts[0], "api started");
        assert_eq!(texts[1], "api timed out in 0s");
        assert!(texts[2].starts_with("stdout:\n"));
        assert!(texts[2].contains("compiling"));
        assert!(texts[3].starts_with("stderr:\n"));
        assert!(texts[3].contains("still linking"));
    }

    #[tokio::test]
    async fn test_cancel_kills_process_group() {
        let dir = tempdir().unwrap();
        let script = create_test_script(
            dir.path(),
            "build.sh",
            "#!/bin/sh\necho begin\nsleep 30 &\nsleep 30\n",
        );
        let job = BuildJob::new(project(script, dir.path()), dir.path().to_path_buf());
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = job.run(token).await.unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
        assert!(result.stdout.contains("begin"));
        // Both sleeps were in the group, so the pipes closed promptly.
        assert!(started.elapsed() < OUTPUT_DRAIN_GRACE);
    }
}
