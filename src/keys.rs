//! SSH identity used for every git operation against project remotes.

use std::path::{Path, PathBuf};

use tokio::process::Command;

pub fn key_path(data_dir: &Path) -> PathBuf {
    data_dir.join(".ssh").join("id_rsa")
}

/// Make sure `<data_dir>/.ssh/id_rsa` exists, generating an unencrypted RSA
/// keypair with `ssh-keygen` when it does not. Generation failures are
/// logged; git operations will then fail with their own errors.
pub async fn ensure_keypair(data_dir: &Path) -> PathBuf {
    let key = key_path(data_dir);
    if key.exists() {
        tracing::debug!(key = %key.display(), "ssh key present");
        return key;
    }

    if let Some(dir) = key.parent()
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        tracing::error!("failed to create {}: {}", dir.display(), e);
        return key;
    }

    tracing::info!(key = %key.display(), "generating ssh keypair");
    let output = Command::new("ssh-keygen")
        .arg("-q")
        .arg("-f")
        .arg(&key)
        .args(["-t", "rsa", "-N", ""])
        .stdin(std::process::Stdio::null())
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            tracing::info!("ssh public key written to {}.pub", key.display());
        }
        Ok(out) => {
            tracing::error!(
                "ssh-keygen exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Err(e) => tracing::error!("failed to run ssh-keygen: {}", e),
    }
    key
}
