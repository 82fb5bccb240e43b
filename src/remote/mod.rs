//! Remote shell channel into a running container.
//!
//! The kernel builder container runs sshd on port 22, forwarded to
//! `ssh_fwd_port` on the host. Commands go through [`RemoteShell`] so the
//! build steps can be exercised without a container.

pub mod executor;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cancel::{Backoff, Cancellation};
use crate::error::LabError;
use crate::process::Cmd;

pub use executor::{PatchReport, RemoteExecutor};

/// Private key generated for the lab.
pub const SSH_KEY_NAME: &str = "like.id_rsa";

/// Command execution inside a container.
pub trait RemoteShell {
    /// Human readable target, e.g. `user@localhost:2222`.
    fn target(&self) -> String;

    /// True once the remote end accepts commands.
    fn probe(&self) -> Result<bool>;

    /// Run a shell command line and return its exit code. Output is echoed.
    fn exec(&self, command: &str) -> Result<i32>;
}

/// [`RemoteShell`] over the `ssh` client.
#[derive(Debug, Clone)]
pub struct SshShell {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key: PathBuf,
}

impl SshShell {
    pub fn new(user: &str, port: u16, key: &Path) -> Self {
        Self {
            user: user.to_string(),
            host: "localhost".to_string(),
            port,
            key: key.to_path_buf(),
        }
    }

    fn base(&self) -> Cmd {
        Cmd::new("ssh")
            .arg("-i")
            .arg(&self.key)
            .args(["-p", &self.port.to_string()])
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
                "-o",
                "BatchMode=yes",
            ])
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl RemoteShell for SshShell {
    fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    fn probe(&self) -> Result<bool> {
        let out = self
            .base()
            .args(["-o", "ConnectTimeout=5"])
            .arg(self.destination())
            .arg("true")
            .allow_fail()
            .run()?;
        Ok(out.success())
    }

    fn exec(&self, command: &str) -> Result<i32> {
        tracing::info!("[remote] {}", command);
        self.base()
            .arg(self.destination())
            .arg(command)
            .allow_fail()
            .stream_lines(|line| tracing::info!("{}", line))
    }
}

/// Wait until `shell` accepts commands, bounded by `backoff`.
pub fn connect_with_retry(
    shell: &dyn RemoteShell,
    backoff: Backoff,
    cancel: &Cancellation,
) -> Result<()> {
    let connected = backoff.poll(cancel, |attempt| {
        if shell.probe()? {
            return Ok(Some(()));
        }
        tracing::debug!(
            "ssh to {} not ready (attempt {}/{})",
            shell.target(),
            attempt,
            backoff.attempts
        );
        Ok(None)
    })?;
    connected.ok_or_else(|| {
        LabError::SshExhausted {
            target: shell.target(),
            attempts: backoff.attempts,
        }
        .into()
    })
}

/// Make sure a key pair exists under `ssh_dir` and return the private key.
///
/// A non-empty directory is reused as is.
pub fn ensure_ssh_keys(ssh_dir: &Path) -> Result<PathBuf> {
    let key = ssh_dir.join(SSH_KEY_NAME);
    let populated = ssh_dir.is_dir()
        && fs::read_dir(ssh_dir)
            .with_context(|| format!("reading ssh directory '{}'", ssh_dir.display()))?
            .next()
            .is_some();
    if populated {
        tracing::debug!("reusing ssh keys from {}", ssh_dir.display());
        return Ok(key);
    }

    tracing::info!("generating ssh key pair in {}", ssh_dir.display());
    fs::create_dir_all(ssh_dir)
        .with_context(|| format!("creating ssh directory '{}'", ssh_dir.display()))?;
    Cmd::new("ssh-keygen")
        .arg("-f")
        .arg(&key)
        .args(["-t", "rsa", "-N", "", "-q"])
        .error_msg("generating ssh key pair")
        .run()?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code_for;
    use crate::testing::FakeShell;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn retry_succeeds_once_reachable() {
        let shell = FakeShell::default().unreachable_for(2);
        connect_with_retry(&shell, Backoff::new(5, Duration::ZERO), &Cancellation::detached())
            .unwrap();
        assert_eq!(shell.probes(), 3);
    }

    #[test]
    fn exhausted_retries_have_their_own_exit_code() {
        let shell = FakeShell::default().unreachable_for(10);
        let err = connect_with_retry(
            &shell,
            Backoff::new(3, Duration::ZERO),
            &Cancellation::detached(),
        )
        .unwrap_err();
        assert_eq!(exit_code_for(&err), 6);
        assert_eq!(shell.probes(), 3);
    }

    #[test]
    fn populated_ssh_dir_is_reused() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(".ssh");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SSH_KEY_NAME), "key").unwrap();
        let key = ensure_ssh_keys(&dir).unwrap();
        assert_eq!(key, dir.join(SSH_KEY_NAME));
        assert_eq!(fs::read_to_string(&key).unwrap(), "key");
    }

    #[test]
    fn ssh_target_format() {
        let shell = SshShell::new("user", 2222, Path::new(".ssh/like.id_rsa"));
        assert_eq!(shell.target(), "user@localhost:2222");
    }
}
