//! Remote build steps inside the kernel builder container.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::RemoteShell;
use crate::error::LabError;

/// Outcome of applying a patch directory. Individual failures do not abort.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub applied: Vec<String>,
    pub failed: Vec<String>,
}

impl PatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs commands from a fixed working directory inside the container.
pub struct RemoteExecutor<'a> {
    shell: &'a dyn RemoteShell,
    workdir: String,
    sudo: bool,
}

impl<'a> RemoteExecutor<'a> {
    pub fn new(shell: &'a dyn RemoteShell, workdir: impl Into<String>, sudo: bool) -> Self {
        Self {
            shell,
            workdir: workdir.into(),
            sudo,
        }
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// Same shell and privileges, different working directory.
    pub fn in_dir(&self, workdir: impl Into<String>) -> RemoteExecutor<'a> {
        RemoteExecutor {
            shell: self.shell,
            workdir: workdir.into(),
            sudo: self.sudo,
        }
    }

    /// Full command line sent to the shell for `command`.
    pub fn command_line(&self, command: &str) -> String {
        format!(
            "cd {} && {}{}",
            self.workdir,
            if self.sudo { "sudo " } else { "" },
            command
        )
    }

    /// Run `command`; a non-zero exit is an error unless `allow_non_zero`.
    pub fn run_remote(&self, command: &str, allow_non_zero: bool) -> Result<i32> {
        let line = self.command_line(command);
        let code = self.shell.exec(&line)?;
        if code != 0 && !allow_non_zero {
            return Err(LabError::RemoteCommand {
                command: line,
                code,
            }
            .into());
        }
        Ok(code)
    }

    /// Apply every file in `host_dir` with `patch -p1`, in name order.
    ///
    /// `remote_dir` is where `host_dir` is visible inside the container.
    pub fn apply_patches(&self, host_dir: &Path, remote_dir: &str) -> Result<PatchReport> {
        let mut report = PatchReport::default();
        if !host_dir.is_dir() {
            tracing::debug!("no patch directory at {}", host_dir.display());
            return Ok(report);
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(host_dir)
            .with_context(|| format!("reading patch directory '{}'", host_dir.display()))?
        {
            let entry = entry
                .with_context(|| format!("iterating patch directory '{}'", host_dir.display()))?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        for name in names {
            tracing::debug!("patching: {}", name);
            let code = self.run_remote(
                &format!("patch -p1 < {}/{} > /dev/null", remote_dir, name),
                true,
            )?;
            if code == 0 {
                report.applied.push(name);
            } else {
                tracing::error!("failed to apply patch {}, continuing", name);
                report.failed.push(name);
            }
        }
        Ok(report)
    }
}

/// Whether remote commands need `sudo`: root is required inside the
/// container and this process is not already root.
pub fn needs_sudo(require_root: bool) -> bool {
    require_root && !nix::unistd::getuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code_for;
    use crate::testing::FakeShell;
    use tempfile::TempDir;

    #[test]
    fn commands_run_from_workdir() {
        let shell = FakeShell::default();
        let exec = RemoteExecutor::new(&shell, "/io/kernel_root", false);
        exec.run_remote("make clean", false).unwrap();
        assert_eq!(shell.commands(), vec!["cd /io/kernel_root && make clean".to_string()]);
    }

    #[test]
    fn sudo_is_prefixed_after_cd() {
        let shell = FakeShell::default();
        let exec = RemoteExecutor::new(&shell, "/io/kernel_root", true);
        assert_eq!(
            exec.command_line("make mrproper"),
            "cd /io/kernel_root && sudo make mrproper"
        );
    }

    #[test]
    fn non_zero_exit_is_remote_command_error() {
        let shell = FakeShell::default().failing("make -j$(nproc) all", 2);
        let exec = RemoteExecutor::new(&shell, "/io/k", false);
        let err = exec.run_remote("make -j$(nproc) all", false).unwrap_err();
        assert_eq!(exit_code_for(&err), 4);
        assert_eq!(exec.run_remote("make -j$(nproc) all", true).unwrap(), 2);
    }

    #[test]
    fn patch_failures_do_not_stop_the_rest() {
        let tmp = TempDir::new().unwrap();
        for name in ["0001-a.patch", "0002-b.patch", "0003-c.patch"] {
            fs::write(tmp.path().join(name), "").unwrap();
        }
        let shell = FakeShell::default().failing("0002-b.patch", 1);
        let exec = RemoteExecutor::new(&shell, "/io/k", false);

        let report = exec.apply_patches(tmp.path(), "/io/patches").unwrap();

        assert_eq!(report.applied, vec!["0001-a.patch", "0003-c.patch"]);
        assert_eq!(report.failed, vec!["0002-b.patch"]);
        assert!(!report.is_clean());
        assert_eq!(shell.commands().len(), 3);
    }

    #[test]
    fn missing_patch_dir_is_empty_report() {
        let shell = FakeShell::default();
        let exec = RemoteExecutor::new(&shell, "/io/k", false);
        let report = exec
            .apply_patches(Path::new("/definitely/not/here"), "/io/p")
            .unwrap();
        assert!(report.is_clean());
        assert!(shell.commands().is_empty());
    }

    #[test]
    fn sudo_only_when_root_required() {
        assert!(!needs_sudo(false));
        assert_eq!(needs_sudo(true), !nix::unistd::getuid().is_root());
    }
}
