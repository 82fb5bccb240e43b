//! Operator supplied kernel and rootfs (`--ctf`).

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::LabError;
use crate::process::Cmd;

pub const VMLINUX: &str = "vmlinux";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtfInputs {
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
}

impl CtfInputs {
    /// Both images must exist; relative paths are made absolute so they can
    /// be bind-mounted.
    pub fn new(kernel: &Path, rootfs: &Path) -> Result<Self> {
        Ok(Self {
            kernel: existing(kernel, "CTF kernel")?,
            rootfs: existing(rootfs, "CTF rootfs")?,
        })
    }

    /// Extract an uncompressed `vmlinux` from the supplied kernel into
    /// `out_dir` with the `extract-vmlinux` script.
    pub fn extract_vmlinux(&self, script: &Path, out_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("creating '{}'", out_dir.display()))?;
        let dest = out_dir.join(VMLINUX);
        tracing::info!("extracting vmlinux from {}", self.kernel.display());
        let code = Cmd::new(script)
            .arg(&self.kernel)
            .allow_fail()
            .run_to_file(&dest)?;
        if code != 0 {
            let _ = fs::remove_file(&dest);
            return Err(LabError::Artifact(format!(
                "could not extract vmlinux from {} (exit {})",
                self.kernel.display(),
                code
            ))
            .into());
        }
        Ok(dest)
    }
}

fn existing(path: &Path, what: &str) -> Result<PathBuf> {
    if !path.exists() {
        return Err(LabError::Artifact(format!("{} not found at {}", what, path.display())).into());
    }
    fs::canonicalize(path).with_context(|| format!("resolving '{}'", path.display()))
}
