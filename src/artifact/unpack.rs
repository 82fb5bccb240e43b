//! Kernel source unpack/reuse decision (stage 2).
//!
//! The decision is taken over the state of `kernel_root`:
//!
//! | state                         | outcome                                  |
//! |-------------------------------|------------------------------------------|
//! | absent                        | fresh unpack                             |
//! | empty                         | purge, fresh unpack                      |
//! | files, `vmlinux`, kept        | reuse                                    |
//! | files, `vmlinux`, not kept    | dirty rebuild, no re-extraction          |
//! | files, no `vmlinux`           | dirty rebuild, no re-extraction          |

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use super::history::History;
use crate::error::LabError;
use crate::pipeline::result::UnpackStatus;
use crate::reuse::{Prompt, ReusePolicy};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// Result of the unpack decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackOutcome {
    pub status: UnpackStatus,
    pub assume_dirty: bool,
    /// Set when `status` is [`UnpackStatus::Error`].
    pub error: Option<String>,
}

impl UnpackOutcome {
    fn unpack(assume_dirty: bool) -> Self {
        Self {
            status: UnpackStatus::Unpack,
            assume_dirty,
            error: None,
        }
    }

    fn reuse() -> Self {
        Self {
            status: UnpackStatus::Reuse,
            assume_dirty: false,
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: UnpackStatus::Error,
            assume_dirty: false,
            error: Some(message),
        }
    }
}

/// Container format detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
}

impl ArchiveFormat {
    pub fn sniff(path: &Path) -> Result<Option<Self>> {
        let mut head = Vec::with_capacity(512);
        File::open(path)
            .with_context(|| format!("opening archive '{}'", path.display()))?
            .take(512)
            .read_to_end(&mut head)
            .with_context(|| format!("reading archive '{}'", path.display()))?;

        if head.starts_with(&GZIP_MAGIC) {
            return Ok(Some(Self::TarGz));
        }
        let ustar = head.get(USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len());
        if ustar == Some(USTAR_MAGIC) {
            return Ok(Some(Self::Tar));
        }
        Ok(None)
    }
}

pub struct KernelUnpacker<'a> {
    kernel_root: PathBuf,
    archive: PathBuf,
    history_path: PathBuf,
    policy: ReusePolicy,
    prompt: &'a dyn Prompt,
}

impl<'a> KernelUnpacker<'a> {
    pub fn new(
        kernel_root: &Path,
        archive: &Path,
        history_path: &Path,
        policy: ReusePolicy,
        prompt: &'a dyn Prompt,
    ) -> Self {
        Self {
            kernel_root: kernel_root.to_path_buf(),
            archive: archive.to_path_buf(),
            history_path: history_path.to_path_buf(),
            policy,
            prompt,
        }
    }

    pub fn run(&self) -> Result<UnpackOutcome> {
        if !self.kernel_root.exists() {
            return self.fresh_unpack();
        }
        if !self.kernel_root.is_dir() {
            return Err(LabError::Artifact(format!(
                "kernel root '{}' exists but is not a directory",
                self.kernel_root.display()
            ))
            .into());
        }

        let content = self.content()?;
        if content.is_empty() {
            self.purge()?;
            return self.fresh_unpack();
        }

        if !content.iter().any(|name| name == "vmlinux") {
            tracing::info!("kernel tree without vmlinux, rebuilding from a clean state");
            return Ok(UnpackOutcome::unpack(true));
        }

        let history = History::load(&self.history_path)?;
        let identity = self.identity();
        let keep = self
            .policy
            .keep("vmlinux", self.prompt, || history.archive_matches(&identity))?;
        if keep {
            tracing::info!("re-using existing vmlinux");
            Ok(UnpackOutcome::reuse())
        } else {
            Ok(UnpackOutcome::unpack(true))
        }
    }

    fn identity(&self) -> String {
        self.archive.display().to_string()
    }

    fn content(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.kernel_root)
            .with_context(|| format!("reading '{}'", self.kernel_root.display()))?
        {
            let entry =
                entry.with_context(|| format!("iterating '{}'", self.kernel_root.display()))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn purge(&self) -> Result<()> {
        tracing::info!("purging {}", self.kernel_root.display());
        fs::remove_dir_all(&self.kernel_root)
            .with_context(|| format!("removing '{}'", self.kernel_root.display()))
    }

    fn fresh_unpack(&self) -> Result<UnpackOutcome> {
        tracing::info!("unpacking {}", self.archive.display());
        if let Err(e) = extract_into(&self.archive, &self.kernel_root) {
            tracing::error!("unpacking {} failed: {:#}", self.archive.display(), e);
            return Ok(UnpackOutcome::error(format!("{:#}", e)));
        }

        let mut history = History::load(&self.history_path)?;
        history.record_archive(&self.identity());
        history.save(&self.history_path)?;
        Ok(UnpackOutcome::unpack(false))
    }
}

/// Extract `archive` so that its top-level directory becomes `dest`.
///
/// Extraction happens in a hidden staging directory next to `dest`; `dest`
/// only appears once extraction succeeded.
pub fn extract_into(archive: &Path, dest: &Path) -> Result<()> {
    let format = ArchiveFormat::sniff(archive)?.ok_or_else(|| {
        LabError::Artifact(format!(
            "'{}' is not a tar or tar.gz archive",
            archive.display()
        ))
    })?;

    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kernel".to_string());
    let staging = parent.join(format!(".{}.unpack", name));

    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("removing stale '{}'", staging.display()))?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("creating '{}'", staging.display()))?;

    let result = unpack_staged(archive, format, &staging, dest);
    if staging.exists() {
        if let Err(e) = fs::remove_dir_all(&staging) {
            tracing::warn!("failed to clean up {}: {}", staging.display(), e);
        }
    }
    result
}

fn unpack_staged(archive: &Path, format: ArchiveFormat, staging: &Path, dest: &Path) -> Result<()> {
    let file = BufReader::new(
        File::open(archive).with_context(|| format!("opening '{}'", archive.display()))?,
    );
    let unpacked = match format {
        ArchiveFormat::TarGz => tar::Archive::new(GzDecoder::new(file)).unpack(staging),
        ArchiveFormat::Tar => tar::Archive::new(file).unpack(staging),
    };
    unpacked.map_err(|e| {
        LabError::Artifact(format!("extracting '{}': {}", archive.display(), e))
    })?;

    let mut entries = fs::read_dir(staging)
        .with_context(|| format!("reading '{}'", staging.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("iterating '{}'", staging.display()))?;

    let root = match entries.len() {
        0 => {
            return Err(
                LabError::Artifact(format!("'{}' is empty", archive.display())).into(),
            )
        }
        1 if entries[0].path().is_dir() => entries.remove(0).path(),
        _ => staging.to_path_buf(),
    };

    // A flat archive has no top-level directory: staging itself is the tree.
    fs::rename(&root, dest)
        .with_context(|| format!("moving '{}' to '{}'", root.display(), dest.display()))?;
    Ok(())
}
