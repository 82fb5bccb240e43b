//! Data handed from one stage to the next.

use anyhow::Result;
use std::path::PathBuf;

use super::Stage;
use crate::error::LabError;

/// Bumped whenever [`StageResult`] changes shape.
pub const STAGE_RESULT_VERSION: u32 = 1;

/// Outcome of the unpack/reuse decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackStatus {
    /// Kernel source needs a build.
    Unpack,
    /// Existing build is reused as-is.
    Reuse,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub version: u32,
    pub kernel_root: PathBuf,
    pub archive: Option<PathBuf>,
    pub status: UnpackStatus,
    pub assume_dirty: bool,
    pub kernel_image: Option<PathBuf>,
    pub rootfs: Option<PathBuf>,
}

impl StageResult {
    pub fn new(kernel_root: PathBuf) -> Self {
        Self {
            version: STAGE_RESULT_VERSION,
            kernel_root,
            archive: None,
            status: UnpackStatus::Unpack,
            assume_dirty: false,
            kernel_image: None,
            rootfs: None,
        }
    }

    /// Stand-in for the stages skipped by a forced-partial run starting at `stage`.
    ///
    /// Starting at the kernel build treats the existing tree as dirty so it is
    /// cleaned and rebuilt; starting later treats it as already built.
    pub fn synthetic(stage: Stage, kernel_root: PathBuf) -> Self {
        let mut result = Self::new(kernel_root);
        match stage {
            Stage::Download | Stage::Unpack => {}
            Stage::BuildKernel => result.assume_dirty = true,
            Stage::Rootfs | Stage::Debug => result.status = UnpackStatus::Reuse,
        }
        tracing::debug!("synthetic result for partial run from {}: {:?}", stage, result);
        result
    }

    /// Check the result is usable by the stage after `completed`.
    pub fn validate(&self, completed: Stage) -> Result<()> {
        if self.version != STAGE_RESULT_VERSION {
            return Err(LabError::Artifact(format!(
                "stage result version {} does not match {}",
                self.version, STAGE_RESULT_VERSION
            ))
            .into());
        }
        if self.status == UnpackStatus::Error {
            return Err(LabError::Artifact(format!(
                "kernel source in {} could not be prepared",
                self.kernel_root.display()
            ))
            .into());
        }
        if self.kernel_root.as_os_str().is_empty() {
            return Err(LabError::Artifact("stage result has no kernel root".into()).into());
        }
        if let (Stage::Download, Some(archive)) = (completed, &self.archive) {
            if !archive.is_file() {
                return Err(LabError::Artifact(format!(
                    "kernel archive {} is missing",
                    archive.display()
                ))
                .into());
            }
        }
        if completed >= Stage::Rootfs && self.rootfs.is_none() {
            return Err(LabError::Artifact("stage result has no rootfs path".into()).into());
        }
        Ok(())
    }
}
