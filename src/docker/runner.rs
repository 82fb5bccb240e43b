//! Image build/reuse and container start for one component.
//!
//! [`ImageRunner::run`] is the shared flow every docker-backed component goes
//! through: update-mode short circuit, reuse check, base-before-derived image
//! build, then the component's own [`ContainerStart`].

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{BuildRequest, BuildStatus, ContainerEngine, HealthStatus, ImageRef};
use crate::cancel::{Backoff, Cancellation};
use crate::error::LabError;
use crate::reuse::{Prompt, ReuseFlags, ReusePolicy};

/// Image a component runs in.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub tag: String,
    pub dockerfile: PathBuf,
    pub build_args: BTreeMap<String, String>,
    pub force_rebuild: bool,
}

/// What [`ImageRunner::run`] ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Update mode: the image was rebuilt and nothing was started.
    Updated,
    Started(ImageRef),
}

/// Component-specific container start logic.
pub trait ContainerStart {
    fn start(&mut self, runner: &ImageRunner<'_>, image: &ImageRef) -> Result<()>;
}

/// Shared container lifecycle for the lab components.
pub struct ImageRunner<'a> {
    engine: &'a dyn ContainerEngine,
    prompt: &'a dyn Prompt,
    cancel: Cancellation,
    context: PathBuf,
    base: ImageSpec,
    health: Backoff,
    flags: ReuseFlags,
}

impl<'a> ImageRunner<'a> {
    pub fn new(
        engine: &'a dyn ContainerEngine,
        prompt: &'a dyn Prompt,
        cancel: Cancellation,
        context: &Path,
        base: ImageSpec,
        health: Backoff,
        flags: ReuseFlags,
    ) -> Self {
        Self {
            engine,
            prompt,
            cancel,
            context: context.to_path_buf(),
            base,
            health,
            flags,
        }
    }

    pub fn engine(&self) -> &'a dyn ContainerEngine {
        self.engine
    }

    pub fn cancel(&self) -> Cancellation {
        self.cancel
    }

    pub fn flags(&self) -> ReuseFlags {
        self.flags
    }

    /// Build `spec`, logging every build line at debug level.
    pub fn build_image(&self, spec: &ImageSpec, no_cache: bool) -> Result<BuildStatus> {
        tracing::info!("building image {}", spec.tag);
        let request = BuildRequest {
            context: &self.context,
            dockerfile: &spec.dockerfile,
            tag: &spec.tag,
            build_args: &spec.build_args,
            no_cache,
        };
        let status = self.engine.build_image(&request, &mut |line: &str| {
            let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
            if !line.is_empty() {
                tracing::debug!("{}", line);
            }
        })?;
        if let BuildStatus::Failed(reason) = &status {
            tracing::error!("building {} failed: {}", spec.tag, reason);
        }
        Ok(status)
    }

    pub fn get_image(&self, tag: &str) -> Result<Option<ImageRef>> {
        self.engine.get_image(tag)
    }

    /// Build the base image if it is not present yet.
    pub fn ensure_base_image(&self) -> Result<()> {
        if self.engine.get_image(&self.base.tag)?.is_some() {
            return Ok(());
        }
        tracing::info!("base image {} missing, building it first", self.base.tag);
        self.build_or_fail(&self.base, false).map(|_| ())
    }

    /// Update mode: rebuild the base image without cache.
    pub fn rebuild_base_image(&self) -> Result<()> {
        self.cancel.check()?;
        self.build_or_fail(&self.base, true).map(|_| ())
    }

    /// Existing image for `spec` if the reuse policy keeps it.
    pub fn check_existing(&self, spec: &ImageSpec) -> Result<Option<ImageRef>> {
        let Some(image) = self.engine.get_image(&spec.tag)? else {
            return Ok(None);
        };
        let policy = ReusePolicy::resolve(self.flags, spec.force_rebuild);
        if policy.keep(&format!("image {}", spec.tag), self.prompt, || true)? {
            Ok(Some(image))
        } else {
            Ok(None)
        }
    }

    /// Shared build/reuse/start flow.
    pub fn run(
        &self,
        spec: &ImageSpec,
        check_existing: bool,
        start: &mut dyn ContainerStart,
    ) -> Result<RunOutcome> {
        self.cancel.check()?;
        if self.flags.update {
            self.ensure_base_image()?;
            self.build_or_fail(spec, true)?;
            return Ok(RunOutcome::Updated);
        }

        let existing = if check_existing {
            self.check_existing(spec)?
        } else if spec.force_rebuild {
            None
        } else {
            self.engine.get_image(&spec.tag)?
        };

        let image = match existing {
            Some(image) => image,
            None => {
                tracing::info!("building fresh image {}", spec.tag);
                self.ensure_base_image()?;
                self.build_or_fail(spec, false)?
            }
        };

        self.cancel.check()?;
        start.start(self, &image)?;
        Ok(RunOutcome::Started(image))
    }

    fn build_or_fail(&self, spec: &ImageSpec, no_cache: bool) -> Result<ImageRef> {
        if let BuildStatus::Failed(reason) = self.build_image(spec, no_cache)? {
            return Err(LabError::ContainerLifecycle(format!(
                "image {} failed to build: {}",
                spec.tag, reason
            ))
            .into());
        }
        self.engine.get_image(&spec.tag)?.ok_or_else(|| {
            LabError::ContainerLifecycle(format!("image {} missing after build", spec.tag))
                .into()
        })
    }

    /// Block until `id` reports healthy (or running without a health check).
    pub fn wait_for_healthy(&self, id: &str) -> Result<()> {
        let ready = self.health.poll(&self.cancel, |attempt| {
            match self.engine.health_status(id)? {
                HealthStatus::Healthy | HealthStatus::Running => Ok(Some(())),
                HealthStatus::Exited => Err(LabError::ContainerLifecycle(format!(
                    "container {} exited before becoming healthy",
                    id
                ))
                .into()),
                status => {
                    tracing::debug!("container {} is {:?} (attempt {})", id, status, attempt);
                    Ok(None)
                }
            }
        })?;
        ready.ok_or_else(|| {
            LabError::ContainerLifecycle(format!(
                "container {} not healthy after {} attempts",
                id, self.health.attempts
            ))
            .into()
        })
    }
}

/// A started container that is released exactly once.
///
/// Call [`ContainerSession::teardown`] on the normal path; dropping an
/// un-torn-down session releases the container and logs any failure.
/// Sessions from [`ContainerSession::disposable`] remove the container
/// instead of stopping it.
pub struct ContainerSession<'a> {
    engine: &'a dyn ContainerEngine,
    id: String,
    remove: bool,
    stopped: bool,
}

impl<'a> ContainerSession<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, id: String) -> Self {
        Self {
            engine,
            id,
            remove: false,
            stopped: false,
        }
    }

    /// One-shot container that leaves nothing behind.
    pub fn disposable(engine: &'a dyn ContainerEngine, id: String) -> Self {
        Self {
            engine,
            id,
            remove: true,
            stopped: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn teardown(mut self) -> Result<()> {
        self.stopped = true;
        self.release()
    }

    fn release(&self) -> Result<()> {
        if self.remove {
            tracing::debug!("removing container {}", self.id);
            self.engine.remove(&self.id)
        } else {
            tracing::debug!("stopping container {}", self.id);
            self.engine.stop(&self.id)
        }
    }
}

impl Drop for ContainerSession<'_> {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(e) = self.release() {
            tracing::warn!("failed to release container {}: {:#}", self.id, e);
        }
    }
}
