//! Staged pipeline controller.
//!
//! Stages run in order, each handing a [`StageResult`] to the next:
//!
//! ```text
//! download -> unpack -> build-kernel -> rootfs -> debug
//! ```
//!
//! `--partial <stage>` starts at `stage` with a synthetic result standing in
//! for the skipped ones, `--dry-run <stage>` stops after `stage`. Update mode
//! and CTF mode bypass the stage sequence entirely.

pub mod result;

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::artifact::download::{Fetch, KernelDownloader};
use crate::artifact::history::HISTORY_FILE;
use crate::artifact::rootfs::RootfsBuilder;
use crate::artifact::unpack::KernelUnpacker;
use crate::build::KernelBuilder;
use crate::cancel::Cancellation;
use crate::config::sections::LabConfig;
use crate::docker::{lab_build_args, ContainerEngine, ImageRunner, ImageSpec};
use crate::error::{is_interrupted, LabError};
use crate::remote::{ensure_ssh_keys, RemoteShell};
use crate::reuse::{Prompt, ReuseFlags, ReusePolicy};
use crate::session::{BootTarget, CtfInputs, Debuggee, Debugger};
use crate::tmux::{Tmux, OPERATOR_PANE};

pub use result::{StageResult, UnpackStatus, STAGE_RESULT_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Download,
    Unpack,
    BuildKernel,
    Rootfs,
    Debug,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Download,
        Stage::Unpack,
        Stage::BuildKernel,
        Stage::Rootfs,
        Stage::Debug,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Unpack => "unpack",
            Stage::BuildKernel => "build-kernel",
            Stage::Rootfs => "rootfs",
            Stage::Debug => "debug",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s.trim())
            .ok_or_else(|| {
                format!(
                    "unknown stage '{}' (expected one of: {})",
                    s,
                    Stage::ALL.map(Stage::as_str).join(", ")
                )
            })
    }
}

/// Command line switches shaping one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: Option<Stage>,
    pub partial: Option<Stage>,
    pub ctf: Option<CtfInputs>,
    pub update: bool,
    pub skip_prompts: bool,
    pub verbose: bool,
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if let (Some(dry), Some(partial)) = (self.dry_run, self.partial) {
            if dry < partial {
                return Err(LabError::Configuration(format!(
                    "--dry-run {} stops before --partial {} starts",
                    dry, partial
                ))
                .into());
            }
        }
        if self.ctf.is_some() && (self.partial.is_some() || self.dry_run.is_some()) {
            return Err(LabError::Configuration(
                "--ctf cannot be combined with --partial or --dry-run".into(),
            )
            .into());
        }
        Ok(())
    }

    /// Whether this run ends up driving tmux panes.
    pub fn needs_tmux(&self) -> bool {
        if self.update {
            return false;
        }
        self.ctf.is_some() || self.dry_run.map_or(true, |stage| stage == Stage::Debug)
    }
}

/// External collaborators, injected so tests can swap them out.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub engine: &'a dyn ContainerEngine,
    pub prompt: &'a dyn Prompt,
    pub fetch: &'a dyn Fetch,
    pub tmux: &'a dyn Tmux,
    pub shell: &'a dyn RemoteShell,
    pub cancel: Cancellation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// All stages ran, the debug session is up.
    Completed(StageResult),
    /// `--dry-run` stopped the run after this stage.
    StoppedAfter(Stage, StageResult),
    ContainersUpdated,
    CtfSessionStarted,
}

pub struct Pipeline<'a> {
    cfg: &'a LabConfig,
    project_dir: PathBuf,
    opts: RunOptions,
    svc: Services<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(cfg: &'a LabConfig, project_dir: &Path, opts: RunOptions, svc: Services<'a>) -> Self {
        Self {
            cfg,
            project_dir: project_dir.to_path_buf(),
            opts,
            svc,
        }
    }

    /// Run the selected mode.
    ///
    /// A failure that happens while the interrupt flag is set is reported as
    /// [`LabError::Interrupted`]: the signal also reaches foreground children
    /// (ssh, docker, curl), which then exit non-zero on their own.
    pub fn run(&self) -> Result<PipelineOutcome> {
        self.run_mode().map_err(|e| {
            if self.svc.cancel.is_cancelled() && !is_interrupted(&e) {
                e.context(LabError::Interrupted)
            } else {
                e
            }
        })
    }

    fn run_mode(&self) -> Result<PipelineOutcome> {
        self.opts.validate()?;
        if self.opts.update {
            self.update_images()?;
            return Ok(PipelineOutcome::ContainersUpdated);
        }
        if let Some(inputs) = &self.opts.ctf {
            self.run_ctf(inputs)?;
            return Ok(PipelineOutcome::CtfSessionStarted);
        }
        self.run_stages()
    }

    fn run_stages(&self) -> Result<PipelineOutcome> {
        let start = self.opts.partial.unwrap_or(Stage::Download);
        let kernel_root = self.kernel_root();
        let mut result = if start > Stage::Download {
            tracing::info!("partial run starting at {}", start);
            let mut result = StageResult::synthetic(start, kernel_root);
            if start > Stage::BuildKernel {
                result.kernel_image = Some(self.kernel_image());
            }
            if start > Stage::Rootfs {
                result.rootfs = Some(self.rootfs_builder(false).host_path());
            }
            result
        } else {
            StageResult::new(kernel_root)
        };

        for stage in Stage::ALL.into_iter().filter(|stage| *stage >= start) {
            self.svc.cancel.check()?;
            tracing::info!("stage: {}", stage);
            self.run_stage(stage, &mut result)?;
            result.validate(stage)?;
            if self.opts.dry_run == Some(stage) {
                tracing::info!("dry run, stopping after {}", stage);
                return Ok(PipelineOutcome::StoppedAfter(stage, result));
            }
        }
        Ok(PipelineOutcome::Completed(result))
    }

    fn run_stage(&self, stage: Stage, result: &mut StageResult) -> Result<()> {
        match stage {
            Stage::Download => {
                result.archive = Some(self.downloader()?.run(self.svc.fetch)?);
            }
            Stage::Unpack => self.unpack(result)?,
            Stage::BuildKernel => self.build_kernel(result)?,
            Stage::Rootfs => {
                let partial = self.opts.partial == Some(Stage::Rootfs);
                let mut builder = self.rootfs_builder(partial);
                let spec = builder.image_spec(self.build_args());
                let runner = self.runner(self.flags());
                result.rootfs = Some(builder.run(&runner, &spec, self.svc.prompt)?);
            }
            Stage::Debug => self.debug_session()?,
        }
        Ok(())
    }

    fn unpack(&self, result: &mut StageResult) -> Result<()> {
        let archive = match &result.archive {
            Some(archive) => archive.clone(),
            None => self.downloader()?.archive,
        };
        let policy = ReusePolicy::resolve(self.flags(), false);
        let outcome = KernelUnpacker::new(
            &result.kernel_root,
            &archive,
            &self.history_path(),
            policy,
            self.svc.prompt,
        )
        .run()?;
        if let Some(error) = &outcome.error {
            tracing::error!("unpacking failed: {}", error);
        }
        result.archive = Some(archive);
        result.status = outcome.status;
        result.assume_dirty = outcome.assume_dirty;
        Ok(())
    }

    fn build_kernel(&self, result: &mut StageResult) -> Result<()> {
        if result.status != UnpackStatus::Unpack {
            tracing::info!("re-using the existing kernel build");
            result.kernel_image = Some(self.kernel_image());
            return Ok(());
        }
        ensure_ssh_keys(&self.project_dir.join(&self.cfg.general.ssh_dir))?;
        let runner = self.runner(self.flags());
        KernelBuilder::new(
            &self.cfg.kernel_builder,
            &self.cfg.general,
            self.svc.shell,
            &self.project_dir,
            result.assume_dirty,
        )
        .run(&runner)?;
        result.kernel_image = Some(self.kernel_image());
        Ok(())
    }

    fn debug_session(&self) -> Result<()> {
        let target = BootTarget::lab(&self.cfg.general, &self.cfg.rootfs, &self.project_dir);
        if !target.host_kernel.exists() {
            return Err(LabError::Artifact(format!(
                "no kernel image at {}",
                target.host_kernel.display()
            ))
            .into());
        }
        self.svc.tmux.setup_layout()?;
        self.start_session(target, false)
    }

    fn run_ctf(&self, inputs: &CtfInputs) -> Result<()> {
        tracing::info!("CTF mode, skipping kernel and rootfs stages");
        let dbg = &self.cfg.debugger;
        inputs.extract_vmlinux(
            &self.project_dir.join(&dbg.extract_vmlinux),
            &self.project_dir.join(&dbg.ctf_dir),
        )?;
        self.svc.tmux.setup_layout()?;
        self.start_session(BootTarget::ctf(inputs), true)
    }

    fn start_session(&self, target: BootTarget, ctf: bool) -> Result<()> {
        let tmux = self.svc.tmux;
        let runner = self.runner(self.flags());

        let mut debuggee = Debuggee::new(&self.cfg.debuggee, &self.cfg.general, tmux, target);
        let spec = debuggee.image_spec(self.build_args());
        debuggee.run(&runner, &spec)?;
        tmux.select_pane(OPERATOR_PANE)?;

        let mut debugger = Debugger::new(
            &self.cfg.debugger,
            &self.cfg.general,
            tmux,
            &self.project_dir,
            &self.history_path(),
            ctf,
        )?;
        let spec = debugger.image_spec(self.build_args());
        debugger.run(&runner, &spec)?;
        tmux.select_pane(OPERATOR_PANE)?;
        tmux.send_line("tmux source-file .tmux.conf")
    }

    /// Rebuild every component image without cache; nothing is started.
    fn update_images(&self) -> Result<()> {
        tracing::info!("updating all container images");
        let runner = self.runner(ReuseFlags {
            update: true,
            ..self.flags()
        });
        let general = &self.cfg.general;

        runner.rebuild_base_image()?;
        ensure_ssh_keys(&self.project_dir.join(&general.ssh_dir))?;
        KernelBuilder::new(
            &self.cfg.kernel_builder,
            general,
            self.svc.shell,
            &self.project_dir,
            false,
        )
        .run(&runner)?;

        let mut rootfs = self.rootfs_builder(false);
        let spec = rootfs.image_spec(self.build_args());
        rootfs.run(&runner, &spec, self.svc.prompt)?;

        let target = BootTarget::lab(general, &self.cfg.rootfs, &self.project_dir);
        let mut debuggee = Debuggee::new(&self.cfg.debuggee, general, self.svc.tmux, target);
        let spec = debuggee.image_spec(self.build_args());
        debuggee.run(&runner, &spec)?;

        let mut debugger = Debugger::new(
            &self.cfg.debugger,
            general,
            self.svc.tmux,
            &self.project_dir,
            &self.history_path(),
            false,
        )?;
        let spec = debugger.image_spec(self.build_args());
        debugger.run(&runner, &spec)?;
        Ok(())
    }

    fn flags(&self) -> ReuseFlags {
        ReuseFlags {
            update: false,
            skip_prompts: self.opts.skip_prompts,
            mode: self.cfg.general.reuse,
        }
    }

    fn build_args(&self) -> BTreeMap<String, String> {
        lab_build_args(
            self.cfg.general.arch,
            &self.cfg.general.user,
            self.cfg.kernel_builder.compiler.as_deref(),
        )
    }

    fn runner(&self, flags: ReuseFlags) -> ImageRunner<'a> {
        let general = &self.cfg.general;
        let base = ImageSpec {
            tag: general.tag_base_image.clone(),
            dockerfile: general.dockerfile_base_image.clone(),
            build_args: self.build_args(),
            force_rebuild: false,
        };
        ImageRunner::new(
            self.svc.engine,
            self.svc.prompt,
            self.svc.cancel,
            &self.project_dir,
            base,
            general.health,
            flags,
        )
    }

    fn downloader(&self) -> Result<KernelDownloader> {
        let mut dl = self.cfg.kernel_dl.clone();
        dl.kernel_dl_path = self.project_dir.join(&dl.kernel_dl_path);
        KernelDownloader::resolve(&dl, self.svc.fetch)
    }

    fn rootfs_builder(&self, partial: bool) -> RootfsBuilder<'a> {
        RootfsBuilder::new(
            &self.cfg.rootfs,
            &self.cfg.general,
            &self.project_dir,
            partial,
            self.opts.verbose,
        )
    }

    fn kernel_root(&self) -> PathBuf {
        self.project_dir.join(&self.cfg.general.kernel_root)
    }

    fn kernel_image(&self) -> PathBuf {
        self.kernel_root()
            .join("arch")
            .join(self.cfg.general.arch.kernel_arch())
            .join("boot")
            .join("Image")
    }

    fn history_path(&self) -> PathBuf {
        self.project_dir.join(HISTORY_FILE)
    }
}
