//! GDB debugger container.
//!
//! The debugger image bakes in the custom GDB script, so a changed script
//! (tracked by hash in the history marker) forces an image rebuild. The new
//! hash is only recorded once the image went through, so a failed build is
//! retried on the next run.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::DockerRunLine;
use crate::artifact::history::{sha256_file, History};
use crate::config::sections::{DebuggerConfig, GeneralConfig};
use crate::docker::{ContainerStart, ImageRef, ImageRunner, ImageSpec, RunOutcome, Volume};
use crate::tmux::{Tmux, DEBUGGER_PANE};

pub struct Debugger<'a> {
    cfg: &'a DebuggerConfig,
    general: &'a GeneralConfig,
    tmux: &'a dyn Tmux,
    project_dir: PathBuf,
    history_path: PathBuf,
    ctf: bool,
    script_hash: Option<String>,
    gdb_script_changed: bool,
}

impl<'a> Debugger<'a> {
    /// Compares the current GDB script against the hash recorded in the
    /// history marker at `history_path`.
    pub fn new(
        cfg: &'a DebuggerConfig,
        general: &'a GeneralConfig,
        tmux: &'a dyn Tmux,
        project_dir: &Path,
        history_path: &Path,
        ctf: bool,
    ) -> Result<Self> {
        let script_hash = match &cfg.gdb_script {
            Some(script) => hash_gdb_script(&project_dir.join(script))?,
            None => None,
        };
        let gdb_script_changed = match &script_hash {
            Some(hash) => History::load(history_path)?.gdb_script_changed(hash),
            None => false,
        };
        if gdb_script_changed {
            tracing::info!("gdb script changed, rebuilding the debugger image");
        }
        Ok(Self {
            cfg,
            general,
            tmux,
            project_dir: project_dir.to_path_buf(),
            history_path: history_path.to_path_buf(),
            ctf,
            script_hash,
            gdb_script_changed,
        })
    }

    pub fn image_spec(&self, build_args: BTreeMap<String, String>) -> ImageSpec {
        ImageSpec {
            tag: self.cfg.image.tag.clone(),
            dockerfile: self.cfg.image.dockerfile.clone(),
            build_args,
            force_rebuild: self.cfg.image.force_rebuild || self.gdb_script_changed,
        }
    }

    pub fn launch_line(&self, image: &str) -> String {
        let user = &self.general.user;
        let mnt = &self.general.docker_mnt;
        let entrypoint = format!(
            "/bin/bash -c \"set -e; . /home/{}/debugger.sh -a {} -p {} -c {} -g /home/{}/gdb_script\"",
            user,
            self.general.arch.as_str(),
            mnt,
            u8::from(self.ctf),
            user
        );
        DockerRunLine::new()
            .option("--security-opt seccomp=unconfined")
            .option("--cap-add=SYS_PTRACE")
            .volume(Volume::rw(&self.project_dir, mnt.as_str()))
            .render(image, &entrypoint)
    }

    pub fn run(&mut self, runner: &ImageRunner<'_>, spec: &ImageSpec) -> Result<RunOutcome> {
        let outcome = runner.run(spec, true, self)?;
        self.record_gdb_script()?;
        Ok(outcome)
    }

    fn record_gdb_script(&self) -> Result<()> {
        let Some(hash) = &self.script_hash else {
            return Ok(());
        };
        let mut history = History::load(&self.history_path)?;
        history.update_gdb_script(hash);
        history.save(&self.history_path)
    }
}

impl ContainerStart for Debugger<'_> {
    fn start(&mut self, _runner: &ImageRunner<'_>, image: &ImageRef) -> Result<()> {
        tracing::info!("starting debugger");
        let line = self.launch_line(&image.tag);
        tracing::debug!("debugger: {}", line);
        self.tmux.select_pane(DEBUGGER_PANE)?;
        self.tmux.send_line(&line)
    }
}

fn hash_gdb_script(script: &Path) -> Result<Option<String>> {
    if !script.is_file() {
        tracing::debug!("no gdb script at {}", script.display());
        return Ok(None);
    }
    sha256_file(script).map(Some)
}
