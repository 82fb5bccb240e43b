//! Root filesystem build or reuse (stage 4).

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::sections::{GeneralConfig, RootfsConfig};
use crate::docker::{
    ContainerSession, ContainerStart, ImageRef, ImageRunner, ImageSpec, RunOutcome, RunSpec, Volume,
};
use crate::error::LabError;
use crate::reuse::{Prompt, ReuseFlags, ReusePolicy};

/// What stage 4 does with the rootfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootfsDecision {
    /// Update mode: rebuild the builder image only.
    UpdateImage,
    Build,
    Reuse,
}

pub struct RootfsBuilder<'a> {
    cfg: &'a RootfsConfig,
    general: &'a GeneralConfig,
    project_dir: PathBuf,
    /// Forced-partial run starting at this stage.
    partial: bool,
    verbose: bool,
}

impl<'a> RootfsBuilder<'a> {
    pub fn new(
        cfg: &'a RootfsConfig,
        general: &'a GeneralConfig,
        project_dir: &Path,
        partial: bool,
        verbose: bool,
    ) -> Self {
        Self {
            cfg,
            general,
            project_dir: project_dir.to_path_buf(),
            partial,
            verbose,
        }
    }

    pub fn file_name(&self) -> String {
        self.cfg.file_name(self.general.arch)
    }

    /// Host directory mounted into the builder container.
    pub fn host_dir(&self) -> PathBuf {
        self.project_dir.join(&self.cfg.rootfs_dir)
    }

    pub fn host_path(&self) -> PathBuf {
        self.host_dir().join(self.file_name())
    }

    pub fn exists(&self) -> bool {
        let path = self.host_path();
        tracing::debug!("checking for existing rootfs {}", path.display());
        path.exists()
    }

    pub fn decide(&self, flags: ReuseFlags, prompt: &dyn Prompt) -> Result<RootfsDecision> {
        if flags.update {
            return Ok(RootfsDecision::UpdateImage);
        }
        if self.partial || !self.exists() {
            return Ok(RootfsDecision::Build);
        }
        let path = self.host_path();
        let policy = ReusePolicy::resolve(flags, self.cfg.image.force_rebuild);
        if policy.keep(&path.display().to_string(), prompt, || true)? {
            tracing::info!("re-using {} for file system", path.display());
            return Ok(RootfsDecision::Reuse);
        }
        tracing::info!("rebuilding {}", path.display());
        Ok(RootfsDecision::Build)
    }

    /// Shell command run inside the builder container.
    pub fn command(&self) -> String {
        let mut command = format!(
            "{}; . /home/{}/rootfs.sh -n {} -a {} -d {} -p {} -u {}",
            if self.verbose { "set -eux" } else { "set -e" },
            self.general.user,
            self.file_name(),
            self.general.arch.qemu_arch(),
            self.cfg.distribution,
            self.cfg.packages,
            self.general.user
        );
        if let Some(hostname) = &self.cfg.hostname {
            command.push_str(&format!(" -h {}", hostname.trim()));
        }
        command
    }

    pub fn image_spec(&self, build_args: std::collections::BTreeMap<String, String>) -> ImageSpec {
        ImageSpec {
            tag: self.cfg.image.tag.clone(),
            dockerfile: self.cfg.image.dockerfile.clone(),
            build_args,
            force_rebuild: self.cfg.image.force_rebuild,
        }
    }

    /// Run stage 4 and return the rootfs path on the host.
    pub fn run(&mut self, runner: &ImageRunner<'_>, spec: &ImageSpec, prompt: &dyn Prompt) -> Result<PathBuf> {
        match self.decide(runner.flags(), prompt)? {
            RootfsDecision::Reuse => {}
            RootfsDecision::UpdateImage | RootfsDecision::Build => {
                if let RunOutcome::Updated = runner.run(spec, false, self)? {
                    tracing::info!("rootfs builder image updated");
                }
            }
        }
        Ok(self.host_path())
    }
}

impl ContainerStart for RootfsBuilder<'_> {
    fn start(&mut self, runner: &ImageRunner<'_>, image: &ImageRef) -> Result<()> {
        tracing::info!("building rootfs {}", self.file_name());
        let spec = RunSpec {
            image: image.tag.clone(),
            volumes: vec![Volume::rw(self.host_dir(), self.general.docker_mnt.clone())],
            privileged: true,
            remove: false,
            command: vec!["/bin/bash".into(), "-c".into(), self.command()],
            ..RunSpec::default()
        };
        let engine = runner.engine();
        let session = ContainerSession::disposable(engine, engine.run_container(&spec)?);
        engine.follow_logs(session.id(), &mut |line: &str| tracing::info!("{}", line.trim()))?;
        let code = engine.wait(session.id())?;
        session.teardown()?;
        if code != 0 {
            return Err(LabError::Artifact(format!(
                "rootfs build exited with {} ({})",
                code,
                self.file_name()
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{Backoff, Cancellation};
    use crate::config::sections::{Arch, ImageConfig, ReuseMode};
    use crate::error::exit_code_for;
    use crate::docker::ContainerEngine;
    use crate::testing::{FakeEngine, ScriptedPrompt};
    use std::collections::BTreeMap;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn general() -> GeneralConfig {
        GeneralConfig {
            arch: Arch::X86_64,
            user: "user".into(),
            docker_mnt: "/io".into(),
            kernel_root: PathBuf::from("kernel_root"),
            ssh_dir: PathBuf::from(".ssh"),
            ssh_fwd_port: 2222,
            tag_base_image: "like_dbg_base".into(),
            dockerfile_base_image: PathBuf::from(".dockerfile_base"),
            reuse: ReuseMode::Interactive,
            health: Backoff::new(1, Duration::ZERO),
            ssh: Backoff::new(1, Duration::ZERO),
        }
    }

    fn rootfs(hostname: Option<&str>, force_rebuild: bool) -> RootfsConfig {
        RootfsConfig {
            image: ImageConfig {
                tag: "like_rootfs".into(),
                dockerfile: PathBuf::from(".dockerfile_rootfs"),
                force_rebuild,
            },
            rootfs_dir: PathBuf::from("io"),
            rootfs_base: "filesystem-".into(),
            rootfs_ftype: String::new(),
            distribution: "bullseye".into(),
            packages: "build-essential,vim".into(),
            hostname: hostname.map(str::to_string),
        }
    }

    fn image_runner<'a>(
        engine: &'a FakeEngine,
        prompt: &'a ScriptedPrompt,
        flags: ReuseFlags,
    ) -> ImageRunner<'a> {
        ImageRunner::new(
            engine,
            prompt,
            Cancellation::detached(),
            Path::new("/proj"),
            ImageSpec {
                tag: "like_dbg_base".into(),
                dockerfile: PathBuf::from(".dockerfile_base"),
                build_args: BTreeMap::new(),
                force_rebuild: false,
            },
            Backoff::new(1, Duration::ZERO),
            flags,
        )
    }

    #[test]
    fn command_with_hostname() {
        let (cfg, g) = (rootfs(Some(" lab "), false), general());
        let b = RootfsBuilder::new(&cfg, &g, Path::new("/proj"), false, false);
        assert_eq!(
            b.command(),
            "set -e; . /home/user/rootfs.sh -n filesystem-x86_64 -a x86_64 -d bullseye -p build-essential,vim -u user -h lab"
        );
    }

    #[test]
    fn verbose_command_without_hostname() {
        let (cfg, g) = (rootfs(None, false), general());
        let b = RootfsBuilder::new(&cfg, &g, Path::new("/proj"), false, true);
        assert_eq!(
            b.command(),
            "set -eux; . /home/user/rootfs.sh -n filesystem-x86_64 -a x86_64 -d bullseye -p build-essential,vim -u user"
        );
    }

    #[test]
    fn decisions_follow_precedence() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("io")).unwrap();
        let g = general();
        let plain = rootfs(None, false);
        let forced = rootfs(None, true);
        let none = ScriptedPrompt::new(&[]);
        let skip = ReuseFlags {
            skip_prompts: true,
            ..ReuseFlags::default()
        };
        let update = ReuseFlags {
            update: true,
            ..ReuseFlags::default()
        };

        let b = RootfsBuilder::new(&plain, &g, tmp.path(), false, false);
        assert_eq!(b.decide(skip, &none).unwrap(), RootfsDecision::Build);
        assert_eq!(b.decide(update, &none).unwrap(), RootfsDecision::UpdateImage);

        fs::write(b.host_path(), "img").unwrap();
        assert_eq!(b.decide(skip, &none).unwrap(), RootfsDecision::Reuse);
        let yes = ScriptedPrompt::new(&[true]);
        assert_eq!(b.decide(ReuseFlags::default(), &yes).unwrap(), RootfsDecision::Reuse);
        let no = ScriptedPrompt::new(&[false]);
        assert_eq!(b.decide(ReuseFlags::default(), &no).unwrap(), RootfsDecision::Build);

        let partial = RootfsBuilder::new(&plain, &g, tmp.path(), true, false);
        assert_eq!(partial.decide(skip, &none).unwrap(), RootfsDecision::Build);
        let f = RootfsBuilder::new(&forced, &g, tmp.path(), false, false);
        assert_eq!(f.decide(skip, &none).unwrap(), RootfsDecision::Build);
    }

    #[test]
    fn build_runs_privileged_container_with_io_mounted() {
        let tmp = TempDir::new().unwrap();
        let (cfg, g) = (rootfs(None, false), general());
        let engine = FakeEngine::default()
            .with_images(&["like_dbg_base", "like_rootfs"])
            .with_logs(&["debootstrap ok"]);
        let prompt = ScriptedPrompt::new(&[]);
        let runner = image_runner(&engine, &prompt, ReuseFlags::default());
        let mut b = RootfsBuilder::new(&cfg, &g, tmp.path(), false, false);
        let spec = b.image_spec(BTreeMap::new());

        let path = b.run(&runner, &spec, &prompt).unwrap();

        assert_eq!(path, tmp.path().join("io/filesystem-x86_64"));
        let runs = engine.runs();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].privileged);
        assert_eq!(runs[0].volumes, vec![Volume::rw(tmp.path().join("io"), "/io")]);
        assert_eq!(runs[0].command[0], "/bin/bash");
        assert!(engine.builds().is_empty());
        assert_eq!(engine.removed(), vec!["c1".to_string()]);
        assert!(engine.list_running().unwrap().is_empty());
    }

    #[test]
    fn failing_build_script_is_artifact_error() {
        let tmp = TempDir::new().unwrap();
        let (cfg, g) = (rootfs(None, false), general());
        let engine = FakeEngine::default()
            .with_images(&["like_dbg_base", "like_rootfs"])
            .with_exit_code(1);
        let prompt = ScriptedPrompt::new(&[]);
        let runner = image_runner(&engine, &prompt, ReuseFlags::default());
        let mut b = RootfsBuilder::new(&cfg, &g, tmp.path(), false, false);
        let spec = b.image_spec(BTreeMap::new());

        let err = b.run(&runner, &spec, &prompt).unwrap_err();
        assert_eq!(exit_code_for(&err), 3);
        assert_eq!(engine.removed(), vec!["c1".to_string()]);
    }

    #[test]
    fn auto_mode_reuses_without_prompting() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("io")).unwrap();
        let g = general();
        let auto = ReuseFlags {
            mode: ReuseMode::Auto,
            ..ReuseFlags::default()
        };
        let none = ScriptedPrompt::new(&[]);

        let plain = rootfs(None, false);
        let b = RootfsBuilder::new(&plain, &g, tmp.path(), false, false);
        fs::write(b.host_path(), "img").unwrap();
        assert_eq!(b.decide(auto, &none).unwrap(), RootfsDecision::Reuse);

        let forced = rootfs(None, true);
        let f = RootfsBuilder::new(&forced, &g, tmp.path(), false, false);
        assert_eq!(f.decide(auto, &none).unwrap(), RootfsDecision::Build);
        assert!(none.asked().is_empty());
    }
}
