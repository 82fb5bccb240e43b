//! Kernel build inside the builder container (stage 3).
//!
//! The builder container mounts the project directory, exposes sshd on
//! `ssh_fwd_port` and every build step is run over SSH from the kernel tree:
//!
//! 1. `make clean` when the tree is dirty
//! 2. supplied `.config`, or mrproper + patches + defconfig (+ kvm guest)
//! 3. `./scripts/config` with the mode's option set
//! 4. `make all` and `make modules`
//!
//! The container is stopped afterwards whatever the outcome.

use anyhow::Result;
use std::path::{Path, PathBuf};

use super::modules::add_modules;
use crate::cancel::Cancellation;
use crate::config::sections::{Arch, GeneralConfig, KernelBuilderConfig, KernelConfigMode};
use crate::docker::{
    kernel_builder_tag, lab_build_args, ContainerSession, ContainerStart, ImageRef, ImageRunner,
    ImageSpec, RunOutcome, RunSpec, Volume,
};
use crate::remote::executor::needs_sudo;
use crate::remote::{connect_with_retry, RemoteExecutor, RemoteShell};

/// LTO variants are still experimental with clang; pin it off.
const LLVM_LTO_ARGS: &str = "-e LTO_NONE -d LTO_CLANG_FULL -d LTO_CLANG_THIN";

/// Where the directory of a supplied `.config` is mounted.
const CONFIG_MOUNT: &str = "/tmp";

pub struct KernelBuilder<'a> {
    cfg: &'a KernelBuilderConfig,
    general: &'a GeneralConfig,
    shell: &'a dyn RemoteShell,
    project_dir: PathBuf,
    assume_dirty: bool,
    sudo: bool,
}

impl<'a> KernelBuilder<'a> {
    pub fn new(
        cfg: &'a KernelBuilderConfig,
        general: &'a GeneralConfig,
        shell: &'a dyn RemoteShell,
        project_dir: &Path,
        assume_dirty: bool,
    ) -> Self {
        Self {
            cfg,
            general,
            shell,
            project_dir: project_dir.to_path_buf(),
            assume_dirty,
            sudo: needs_sudo(cfg.require_root),
        }
    }

    pub fn image_spec(&self) -> ImageSpec {
        ImageSpec {
            tag: kernel_builder_tag(self.cfg, self.general.arch),
            dockerfile: self.cfg.image.dockerfile.clone(),
            build_args: lab_build_args(
                self.general.arch,
                &self.general.user,
                self.cfg.compiler.as_deref(),
            ),
            force_rebuild: self.cfg.image.force_rebuild,
        }
    }

    /// Kernel tree as seen inside the container.
    pub fn remote_workdir(&self) -> String {
        format!(
            "{}/{}",
            self.general.docker_mnt.trim_end_matches('/'),
            self.general.kernel_root.display()
        )
    }

    /// Run stage 3 through the shared image flow.
    pub fn run(&mut self, runner: &ImageRunner<'_>) -> Result<RunOutcome> {
        let spec = self.image_spec();
        runner.run(&spec, true, self)
    }

    fn cc(&self) -> String {
        match &self.cfg.compiler {
            Some(cc) => format!("CC={} ", cc),
            None => String::new(),
        }
    }

    fn llvm(&self) -> &'static str {
        if self.cfg.uses_llvm() {
            "LLVM=1 "
        } else {
            ""
        }
    }

    fn arch(&self) -> &'static str {
        self.general.arch.kernel_arch()
    }

    /// Arguments passed to `./scripts/config`.
    pub fn config_params(&self) -> String {
        let mut params = String::new();
        if self.cfg.uses_llvm() {
            params.push_str(LLVM_LTO_ARGS);
            params.push(' ');
        }
        params.push_str(&self.cfg.mode.config_args());
        if let Some(extra) = &self.cfg.extra_args {
            params = apply_extra_args(&params, extra);
        }
        params.trim().to_string()
    }

    /// Remote command sequence for this build.
    pub fn steps(&self) -> Vec<String> {
        let (cc, llvm, arch) = (self.cc(), self.llvm(), self.arch());
        let mut steps = Vec::new();
        if self.assume_dirty {
            steps.push("make clean".to_string());
        }
        match &self.cfg.mode {
            KernelConfigMode::Config { path } => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| ".config".to_string());
                steps.push(format!("cp {}/{} .config", CONFIG_MOUNT, name));
            }
            _ => {
                steps.push(format!("{}ARCH={} make mrproper", cc, arch));
                // Patches slot in here; see `build_steps`.
                if self.general.arch == Arch::X86_64 {
                    steps.push(format!("{}{}make {}_defconfig", cc, llvm, arch));
                } else {
                    steps.push(format!("{}{}ARCH={} make defconfig", cc, llvm, arch));
                }
                if self.cfg.kvm {
                    steps.push(format!("{}{}ARCH={} make kvm_guest.config", cc, llvm, arch));
                }
            }
        }
        let params = self.config_params();
        if !params.is_empty() {
            steps.push(format!("./scripts/config {}", params));
        }
        steps.push(format!("{}ARCH={} {}make -j$(nproc) all", cc, arch, llvm));
        steps.push(format!("{}ARCH={} {}make -j$(nproc) modules", cc, arch, llvm));
        steps
    }

    /// Run every build step in `exec`. Patches are applied right after
    /// `make mrproper`; any other failure stops the build.
    fn build_steps(&self, exec: &RemoteExecutor<'_>, cancel: &Cancellation) -> Result<()> {
        for step in self.steps() {
            cancel.check()?;
            exec.run_remote(&step, false)?;
            if step.ends_with("make mrproper") {
                self.apply_patches(exec)?;
            }
        }
        tracing::info!("successfully built the kernel");

        if self.general.arch == Arch::X86_64 {
            exec.in_dir(format!("{}/arch/{}/boot", exec.workdir(), self.arch()))
                .run_remote("ln -sf bzImage Image", false)?;
        }
        Ok(())
    }

    fn apply_patches(&self, exec: &RemoteExecutor<'_>) -> Result<()> {
        let Some(patch_dir) = &self.cfg.patch_dir else {
            return Ok(());
        };
        let remote_dir = format!(
            "{}/{}",
            self.general.docker_mnt.trim_end_matches('/'),
            patch_dir.display()
        );
        let report = exec.apply_patches(&self.project_dir.join(patch_dir), &remote_dir)?;
        if !report.is_clean() {
            tracing::warn!(
                "{} of {} patches failed to apply: {}",
                report.failed.len(),
                report.failed.len() + report.applied.len(),
                report.failed.join(", ")
            );
        }
        Ok(())
    }

    fn run_spec(&self, image: &ImageRef) -> RunSpec {
        let mut volumes = vec![Volume::rw(&self.project_dir, self.general.docker_mnt.as_str())];
        if let KernelConfigMode::Config { path } = &self.cfg.mode {
            let config = self.project_dir.join(path);
            if let Some(dir) = config.parent() {
                volumes.push(Volume::rw(dir, CONFIG_MOUNT));
            }
        }
        RunSpec {
            image: image.tag.clone(),
            volumes,
            ports: vec![(self.general.ssh_fwd_port, 22)],
            tty: true,
            ..RunSpec::default()
        }
    }

    fn build_in(&self, runner: &ImageRunner<'_>, id: &str) -> Result<()> {
        runner.wait_for_healthy(id)?;
        let cancel = runner.cancel();
        connect_with_retry(self.shell, self.general.ssh, &cancel)?;
        let exec = RemoteExecutor::new(self.shell, self.remote_workdir(), self.sudo);
        self.build_steps(&exec, &cancel)
    }
}

impl ContainerStart for KernelBuilder<'_> {
    fn start(&mut self, runner: &ImageRunner<'_>, image: &ImageRef) -> Result<()> {
        tracing::info!("building kernel, this may take a while");
        if let Some(modules) = &self.cfg.custom_modules {
            let kernel_root = self.project_dir.join(&self.general.kernel_root);
            let names = add_modules(&self.project_dir.join(modules), &kernel_root)?;
            tracing::info!("hooked custom modules: {}", names.join(", "));
        }

        let engine = runner.engine();
        let session = ContainerSession::new(engine, engine.run_container(&self.run_spec(image))?);
        let built = self.build_in(runner, session.id());
        if let Err(e) = session.teardown() {
            tracing::warn!("failed to stop kernel builder container: {:#}", e);
        }
        built
    }
}

/// Apply `extra_args` (`-e OPT`/`-d OPT` pairs) over `params`.
///
/// A pair whose option already appears in `params` replaces that entry;
/// any other pair is appended.
pub fn apply_extra_args(params: &str, extra: &str) -> String {
    let mut tokens: Vec<String> = params.split_whitespace().map(str::to_string).collect();
    let extra: Vec<&str> = extra.split_whitespace().collect();
    if extra.len() % 2 != 0 {
        tracing::warn!("ignoring trailing extra_args entry '{}'", extra[extra.len() - 1]);
    }
    for pair in extra.chunks_exact(2) {
        let (flag, opt) = (pair[0], pair[1]);
        let existing = tokens
            .windows(2)
            .position(|w| (w[0] == "-e" || w[0] == "-d") && w[1] == opt);
        match existing {
            Some(idx) => tokens[idx] = flag.to_string(),
            None => {
                tokens.push(flag.to_string());
                tokens.push(opt.to_string());
            }
        }
    }
    let params = tokens.join(" ");
    tracing::debug!("kernel config params: {}", params);
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Backoff;
    use crate::config::sections::{ImageConfig, ReuseMode};
    use crate::error::exit_code_for;
    use crate::reuse::ReuseFlags;
    use crate::testing::{FakeEngine, FakeShell, ScriptedPrompt};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn general(arch: Arch) -> GeneralConfig {
        GeneralConfig {
            arch,
            user: "user".into(),
            docker_mnt: "/io".into(),
            kernel_root: PathBuf::from("kernel_root"),
            ssh_dir: PathBuf::from(".ssh"),
            ssh_fwd_port: 2222,
            tag_base_image: "like_dbg_base".into(),
            dockerfile_base_image: PathBuf::from(".dockerfile_base"),
            reuse: ReuseMode::Interactive,
            health: Backoff::new(2, Duration::ZERO),
            ssh: Backoff::new(2, Duration::ZERO),
        }
    }

    fn builder_cfg(mode: KernelConfigMode, compiler: Option<&str>) -> KernelBuilderConfig {
        KernelBuilderConfig {
            image: ImageConfig {
                tag: "like_kbuilder".into(),
                dockerfile: PathBuf::from(".dockerfile_kbuilder"),
                force_rebuild: false,
            },
            compiler: compiler.map(str::to_string),
            mode,
            extra_args: None,
            patch_dir: None,
            custom_modules: None,
            kvm: false,
            require_root: false,
        }
    }

    fn custom() -> KernelConfigMode {
        KernelConfigMode::Custom {
            enable: vec!["FOO".into(), "BAR".into()],
            disable: vec!["BAZ".into(), "QUX".into()],
        }
    }

    fn runner<'a>(engine: &'a FakeEngine, prompt: &'a ScriptedPrompt) -> ImageRunner<'a> {
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
            Backoff::new(2, Duration::ZERO),
            ReuseFlags {
                skip_prompts: true,
                ..ReuseFlags::default()
            },
        )
    }

    #[test]
    fn extra_args_override_and_append() {
        assert_eq!(
            apply_extra_args("-e FOO -e BAR -d BAZ", "-d FOO -e NEW"),
            "-d FOO -e BAR -d BAZ -e NEW"
        );
        assert_eq!(apply_extra_args("", "-e KASAN"), "-e KASAN");
    }

    #[test]
    fn llvm_params_pin_lto_off() {
        let cfg = builder_cfg(custom(), None);
        let g = general(Arch::X86_64);
        let shell = FakeShell::default();
        let b = KernelBuilder::new(&cfg, &g, &shell, Path::new("/proj"), false);
        assert_eq!(
            b.config_params(),
            "-e LTO_NONE -d LTO_CLANG_FULL -d LTO_CLANG_THIN -e FOO -e BAR -d BAZ -d QUX"
        );
    }

    #[test]
    fn gcc_params_without_lto() {
        let mut cfg = builder_cfg(custom(), Some("gcc"));
        cfg.extra_args = Some("-e BAZ".into());
        let g = general(Arch::X86_64);
        let shell = FakeShell::default();
        let b = KernelBuilder::new(&cfg, &g, &shell, Path::new("/proj"), false);
        assert_eq!(b.config_params(), "-e FOO -e BAR -e BAZ -d QUX");
    }

    #[test]
    fn dirty_arm64_steps() {
        let mut cfg = builder_cfg(
            KernelConfigMode::Generic {
                args: "-e DEBUG_INFO".into(),
            },
            Some("gcc"),
        );
        cfg.kvm = true;
        let g = general(Arch::Arm64);
        let shell = FakeShell::default();
        let b = KernelBuilder::new(&cfg, &g, &shell, Path::new("/proj"), true);
        assert_eq!(
            b.steps(),
            vec![
                "make clean",
                "CC=gcc ARCH=arm64 make mrproper",
                "CC=gcc ARCH=arm64 make defconfig",
                "CC=gcc ARCH=arm64 make kvm_guest.config",
                "./scripts/config -e DEBUG_INFO",
                "CC=gcc ARCH=arm64 make -j$(nproc) all",
                "CC=gcc ARCH=arm64 make -j$(nproc) modules",
            ]
        );
    }

    #[test]
    fn config_mode_copies_supplied_config() {
        let cfg = builder_cfg(
            KernelConfigMode::Config {
                path: PathBuf::from("configs/my.config"),
            },
            None,
        );
        let g = general(Arch::X86_64);
        let shell = FakeShell::default();
        let b = KernelBuilder::new(&cfg, &g, &shell, Path::new("/proj"), false);
        let steps = b.steps();
        assert_eq!(steps[0], "cp /tmp/my.config .config");
        assert!(!steps.iter().any(|s| s.contains("mrproper")));

        let spec = b.run_spec(&ImageRef {
            id: "sha256:x".into(),
            tag: "like_kbuilder_x86_64".into(),
        });
        assert_eq!(
            spec.volumes,
            vec![
                Volume::rw("/proj", "/io"),
                Volume::rw("/proj/configs", "/tmp")
            ]
        );
        assert_eq!(spec.ports, vec![(2222, 22)]);
    }

    #[test]
    fn full_build_runs_in_kernel_tree_and_stops_container() {
        let cfg = builder_cfg(custom(), None);
        let g = general(Arch::X86_64);
        let shell = FakeShell::default();
        let engine = FakeEngine::default().with_images(&["like_dbg_base", "like_kbuilder_x86_64"]);
        let prompt = ScriptedPrompt::new(&[]);
        let r = runner(&engine, &prompt);
        let mut b = KernelBuilder::new(&cfg, &g, &shell, Path::new("/proj"), false);

        b.run(&r).unwrap();

        let commands = shell.commands();
        assert_eq!(commands[0], "cd /io/kernel_root && ARCH=x86_64 make mrproper");
        assert_eq!(commands[1], "cd /io/kernel_root && LLVM=1 make x86_64_defconfig");
        assert_eq!(
            commands.last().unwrap(),
            "cd /io/kernel_root/arch/x86_64/boot && ln -sf bzImage Image"
        );
        assert_eq!(engine.stopped(), vec!["c1".to_string()]);
    }

    #[test]
    fn failing_make_is_fatal_and_still_stops_container() {
        let cfg = builder_cfg(custom(), None);
        let g = general(Arch::X86_64);
        let shell = FakeShell::default().failing("make -j$(nproc) all", 2);
        let engine = FakeEngine::default().with_images(&["like_dbg_base", "like_kbuilder_x86_64"]);
        let prompt = ScriptedPrompt::new(&[]);
        let r = runner(&engine, &prompt);
        let mut b = KernelBuilder::new(&cfg, &g, &shell, Path::new("/proj"), false);

        let err = b.run(&r).unwrap_err();

        assert_eq!(exit_code_for(&err), 4);
        assert!(!shell.commands().iter().any(|c| c.contains("modules")));
        assert_eq!(engine.stopped(), vec!["c1".to_string()]);
    }

    #[test]
    fn unreachable_ssh_stops_container() {
        let cfg = builder_cfg(custom(), None);
        let g = general(Arch::X86_64);
        let shell = FakeShell::default().unreachable_for(10);
        let engine = FakeEngine::default().with_images(&["like_dbg_base", "like_kbuilder_x86_64"]);
        let prompt = ScriptedPrompt::new(&[]);
        let r = runner(&engine, &prompt);
        let mut b = KernelBuilder::new(&cfg, &g, &shell, Path::new("/proj"), false);

        let err = b.run(&r).unwrap_err();

        assert_eq!(exit_code_for(&err), 6);
        assert!(shell.commands().is_empty());
        assert_eq!(engine.stopped(), vec!["c1".to_string()]);
    }

    #[test]
    fn patches_follow_mrproper_and_failures_continue() {
        let tmp = tempfile::TempDir::new().unwrap();
        let patches = tmp.path().join("patches");
        std::fs::create_dir_all(&patches).unwrap();
        std::fs::write(patches.join("0001-a.patch"), "").unwrap();
        std::fs::write(patches.join("0002-b.patch"), "").unwrap();

        let mut cfg = builder_cfg(custom(), Some("gcc"));
        cfg.patch_dir = Some(PathBuf::from("patches"));
        let g = general(Arch::Arm64);
        let shell = FakeShell::default().failing("0001-a.patch", 1);
        let exec = RemoteExecutor::new(&shell, "/io/kernel_root", false);
        let b = KernelBuilder::new(&cfg, &g, &shell, tmp.path(), false);

        b.build_steps(&exec, &Cancellation::detached()).unwrap();

        let commands = shell.commands();
        assert!(commands[0].ends_with("make mrproper"));
        assert!(commands[1].contains("patch -p1 < /io/patches/0001-a.patch"));
        assert!(commands[2].contains("patch -p1 < /io/patches/0002-b.patch"));
        assert!(commands[3].ends_with("make defconfig"));
    }
}
