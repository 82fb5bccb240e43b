//! QEMU debuggee container.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

use super::{BootTarget, DockerRunLine};
use crate::config::sections::{Arch, DebuggeeConfig, GeneralConfig};
use crate::docker::{ContainerStart, ImageRef, ImageRunner, ImageSpec, RunOutcome};
use crate::error::LabError;
use crate::process::Cmd;
use crate::tmux::{Tmux, DEBUGGEE_PANE};

/// Host port forwarded to the guest's sshd.
pub const GUEST_SSH_PORT: u16 = 10021;

/// QEMU argument for the rootfs, picked from its `file(1)` description.
pub fn fs_mount_arg(description: &str, rootfs: &str) -> Result<String> {
    if description.contains("cpio archive") {
        Ok(format!(" -initrd {}", rootfs))
    } else if description.contains("filesystem") {
        Ok(format!(" -drive file={},format=raw", rootfs))
    } else {
        Err(LabError::Artifact(format!(
            "unsupported rootfs {}: {}",
            rootfs,
            description.trim()
        ))
        .into())
    }
}

/// `file(1)` description of `path`.
pub fn describe_file(path: &Path) -> Result<String> {
    let out = Cmd::new("file")
        .arg(path)
        .error_msg(format!("inspecting '{}'", path.display()))
        .run()?;
    Ok(out.stdout)
}

/// Builds the `qemu-system-*` command line.
#[derive(Debug, Clone)]
pub struct QemuCommand {
    arch: Arch,
    memory: u32,
    smp: u32,
    kernel: String,
    fs_mount: String,
    kaslr: bool,
    smep: bool,
    smap: bool,
    kpti: bool,
    kvm: bool,
    gdb: bool,
    panic: i64,
}

impl QemuCommand {
    pub fn new(cfg: &DebuggeeConfig, arch: Arch, kernel: &str, fs_mount: &str) -> Self {
        Self {
            arch,
            memory: cfg.memory,
            smp: cfg.smp,
            kernel: kernel.to_string(),
            fs_mount: fs_mount.to_string(),
            kaslr: cfg.kaslr,
            smep: cfg.smep,
            smap: cfg.smap,
            kpti: cfg.kpti,
            kvm: cfg.kvm,
            gdb: cfg.gdb,
            panic: cfg.panic.kernel_param(),
        }
    }

    fn mitigations(&self) -> String {
        let mut flags = vec![if self.kaslr { "kaslr" } else { "nokaslr" }];
        if !self.smep {
            flags.push("nosmep");
        }
        if !self.smap {
            flags.push("nosmap");
        }
        flags.push(if self.kpti { "pti=on" } else { "nopti" });
        flags.join(" ")
    }

    pub fn build(&self) -> Result<String> {
        let mut cmd = format!(
            "qemu-system-{} -m {} -smp {} -kernel {}",
            self.arch.qemu_arch(),
            self.memory,
            self.smp,
            self.kernel
        );
        match self.arch {
            Arch::X86_64 => {
                cmd.push_str(" -cpu qemu64");
                if self.smep {
                    cmd.push_str(",+smep");
                }
                if self.smap {
                    cmd.push_str(",+smap");
                }
                cmd.push_str(" -append \"console=ttyS0 root=/dev/sda");
            }
            Arch::Arm64 => {
                cmd.push_str(" -cpu cortex-a72 -machine type=virt -append \"console=ttyAMA0 root=/dev/vda");
            }
            other => {
                return Err(LabError::Configuration(format!(
                    "debuggee does not support {}",
                    other.as_str()
                ))
                .into())
            }
        }
        cmd.push_str(&format!(
            " earlyprintk=serial net.ifnames=0 {} oops=panic panic={}\"",
            self.mitigations(),
            self.panic
        ));
        cmd.push_str(&self.fs_mount);
        cmd.push_str(&format!(
            " -net user,host=10.0.2.10,hostfwd=tcp:127.0.0.1:{}-:22 -net nic,model=e1000 -nographic -pidfile vm.pid",
            GUEST_SSH_PORT
        ));
        if self.kvm && self.arch == Arch::X86_64 {
            cmd.push_str(" -enable-kvm");
        }
        if self.gdb {
            cmd.push_str(" -S -s");
        }
        Ok(cmd)
    }
}

pub struct Debuggee<'a> {
    cfg: &'a DebuggeeConfig,
    general: &'a GeneralConfig,
    tmux: &'a dyn Tmux,
    target: BootTarget,
}

impl<'a> Debuggee<'a> {
    pub fn new(
        cfg: &'a DebuggeeConfig,
        general: &'a GeneralConfig,
        tmux: &'a dyn Tmux,
        target: BootTarget,
    ) -> Self {
        Self {
            cfg,
            general,
            tmux,
            target,
        }
    }

    pub fn image_spec(&self, build_args: BTreeMap<String, String>) -> ImageSpec {
        ImageSpec {
            tag: self.cfg.image.tag.clone(),
            dockerfile: self.cfg.image.dockerfile.clone(),
            build_args,
            force_rebuild: self.cfg.image.force_rebuild,
        }
    }

    /// Pane command for `image` with the rootfs attached by `fs_mount`.
    pub fn launch_line(&self, image: &str, fs_mount: &str) -> Result<String> {
        let qemu =
            QemuCommand::new(self.cfg, self.general.arch, &self.target.kernel, fs_mount).build()?;
        Ok(DockerRunLine::new()
            .volumes(&self.target.volumes)
            .render(image, &qemu))
    }

    pub fn run(&mut self, runner: &ImageRunner<'_>, spec: &ImageSpec) -> Result<RunOutcome> {
        runner.run(spec, true, self)
    }

    fn launch(&self, image: &str, fs_mount: &str) -> Result<()> {
        let line = self.launch_line(image, fs_mount)?;
        tracing::debug!("debuggee: {}", line);
        self.tmux.select_pane(DEBUGGEE_PANE)?;
        self.tmux.send_line(&line)
    }
}

impl ContainerStart for Debuggee<'_> {
    fn start(&mut self, _runner: &ImageRunner<'_>, image: &ImageRef) -> Result<()> {
        tracing::info!("starting debuggee");
        let description = describe_file(&self.target.host_rootfs)?;
        let fs_mount = fs_mount_arg(&description, &self.target.rootfs)?;
        self.launch(&image.tag, &fs_mount)
    }
}
