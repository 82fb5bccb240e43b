//! Debug session (stage 5): debuggee VM and debugger, each in its own
//! container and tmux pane.
//!
//! Both containers are interactive, so they are launched by typing a
//! `docker run -it` line into their pane rather than through the engine.

pub mod ctf;
pub mod debuggee;
pub mod debugger;

use std::path::{Path, PathBuf};

use crate::config::sections::{GeneralConfig, RootfsConfig};
use crate::docker::Volume;

pub use ctf::CtfInputs;
pub use debuggee::Debuggee;
pub use debugger::Debugger;

/// Where supplied CTF images are mounted in the debuggee.
pub const CTF_MOUNT: &str = "/ctf";

/// Kernel and rootfs the debuggee boots, on the host and in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootTarget {
    pub host_kernel: PathBuf,
    pub host_rootfs: PathBuf,
    pub kernel: String,
    pub rootfs: String,
    pub volumes: Vec<Volume>,
}

impl BootTarget {
    /// Images produced by the build stages, inside the mounted project.
    pub fn lab(general: &GeneralConfig, rootfs: &RootfsConfig, project_dir: &Path) -> Self {
        let mnt = general.docker_mnt.trim_end_matches('/');
        let arch = general.arch;
        let kernel_rel = general
            .kernel_root
            .join("arch")
            .join(arch.kernel_arch())
            .join("boot")
            .join("Image");
        let rootfs_rel = rootfs.host_path(arch);
        Self {
            host_kernel: project_dir.join(&kernel_rel),
            host_rootfs: project_dir.join(&rootfs_rel),
            kernel: format!("{}/{}", mnt, kernel_rel.display()),
            rootfs: format!("{}/{}", mnt, rootfs_rel.display()),
            volumes: vec![Volume::rw(project_dir, general.docker_mnt.as_str())],
        }
    }

    /// Operator supplied images, each bind-mounted under [`CTF_MOUNT`].
    pub fn ctf(inputs: &CtfInputs) -> Self {
        let in_ctf = |p: &Path| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{}/{}", CTF_MOUNT, name)
        };
        let kernel = in_ctf(&inputs.kernel);
        let rootfs = in_ctf(&inputs.rootfs);
        Self {
            host_kernel: inputs.kernel.clone(),
            host_rootfs: inputs.rootfs.clone(),
            volumes: vec![
                Volume::rw(&inputs.kernel, kernel.as_str()),
                Volume::rw(&inputs.rootfs, rootfs.as_str()),
            ],
            kernel,
            rootfs,
        }
    }
}

/// `docker run -it --rm` line typed into a pane.
#[derive(Debug, Clone, Default)]
pub struct DockerRunLine {
    volumes: Vec<Volume>,
    extra: Vec<String>,
}

impl DockerRunLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn volume(mut self, volume: Volume) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn volumes(mut self, volumes: &[Volume]) -> Self {
        self.volumes.extend(volumes.iter().cloned());
        self
    }

    pub fn option(mut self, opt: &str) -> Self {
        self.extra.push(opt.to_string());
        self
    }

    pub fn render(&self, image: &str, command: &str) -> String {
        let mut line = String::from("docker run -it --rm");
        for opt in &self.extra {
            line.push(' ');
            line.push_str(opt);
        }
        for v in &self.volumes {
            line.push_str(&format!(" -v {}:{}", v.host.display(), v.container));
            if v.read_only {
                line.push_str(":ro");
            }
        }
        line.push_str(&format!(" --net=\"host\" {} {}", image, command));
        line
    }
}
