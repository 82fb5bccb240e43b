//! Typed per-component configuration.
//!
//! Each struct is resolved once from [`Config`] and never mutated afterwards.
//! String-valued modes are parsed into closed enums here, so an unknown mode
//! fails at construction instead of falling through somewhere mid-build.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use super::{Config, Fields, ResolveRequest};
use crate::cancel::Backoff;
use crate::error::LabError;

/// Target architecture of the lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm64,
    Riscv64,
}

impl Arch {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "x86_64" => Ok(Self::X86_64),
            "arm64" => Ok(Self::Arm64),
            "riscv64" => Ok(Self::Riscv64),
            other => Err(LabError::Configuration(format!(
                "unsupported arch '{}' (expected x86_64, arm64 or riscv64)",
                other
            ))
            .into()),
        }
    }

    /// Name as written in the configuration and image tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::Riscv64 => "riscv64",
        }
    }

    /// Kernel `ARCH=` value and `arch/<dir>` name.
    pub fn kernel_arch(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::Riscv64 => "riscv",
        }
    }

    pub fn qemu_arch(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "aarch64",
            Self::Riscv64 => "riscv64",
        }
    }

    pub fn toolchain_arch(self) -> &'static str {
        match self {
            Self::X86_64 => "x86-64",
            Self::Arm64 => "aarch64",
            Self::Riscv64 => "riscv64",
        }
    }

    pub fn cross_compile(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64-pc-linux-gnu-",
            Self::Arm64 => "aarch64-linux-gnu-",
            Self::Riscv64 => "riscv64-linux-gnu-",
        }
    }
}

/// How an existing artifact is judged when nothing forces a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseMode {
    /// Ask the operator.
    Interactive,
    /// Keep the artifact when its history marker matches.
    Auto,
}

impl ReuseMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "" | "interactive" => Ok(Self::Interactive),
            "auto" => Ok(Self::Auto),
            other => Err(LabError::Configuration(format!(
                "unsupported reuse mode '{}' (expected interactive or auto)",
                other
            ))
            .into()),
        }
    }
}

/// Options shared by every component.
#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub arch: Arch,
    pub user: String,
    /// In-container mount point of the project directory.
    pub docker_mnt: String,
    pub kernel_root: PathBuf,
    pub ssh_dir: PathBuf,
    pub ssh_fwd_port: u16,
    pub tag_base_image: String,
    pub dockerfile_base_image: PathBuf,
    pub reuse: ReuseMode,
    pub health: Backoff,
    pub ssh: Backoff,
}

impl GeneralConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let fields = config.resolve(&ResolveRequest::sections(&["general", "kernel_general"]));
        Self::from_fields(&fields).context("resolving [general]/[kernel_general]")
    }

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let port = fields.u32_or("ssh_fwd_port", 2222)?;
        let ssh_fwd_port = u16::try_from(port).map_err(|_| {
            LabError::Configuration(format!("ssh_fwd_port {} is out of range", port))
        })?;
        Ok(Self {
            arch: Arch::parse(&fields.str("arch")?)?,
            user: fields.str("user")?,
            docker_mnt: fields.str_or("docker_mnt", "/io"),
            kernel_root: fields.path("kernel_root")?,
            ssh_dir: fields.opt_path("ssh_dir").unwrap_or_else(|| PathBuf::from(".ssh")),
            ssh_fwd_port,
            tag_base_image: fields.str_or("tag_base_image", "like_dbg_base"),
            dockerfile_base_image: fields
                .opt_path("dockerfile_base_image")
                .unwrap_or_else(|| PathBuf::from(".dockerfile_base")),
            reuse: ReuseMode::parse(&fields.str_or("reuse", "interactive"))?,
            health: Backoff::new(
                fields.u32_or("health_retries", 120)?,
                Duration::from_millis(u64::from(fields.u32_or("health_interval_ms", 1000)?)),
            ),
            ssh: Backoff::new(
                fields.u32_or("ssh_retries", 5)?,
                Duration::from_millis(u64::from(fields.u32_or("ssh_backoff_ms", 5000)?)),
            ),
        })
    }
}

/// Container image identity shared by the docker-backed components.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub tag: String,
    pub dockerfile: PathBuf,
    pub force_rebuild: bool,
}

impl ImageConfig {
    fn from_fields(fields: &Fields) -> Result<Self> {
        Ok(Self {
            tag: fields.str("tag")?,
            dockerfile: fields.path("dockerfile")?,
            force_rebuild: fields.bool_or("force_rebuild", false)?,
        })
    }
}

/// Kernel source selection and download locations.
#[derive(Debug, Clone)]
pub struct KernelDlConfig {
    pub kernel_dl_path: PathBuf,
    pub snap_uri: String,
    pub commit_uri: String,
    pub mmp_uri: String,
    pub mmp: Option<String>,
    pub tag: Option<String>,
    pub commit: Option<String>,
}

impl KernelDlConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let fields = config.resolve(&ResolveRequest::sections(&["kernel_dl"]));
        Self::from_fields(&fields).context("resolving [kernel_dl]")
    }

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        Ok(Self {
            kernel_dl_path: fields.path("kernel_dl_path")?,
            snap_uri: fields.str("snap_uri")?,
            commit_uri: fields.str("commit_uri")?,
            mmp_uri: fields.str("mmp_uri")?,
            mmp: fields.opt_str("mmp"),
            tag: fields.opt_str("tag"),
            commit: fields.opt_str("commit"),
        })
    }
}

/// Source of the kernel `.config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelConfigMode {
    /// Defconfig plus the generic debugging option set.
    Generic { args: String },
    /// Defconfig plus the syzkaller option set.
    Syzkaller { args: String },
    /// Defconfig plus explicit enable/disable lists.
    Custom {
        enable: Vec<String>,
        disable: Vec<String>,
    },
    /// A complete `.config` supplied by the operator.
    Config { path: PathBuf },
}

impl KernelConfigMode {
    pub fn from_fields(fields: &Fields) -> Result<Self> {
        let mode = fields.str("mode")?;
        match mode.trim() {
            "generic" => Ok(Self::Generic {
                args: fields.str_or("generic_args", ""),
            }),
            "syzkaller" => Ok(Self::Syzkaller {
                args: fields.str_or("syzkaller_args", ""),
            }),
            "custom" => Ok(Self::Custom {
                enable: split_words(&fields.str_or("enable_args", "")),
                disable: split_words(&fields.str_or("disable_args", "")),
            }),
            "config" => Ok(Self::Config {
                path: fields.path("config")?,
            }),
            other => Err(LabError::Configuration(format!(
                "unsupported kernel build mode '{}' (expected generic, syzkaller, custom or config)",
                other
            ))
            .into()),
        }
    }

    /// `scripts/config` arguments contributed by the mode itself.
    pub fn config_args(&self) -> String {
        match self {
            Self::Generic { args } | Self::Syzkaller { args } => args.trim().to_string(),
            Self::Custom { enable, disable } => {
                let mut parts = Vec::new();
                parts.extend(enable.iter().map(|opt| format!("-e {}", opt)));
                parts.extend(disable.iter().map(|opt| format!("-d {}", opt)));
                parts.join(" ")
            }
            Self::Config { .. } => String::new(),
        }
    }
}

fn split_words(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Kernel builder container and build options.
#[derive(Debug, Clone)]
pub struct KernelBuilderConfig {
    pub image: ImageConfig,
    pub compiler: Option<String>,
    pub mode: KernelConfigMode,
    pub extra_args: Option<String>,
    pub patch_dir: Option<PathBuf>,
    pub custom_modules: Option<PathBuf>,
    /// Build `kvm_guest.config` on top of the defconfig.
    pub kvm: bool,
    /// Remote commands need `sudo` inside the container.
    pub require_root: bool,
}

impl KernelBuilderConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let picks: &[(&str, &[&str])] = &[("debuggee", &["kvm"])];
        let fields = config.resolve(
            &ResolveRequest::sections(&["kernel_builder", "kernel_builder_docker"])
                .exclude(&["kernel_root"])
                .cherry_pick(picks),
        );
        Self::from_fields(&fields).context("resolving [kernel_builder]")
    }

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        Ok(Self {
            image: ImageConfig::from_fields(fields)?,
            compiler: fields.opt_str("compiler"),
            mode: KernelConfigMode::from_fields(fields)?,
            extra_args: fields.opt_str("extra_args"),
            patch_dir: fields.opt_path("patch_dir"),
            custom_modules: fields.opt_path("custom_modules"),
            kvm: fields.bool_or("kvm", false)?,
            require_root: fields.bool_or("require_root", false)?,
        })
    }

    /// LLVM toolchain unless gcc was asked for explicitly.
    pub fn uses_llvm(&self) -> bool {
        !matches!(self.compiler.as_deref(), Some(cc) if cc.contains("gcc"))
    }
}

/// Root filesystem location and builder options.
#[derive(Debug, Clone)]
pub struct RootfsConfig {
    pub image: ImageConfig,
    pub rootfs_dir: PathBuf,
    pub rootfs_base: String,
    pub rootfs_ftype: String,
    pub distribution: String,
    pub packages: String,
    pub hostname: Option<String>,
}

impl RootfsConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let fields = config.resolve(&ResolveRequest::sections(&["rootfs_general", "rootfs_builder"]));
        Self::from_fields(&fields).context("resolving [rootfs_builder]")
    }

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        Ok(Self {
            image: ImageConfig::from_fields(fields)?,
            rootfs_dir: fields.path("rootfs_dir")?,
            rootfs_base: fields.str("rootfs_base")?,
            rootfs_ftype: fields.str_or("rootfs_ftype", ""),
            distribution: fields.str("distribution")?,
            packages: fields.str("packages")?,
            hostname: fields.opt_str("hostname"),
        })
    }

    /// File name of the image for `arch`, e.g. `filesystem-x86_64`.
    pub fn file_name(&self, arch: Arch) -> String {
        format!("{}{}{}", self.rootfs_base, arch.as_str(), self.rootfs_ftype)
    }

    pub fn host_path(&self, arch: Arch) -> PathBuf {
        self.rootfs_dir.join(self.file_name(arch))
    }
}

/// Kernel `panic=` behaviour of the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicBehavior {
    Reboot,
    Halt,
    Wait(u32),
}

/// Wait used when `wait` is given without a usable duration.
pub const DEFAULT_PANIC_WAIT: u32 = 15;

impl PanicBehavior {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split_whitespace();
        match parts.next() {
            Some("reboot") => Ok(Self::Reboot),
            Some("halt") => Ok(Self::Halt),
            Some("wait") => Ok(Self::Wait(
                parts
                    .next()
                    .and_then(|secs| secs.parse().ok())
                    .unwrap_or(DEFAULT_PANIC_WAIT),
            )),
            _ => Err(LabError::Configuration(format!(
                "unsupported panic behaviour '{}' (expected reboot, halt or wait <secs>)",
                raw
            ))
            .into()),
        }
    }

    /// Value of the kernel `panic=` parameter.
    pub fn kernel_param(self) -> i64 {
        match self {
            Self::Reboot => -1,
            Self::Halt => 0,
            Self::Wait(secs) => i64::from(secs),
        }
    }
}

/// VM settings of the debuggee container.
#[derive(Debug, Clone)]
pub struct DebuggeeConfig {
    pub image: ImageConfig,
    pub memory: u32,
    pub smp: u32,
    pub kvm: bool,
    pub gdb: bool,
    pub kaslr: bool,
    pub smep: bool,
    pub smap: bool,
    pub kpti: bool,
    pub panic: PanicBehavior,
}

impl DebuggeeConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let fields = config.resolve(&ResolveRequest::sections(&["debuggee", "debuggee_docker"]));
        Self::from_fields(&fields).context("resolving [debuggee]")
    }

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        Ok(Self {
            image: ImageConfig::from_fields(fields)?,
            memory: fields.u32_or("memory", 1024)?,
            smp: fields.u32_or("smp", 1)?,
            kvm: fields.bool_or("kvm", false)?,
            gdb: fields.bool_or("gdb", true)?,
            kaslr: fields.bool_or("kaslr", false)?,
            smep: fields.bool_or("smep", true)?,
            smap: fields.bool_or("smap", true)?,
            kpti: fields.bool_or("kpti", true)?,
            panic: PanicBehavior::parse(&fields.str_or("panic", "halt"))?,
        })
    }
}

/// GDB container settings.
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    pub image: ImageConfig,
    pub gdb_script: Option<PathBuf>,
    pub extract_vmlinux: PathBuf,
    pub ctf_dir: PathBuf,
}

impl DebuggerConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let fields = config.resolve(&ResolveRequest::sections(&["debugger"]));
        Self::from_fields(&fields).context("resolving [debugger]")
    }

    pub fn from_fields(fields: &Fields) -> Result<Self> {
        Ok(Self {
            image: ImageConfig::from_fields(fields)?,
            gdb_script: fields.opt_path("gdb_script"),
            extract_vmlinux: fields
                .opt_path("extract_vmlinux")
                .unwrap_or_else(|| PathBuf::from("io/scripts/extract-vmlinux")),
            ctf_dir: fields.opt_path("ctf_dir").unwrap_or_else(|| PathBuf::from(".ctf")),
        })
    }
}

/// Everything a run needs, resolved once up front.
#[derive(Debug, Clone)]
pub struct LabConfig {
    pub general: GeneralConfig,
    pub kernel_dl: KernelDlConfig,
    pub kernel_builder: KernelBuilderConfig,
    pub rootfs: RootfsConfig,
    pub debuggee: DebuggeeConfig,
    pub debugger: DebuggerConfig,
}

impl LabConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            general: GeneralConfig::from_config(config)?,
            kernel_dl: KernelDlConfig::from_config(config)?,
            kernel_builder: KernelBuilderConfig::from_config(config)?,
            rootfs: RootfsConfig::from_config(config)?,
            debuggee: DebuggeeConfig::from_config(config)?,
            debugger: DebuggerConfig::from_config(config)?,
        })
    }
}
