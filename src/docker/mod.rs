//! Container lifecycle management.
//!
//! - [`ContainerEngine`] - narrow interface over the container runtime
//! - [`cli`] - production engine driving the `docker` CLI
//! - [`runner`] - image build/reuse, container start, health waits
//! - [`teardown`] - stop every container started by this tool
//!
//! Image tags follow the `like_<component>` convention so teardown can find
//! everything this tool started without tracking state on disk.

pub mod cli;
pub mod runner;
pub mod teardown;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::sections::{Arch, KernelBuilderConfig};

pub use cli::DockerCli;
pub use runner::{ContainerSession, ContainerStart, ImageRunner, ImageSpec, RunOutcome};
pub use teardown::{teardown_matching, TeardownReport};

/// Tag prefix shared by every image this tool builds.
pub const TAG_PREFIX: &str = "like_";

/// Local image resolved by tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub id: String,
    pub tag: String,
}

/// Outcome of an image build. Engine-level build failures are a status,
/// not an error, so callers decide how fatal they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Built,
    Failed(String),
}

/// Everything needed to build one image.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub context: &'a Path,
    pub dockerfile: &'a Path,
    pub tag: &'a str,
    pub build_args: &'a BTreeMap<String, String>,
    pub no_cache: bool,
}

/// Bind mount `host:container`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Volume {
    pub fn rw(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }
}

/// Detached container start request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub volumes: Vec<Volume>,
    /// `(host, container)` TCP port pairs.
    pub ports: Vec<(u16, u16)>,
    pub privileged: bool,
    /// Remove the container once it exits.
    pub remove: bool,
    pub tty: bool,
    pub command: Vec<String>,
}

/// Health as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
    /// Running without a health check.
    Running,
    Exited,
    Other(String),
}

impl HealthStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "starting" => Self::Starting,
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            "running" => Self::Running,
            "exited" | "dead" => Self::Exited,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A running container as listed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub id: String,
    pub image: String,
}

/// Container runtime operations the lab needs.
pub trait ContainerEngine {
    /// Build an image, handing each log line to `on_log`.
    fn build_image(
        &self,
        request: &BuildRequest<'_>,
        on_log: &mut dyn FnMut(&str),
    ) -> Result<BuildStatus>;

    fn get_image(&self, tag: &str) -> Result<Option<ImageRef>>;

    /// Start a detached container and return its id.
    fn run_container(&self, spec: &RunSpec) -> Result<String>;

    fn health_status(&self, id: &str) -> Result<HealthStatus>;

    /// Follow container output until it exits.
    fn follow_logs(&self, id: &str, on_line: &mut dyn FnMut(&str)) -> Result<()>;

    /// Block until the container exits and return its exit code.
    fn wait(&self, id: &str) -> Result<i32>;

    fn stop(&self, id: &str) -> Result<()>;

    /// Force-remove a container, running or exited.
    fn remove(&self, id: &str) -> Result<()>;

    fn list_running(&self) -> Result<Vec<RunningContainer>>;
}

/// Fixed build-argument set handed to every image build.
pub fn lab_build_args(arch: Arch, user: &str, compiler: Option<&str>) -> BTreeMap<String, String> {
    let llvm = !matches!(compiler, Some(cc) if cc.contains("gcc"));
    let mut args = BTreeMap::new();
    if let Some(cc) = compiler {
        args.insert("CC".to_string(), cc.to_string());
    }
    args.insert("LLVM".to_string(), if llvm { "1" } else { "0" }.to_string());
    args.insert(
        "TOOLCHAIN_ARCH".to_string(),
        arch.toolchain_arch().to_string(),
    );
    args.insert(
        "CROSS_COMPILE".to_string(),
        arch.cross_compile().to_string(),
    );
    args.insert("ARCH".to_string(), arch.kernel_arch().to_string());
    args.insert("USER".to_string(), user.to_string());
    args
}

/// Kernel builder images are per-architecture.
pub fn kernel_builder_tag(kb: &KernelBuilderConfig, arch: Arch) -> String {
    format!("{}_{}", kb.image.tag, arch.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_for_arm64_gcc() {
        let args = lab_build_args(Arch::Arm64, "user", Some("gcc"));
        assert_eq!(args["CC"], "gcc");
        assert_eq!(args["LLVM"], "0");
        assert_eq!(args["TOOLCHAIN_ARCH"], "aarch64");
        assert_eq!(args["CROSS_COMPILE"], "aarch64-linux-gnu-");
        assert_eq!(args["ARCH"], "arm64");
        assert_eq!(args["USER"], "user");
    }

    #[test]
    fn build_args_default_to_llvm() {
        let args = lab_build_args(Arch::X86_64, "user", None);
        assert!(!args.contains_key("CC"));
        assert_eq!(args["LLVM"], "1");
        assert_eq!(args["TOOLCHAIN_ARCH"], "x86-64");
    }

    #[test]
    fn health_status_parsing() {
        assert_eq!(HealthStatus::parse("healthy\n"), HealthStatus::Healthy);
        assert_eq!(HealthStatus::parse("dead"), HealthStatus::Exited);
        assert_eq!(
            HealthStatus::parse("paused"),
            HealthStatus::Other("paused".into())
        );
    }
}
