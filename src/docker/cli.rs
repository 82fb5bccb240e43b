//! [`ContainerEngine`] over the `docker` command line.

use anyhow::{Context, Result};

use super::{
    BuildRequest, BuildStatus, ContainerEngine, HealthStatus, ImageRef, RunSpec,
    RunningContainer,
};
use crate::error::LabError;
use crate::process::Cmd;

const HEALTH_FORMAT: &str =
    "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}";

/// Drives the local docker daemon through its CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(&self.program)
    }

    /// Arguments of `docker build` for `request`.
    pub fn build_args(request: &BuildRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            request.dockerfile.display().to_string(),
            "-t".to_string(),
            request.tag.to_string(),
        ];
        if request.no_cache {
            args.push("--no-cache".to_string());
        }
        for (key, value) in request.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(request.context.display().to_string());
        args
    }

    /// Arguments of `docker run` for `spec`.
    pub fn run_args(spec: &RunSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        if spec.remove {
            args.push("--rm".to_string());
        }
        if spec.privileged {
            args.push("--privileged".to_string());
        }
        if spec.tty {
            args.push("-t".to_string());
        }
        for volume in &spec.volumes {
            args.push("-v".to_string());
            args.push(format!(
                "{}:{}:{}",
                volume.host.display(),
                volume.container,
                if volume.read_only { "ro" } else { "rw" }
            ));
        }
        for (host, container) in &spec.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", host, container));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

impl ContainerEngine for DockerCli {
    fn build_image(
        &self,
        request: &BuildRequest<'_>,
        on_log: &mut dyn FnMut(&str),
    ) -> Result<BuildStatus> {
        let code = self
            .cmd()
            .args(Self::build_args(request))
            .allow_fail()
            .stream_lines(|line| on_log(line))?;
        if code == 0 {
            Ok(BuildStatus::Built)
        } else {
            Ok(BuildStatus::Failed(format!(
                "docker build of '{}' exited with {}",
                request.tag, code
            )))
        }
    }

    fn get_image(&self, tag: &str) -> Result<Option<ImageRef>> {
        let out = self
            .cmd()
            .args(["image", "inspect", "--format", "{{.Id}}", tag])
            .allow_fail()
            .run()?;
        if !out.success() || out.stdout_trimmed().is_empty() {
            return Ok(None);
        }
        Ok(Some(ImageRef {
            id: out.stdout_trimmed().to_string(),
            tag: tag.to_string(),
        }))
    }

    fn run_container(&self, spec: &RunSpec) -> Result<String> {
        let out = self
            .cmd()
            .args(Self::run_args(spec))
            .allow_fail()
            .run()?;
        if !out.success() {
            return Err(LabError::ContainerLifecycle(format!(
                "starting container from '{}' failed: {}",
                spec.image,
                out.stderr.trim()
            ))
            .into());
        }
        Ok(out.stdout_trimmed().to_string())
    }

    fn health_status(&self, id: &str) -> Result<HealthStatus> {
        let out = self
            .cmd()
            .args(["inspect", "--format", HEALTH_FORMAT, id])
            .error_msg(format!("inspecting container {}", id))
            .run()?;
        Ok(HealthStatus::parse(out.stdout_trimmed()))
    }

    fn follow_logs(&self, id: &str, on_line: &mut dyn FnMut(&str)) -> Result<()> {
        // A container started with --rm may already be gone when the stream ends.
        self.cmd()
            .args(["logs", "-f", id])
            .allow_fail()
            .stream_lines(|line| on_line(line))?;
        Ok(())
    }

    fn wait(&self, id: &str) -> Result<i32> {
        let out = self
            .cmd()
            .args(["wait", id])
            .error_msg(format!("waiting for container {}", id))
            .run()?;
        out.stdout_trimmed()
            .parse::<i32>()
            .with_context(|| format!("parsing exit code of container {}", id))
    }

    fn stop(&self, id: &str) -> Result<()> {
        self.cmd()
            .args(["stop", id])
            .error_msg(format!("stopping container {}", id))
            .run()?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.cmd()
            .args(["rm", "-f", id])
            .error_msg(format!("removing container {}", id))
            .run()?;
        Ok(())
    }

    fn list_running(&self) -> Result<Vec<RunningContainer>> {
        let out = self
            .cmd()
            .args(["ps", "--format", "{{.ID}}\t{{.Image}}"])
            .error_msg("listing running containers")
            .run()?;
        Ok(parse_ps(&out.stdout))
    }
}

fn parse_ps(output: &str) -> Vec<RunningContainer> {
    output
        .lines()
        .filter_map(|line| {
            let (id, image) = line.trim().split_once('\t')?;
            Some(RunningContainer {
                id: id.to_string(),
                image: image.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::Volume;
    use std::collections::BTreeMap;
    use std::path::Path;

    #[test]
    fn build_args_include_no_cache_and_build_args() {
        let mut build_args = BTreeMap::new();
        build_args.insert("USER".to_string(), "user".to_string());
        let request = BuildRequest {
            context: Path::new("/proj"),
            dockerfile: Path::new(".dockerfile_dbg"),
            tag: "like_debugger",
            build_args: &build_args,
            no_cache: true,
        };
        assert_eq!(
            DockerCli::build_args(&request).join(" "),
            "build -f .dockerfile_dbg -t like_debugger --no-cache --build-arg USER=user /proj"
        );
    }

    #[test]
    fn run_args_for_privileged_builder() {
        let spec = RunSpec {
            image: "like_rootfs".into(),
            volumes: vec![Volume::rw("/proj/io", "/io")],
            ports: vec![(2222, 22)],
            privileged: true,
            remove: true,
            tty: false,
            command: vec!["/bin/bash".into(), "-c".into(), "true".into()],
        };
        assert_eq!(
            DockerCli::run_args(&spec).join(" "),
            "run -d --rm --privileged -v /proj/io:/io:rw -p 2222:22 like_rootfs /bin/bash -c true"
        );
    }

    #[test]
    fn ps_output_is_parsed() {
        let parsed = parse_ps("abc\tlike_debuggee\nnot-a-row\ndef\tnginx:latest\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].image, "like_debuggee");
        assert_eq!(parsed[1].id, "def");
    }
}
