//! In-memory fakes for the engine, shell and prompt seams.

use anyhow::{bail, Result};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use crate::artifact::download::Fetch;
use crate::cancel::Cancellation;
use crate::docker::{
    BuildRequest, BuildStatus, ContainerEngine, HealthStatus, ImageRef, RunSpec,
    RunningContainer,
};
use crate::remote::RemoteShell;
use crate::reuse::Prompt;
use crate::tmux::Tmux;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Build(String, bool),
    Run(RunSpec),
    Health(String),
    Logs(String),
    Wait(String),
    Stop(String),
    Remove(String),
}

#[derive(Debug, Default)]
pub struct FakeEngine {
    images: RefCell<BTreeSet<String>>,
    failing_builds: BTreeSet<String>,
    failing_stops: BTreeSet<String>,
    health: RefCell<VecDeque<HealthStatus>>,
    running: RefCell<Vec<RunningContainer>>,
    logs: Vec<String>,
    exit_code: i32,
    calls: RefCell<Vec<EngineCall>>,
    next_id: Cell<u32>,
}

impl FakeEngine {
    pub fn with_images(self, tags: &[&str]) -> Self {
        self.images
            .borrow_mut()
            .extend(tags.iter().map(|t| t.to_string()));
        self
    }

    pub fn failing_build(mut self, tag: &str) -> Self {
        self.failing_builds.insert(tag.to_string());
        self
    }

    pub fn failing_stop(mut self, id: &str) -> Self {
        self.failing_stops.insert(id.to_string());
        self
    }

    pub fn with_health(self, statuses: &[HealthStatus]) -> Self {
        self.health.borrow_mut().extend(statuses.iter().cloned());
        self
    }

    pub fn with_running(self, containers: &[(&str, &str)]) -> Self {
        self.running
            .borrow_mut()
            .extend(containers.iter().map(|(id, image)| RunningContainer {
                id: id.to_string(),
                image: image.to_string(),
            }));
        self
    }

    pub fn with_logs(mut self, lines: &[&str]) -> Self {
        self.logs = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.borrow().clone()
    }

    pub fn builds(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Build(tag, _) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Run(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Stop(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Remove(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: EngineCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl ContainerEngine for FakeEngine {
    fn build_image(
        &self,
        request: &BuildRequest<'_>,
        on_log: &mut dyn FnMut(&str),
    ) -> Result<BuildStatus> {
        self.record(EngineCall::Build(request.tag.to_string(), request.no_cache));
        on_log("Step 1/1 : FROM scratch");
        if self.failing_builds.contains(request.tag) {
            return Ok(BuildStatus::Failed("scripted failure".into()));
        }
        self.images.borrow_mut().insert(request.tag.to_string());
        Ok(BuildStatus::Built)
    }

    fn get_image(&self, tag: &str) -> Result<Option<ImageRef>> {
        Ok(self.images.borrow().contains(tag).then(|| ImageRef {
            id: format!("sha256:{}", tag),
            tag: tag.to_string(),
        }))
    }

    fn run_container(&self, spec: &RunSpec) -> Result<String> {
        self.record(EngineCall::Run(spec.clone()));
        let n = self.next_id.get() + 1;
        self.next_id.set(n);
        let id = format!("c{}", n);
        self.running.borrow_mut().push(RunningContainer {
            id: id.clone(),
            image: spec.image.clone(),
        });
        Ok(id)
    }

    fn health_status(&self, id: &str) -> Result<HealthStatus> {
        self.record(EngineCall::Health(id.to_string()));
        Ok(self
            .health
            .borrow_mut()
            .pop_front()
            .unwrap_or(HealthStatus::Healthy))
    }

    fn follow_logs(&self, id: &str, on_line: &mut dyn FnMut(&str)) -> Result<()> {
        self.record(EngineCall::Logs(id.to_string()));
        for line in &self.logs {
            on_line(line);
        }
        Ok(())
    }

    fn wait(&self, id: &str) -> Result<i32> {
        self.record(EngineCall::Wait(id.to_string()));
        Ok(self.exit_code)
    }

    fn stop(&self, id: &str) -> Result<()> {
        self.record(EngineCall::Stop(id.to_string()));
        if self.failing_stops.contains(id) {
            bail!("scripted stop failure for {}", id);
        }
        self.running.borrow_mut().retain(|c| c.id != id);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.record(EngineCall::Remove(id.to_string()));
        self.running.borrow_mut().retain(|c| c.id != id);
        Ok(())
    }

    fn list_running(&self) -> Result<Vec<RunningContainer>> {
        Ok(self.running.borrow().clone())
    }
}

/// Records commands; every command succeeds unless it contains a scripted
/// failure pattern.
#[derive(Debug, Default)]
pub struct FakeShell {
    failures: Vec<(String, i32)>,
    interrupts: Vec<(String, Cancellation)>,
    unreachable_for: u32,
    probes: Cell<u32>,
    commands: RefCell<Vec<String>>,
}

impl FakeShell {
    pub fn failing(mut self, pattern: &str, code: i32) -> Self {
        self.failures.push((pattern.to_string(), code));
        self
    }

    /// Commands matching `pattern` set `cancel`, like a SIGINT delivered
    /// to the foreground ssh client.
    pub fn interrupting(mut self, pattern: &str, cancel: Cancellation) -> Self {
        self.interrupts.push((pattern.to_string(), cancel));
        self
    }

    /// The first `n` probes report the shell as unreachable.
    pub fn unreachable_for(mut self, n: u32) -> Self {
        self.unreachable_for = n;
        self
    }

    pub fn probes(&self) -> u32 {
        self.probes.get()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl RemoteShell for FakeShell {
    fn target(&self) -> String {
        "user@fake:22".to_string()
    }

    fn probe(&self) -> Result<bool> {
        let n = self.probes.get() + 1;
        self.probes.set(n);
        Ok(n > self.unreachable_for)
    }

    fn exec(&self, command: &str) -> Result<i32> {
        self.commands.borrow_mut().push(command.to_string());
        self.interrupts
            .iter()
            .filter(|(pattern, _)| command.contains(pattern.as_str()))
            .for_each(|(_, cancel)| cancel.cancel());
        Ok(self
            .failures
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0))
    }
}

/// Answers reuse prompts from a fixed script.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: RefCell<VecDeque<bool>>,
    asked: RefCell<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new(answers: &[bool]) -> Self {
        Self {
            answers: RefCell::new(answers.iter().copied().collect()),
            asked: RefCell::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }
}

impl Prompt for ScriptedPrompt {
    fn confirm_reuse(&self, what: &str) -> Result<bool> {
        self.asked.borrow_mut().push(what.to_string());
        match self.answers.borrow_mut().pop_front() {
            Some(answer) => Ok(answer),
            None => bail!("unexpected reuse prompt for {}", what),
        }
    }
}

/// Records tmux commands instead of running them.
#[derive(Debug, Default)]
pub struct FakeTmux {
    commands: RefCell<Vec<String>>,
}

impl FakeTmux {
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl Tmux for FakeTmux {
    fn command(&self, args: &str) -> Result<()> {
        self.commands.borrow_mut().push(args.to_string());
        Ok(())
    }
}

/// Serves a fixed page and writes a stub archive for every download.
#[derive(Debug, Default)]
pub struct FakeFetch {
    pub page: String,
    pub fail_download: bool,
    pub downloads: RefCell<Vec<String>>,
}

impl Fetch for FakeFetch {
    fn fetch_text(&self, _uri: &str) -> Result<String> {
        Ok(self.page.clone())
    }

    fn download(&self, uri: &str, dest: &Path) -> Result<()> {
        self.downloads.borrow_mut().push(uri.to_string());
        fs::write(dest, b"partial")?;
        if self.fail_download {
            bail!("connection reset");
        }
        Ok(())
    }
}
