//! Thin builder over `std::process::Command`.
//!
//! Every external tool (docker, ssh, curl, tmux, file) is invoked through
//! [`Cmd`] so failures carry the command line and captured stderr.
//!
//! ```rust,ignore
//! use like_dbg::process::Cmd;
//!
//! let out = Cmd::new("docker")
//!     .args(["images", "-q", "like_debugger"])
//!     .error_msg("listing images failed")
//!     .run()?;
//! ```

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Command builder with error context.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            dir: None,
            envs: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Message used when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of failing on a non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Human readable command line, used in logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd
    }

    /// Run to completion and capture stdout/stderr.
    pub fn run(&self) -> Result<CommandResult> {
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning '{}'", self.display()))?;

        let result = CommandResult {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            bail!(
                "{} (exit {}): {}\n{}",
                self.error_msg
                    .clone()
                    .unwrap_or_else(|| format!("'{}' failed", self.display())),
                result.code,
                self.display(),
                result.stderr.trim()
            );
        }
        Ok(result)
    }

    /// Run with inherited stdio so the operator sees progress.
    pub fn run_interactive(&self) -> Result<i32> {
        let status = self
            .command()
            .status()
            .with_context(|| format!("spawning '{}'", self.display()))?;
        let code = status.code().unwrap_or(-1);
        if code != 0 && !self.allow_fail {
            bail!(
                "{} (exit {}): {}",
                self.error_msg
                    .clone()
                    .unwrap_or_else(|| format!("'{}' failed", self.display())),
                code,
                self.display()
            );
        }
        Ok(code)
    }

    /// Run and hand every stdout/stderr line to `on_line` as it arrives.
    ///
    /// Both pipes are drained on reader threads so neither can fill up and
    /// stall the child.
    pub fn stream_lines(&self, mut on_line: impl FnMut(&str)) -> Result<i32> {
        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning '{}'", self.display()))?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        for line in rx {
            on_line(&line);
        }
        for reader in readers {
            if reader.join().is_err() {
                tracing::warn!("output reader for '{}' panicked", self.display());
            }
        }

        let status = child
            .wait()
            .with_context(|| format!("waiting for '{}'", self.display()))?;
        let code = status.code().unwrap_or(-1);
        if code != 0 && !self.allow_fail {
            bail!(
                "{} (exit {}): {}",
                self.error_msg
                    .clone()
                    .unwrap_or_else(|| format!("'{}' failed", self.display())),
                code,
                self.display()
            );
        }
        Ok(code)
    }

    /// Run with stdout written to `dest` (created or truncated).
    pub fn run_to_file(&self, dest: &Path) -> Result<i32> {
        let out = std::fs::File::create(dest)
            .with_context(|| format!("creating '{}'", dest.display()))?;
        let output = self
            .command()
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning '{}'", self.display()))?;
        let code = output.status.code().unwrap_or(-1);
        if code != 0 && !self.allow_fail {
            bail!(
                "{} (exit {}): {}\n{}",
                self.error_msg
                    .clone()
                    .unwrap_or_else(|| format!("'{}' failed", self.display())),
                code,
                self.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(code)
    }
}

fn forward_lines<R: Read + Send + 'static>(
    pipe: R,
    tx: mpsc::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

/// Fail unless `path` exists, naming `what` in the error.
pub fn ensure_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found at {}", what, path.display());
    }
    Ok(())
}
