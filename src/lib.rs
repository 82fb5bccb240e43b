//! Disposable Linux kernel debugging labs.
//!
//! A run resolves a kernel source, builds (or reuses) the kernel and a root
//! filesystem inside containers, then boots the kernel under QEMU next to a
//! GDB container in a tmux layout.
//!
//! # Architecture
//!
//! ```text
//! config ──► pipeline ──► artifact   (download, unpack, rootfs, .hist marker)
//!               │    ├──► build      (kernel build steps over ssh)
//!               │    └──► session    (debuggee + debugger panes)
//!               ▼
//!            docker / remote / tmux  (engine, shell and pane seams)
//! ```
//!
//! Every keep-or-rebuild decision goes through [`reuse::ReusePolicy`] and
//! every fatal condition carries an [`error::LabError`] with its exit code.
//!
//! # Example
//!
//! ```rust,ignore
//! use like_dbg::config::{sections::LabConfig, Config};
//! use like_dbg::pipeline::{Pipeline, RunOptions};
//!
//! let config = Config::load(&project_dir, None)?;
//! let lab = LabConfig::from_config(&config)?;
//! Pipeline::new(&lab, &project_dir, RunOptions::default(), services).run()?;
//! ```

pub mod artifact;
pub mod build;
pub mod cancel;
pub mod config;
pub mod docker;
pub mod error;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod remote;
pub mod reuse;
pub mod session;
pub mod tmux;

#[cfg(test)]
mod testing;

pub use error::{exit_code_for, LabError};
pub use pipeline::{Pipeline, PipelineOutcome, RunOptions, Services, Stage, StageResult};
