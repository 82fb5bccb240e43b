//! Error taxonomy and process exit codes.
//!
//! Library code returns `anyhow::Result` like everywhere else in the crate.
//! Conditions that must terminate the run with a specific exit code carry a
//! [`LabError`] as their root cause, so the binary can recover the code with
//! [`exit_code_for`] after logging the whole context chain.

use thiserror::Error;

/// Fatal error classes of a lab run.
#[derive(Debug, Error)]
pub enum LabError {
    /// A required configuration section or key is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An artifact is corrupt, missing, or in an unsupported format.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// A command run inside a container exited non-zero.
    #[error("remote command failed with exit code {code}: {command}")]
    RemoteCommand { command: String, code: i32 },

    /// Image build, container start, or health check failed.
    #[error("container lifecycle error: {0}")]
    ContainerLifecycle(String),

    /// The remote shell never became reachable.
    #[error("could not open remote shell to {target} after {attempts} attempts")]
    SshExhausted { target: String, attempts: u32 },

    /// The tool must run inside a tmux session.
    #[error("not running inside a tmux session")]
    NotInTmux,

    /// A required host tool is not installed.
    #[error("missing required host tools: {0}")]
    MissingTool(String),

    /// The process received an interrupt signal.
    #[error("interrupted")]
    Interrupted,
}

impl LabError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::Artifact(_) => 3,
            Self::RemoteCommand { .. } => 4,
            Self::ContainerLifecycle(_) => 5,
            Self::SshExhausted { .. } => 6,
            Self::NotInTmux => 7,
            Self::MissingTool(_) => 8,
            Self::Interrupted => 130,
        }
    }
}

/// Exit code for an error chain; `1` when no [`LabError`] is attached.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<LabError>())
        .map(LabError::exit_code)
        .unwrap_or(1)
}

/// True when the chain was caused by the process interrupt.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<LabError>(), Some(LabError::Interrupted)))
}
