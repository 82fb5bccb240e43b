//! Host tool checks run before anything touches docker.
//!
//! # Example
//!
//! ```rust,ignore
//! use like_dbg::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("tmux") {
//!     println!("tmux not installed");
//! }
//! check_required_tools(&[("docker", "docker.io")])?;
//! ```

use anyhow::Result;

use crate::error::LabError;

/// Check if a command exists in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools needed to talk to the container engine at all (`--kill`).
///
/// Each tuple is (command_name, package_name).
pub const CONTAINER_TOOLS: &[(&str, &str)] = &[("docker", "docker.io")];

/// Tools the build stages shell out to.
pub const BUILD_TOOLS: &[(&str, &str)] = &[
    ("ssh", "openssh-client"),
    ("ssh-keygen", "openssh-client"),
    ("curl", "curl"),
];

/// Tools the debug session needs on top of the build tools.
pub const SESSION_TOOLS: &[(&str, &str)] = &[("tmux", "tmux"), ("file", "file")];

/// Fail with [`LabError::MissingTool`] naming every tool that is missing.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("{} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        return Err(LabError::MissingTool(missing.join(", ")).into());
    }
    Ok(())
}

/// Check the tools a pipeline run needs; `session` adds [`SESSION_TOOLS`].
pub fn check_host_tools(session: bool) -> Result<()> {
    let mut tools = [CONTAINER_TOOLS, BUILD_TOOLS].concat();
    if session {
        tools.extend_from_slice(SESSION_TOOLS);
    }
    check_required_tools(&tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::exit_code_for;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("sh", "dash"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn session_tools_are_only_checked_for_sessions() {
        let all = [CONTAINER_TOOLS, BUILD_TOOLS].concat();
        assert!(!all.iter().any(|(tool, _)| *tool == "tmux"));
        assert!(SESSION_TOOLS.iter().any(|(tool, _)| *tool == "tmux"));
    }

    #[test]
    fn test_missing_tools_are_all_named() {
        let tools = &[
            ("nonexistent_command_xyz", "fake-package"),
            ("sh", "dash"),
            ("another_missing_tool_abc", "other-package"),
        ];
        let err = check_required_tools(tools).unwrap_err();
        assert_eq!(exit_code_for(&err), 8);
        let msg = format!("{:#}", err);
        assert!(msg.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(msg.contains("another_missing_tool_abc"));
        assert!(!msg.contains("dash"));
    }
}
