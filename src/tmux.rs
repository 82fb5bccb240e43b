//! tmux pane control for the debug session.
//!
//! The session uses three panes in one window: pane 0 stays with the
//! operator, pane 1 runs the debuggee and pane 2 the debugger.

use anyhow::Result;

use crate::error::LabError;
use crate::process::Cmd;

pub const WINDOW_NAME: &str = "LIKE-DBG";
pub const OPERATOR_PANE: u32 = 0;
pub const DEBUGGEE_PANE: u32 = 1;
pub const DEBUGGER_PANE: u32 = 2;

/// Issues tmux commands.
pub trait Tmux {
    /// Run `tmux <args>`; `args` is a shell fragment.
    fn command(&self, args: &str) -> Result<()>;

    /// Type `line` into the selected pane and press enter.
    fn send_line(&self, line: &str) -> Result<()> {
        self.command(&format!("send-keys '{}' C-m", line))
    }

    fn select_pane(&self, pane: u32) -> Result<()> {
        self.command(&format!("selectp -t {}", pane))
    }

    /// Split the current window into the three session panes.
    fn setup_layout(&self) -> Result<()> {
        for args in [
            "selectp -t 0".to_string(),
            format!("rename-window {}", WINDOW_NAME),
            "splitw -h -p 50".to_string(),
            "selectp -t 0".to_string(),
            "splitw -v -p 50".to_string(),
            "selectp -t 0".to_string(),
        ] {
            self.command(&args)?;
        }
        Ok(())
    }
}

/// Fail unless this process runs inside a tmux session.
pub fn require_tmux() -> Result<()> {
    match std::env::var_os("TMUX") {
        Some(v) if !v.is_empty() => Ok(()),
        _ => Err(LabError::NotInTmux.into()),
    }
}

/// [`Tmux`] via the `tmux` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct TmuxCli;

impl Tmux for TmuxCli {
    fn command(&self, args: &str) -> Result<()> {
        tracing::debug!("tmux {}", args);
        Cmd::new("sh")
            .arg("-c")
            .arg(format!("tmux {} > /dev/null", args))
            .error_msg(format!("tmux {}", args))
            .run()?;
        Ok(())
    }
}
