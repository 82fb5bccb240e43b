//! Reuse policy for cached artifacts and container images.
//!
//! Every "keep or rebuild" decision in the pipeline goes through
//! [`ReusePolicy`], with one precedence for all artifacts:
//! update-mode > force-rebuild > skip-prompts > interactive/auto.

use anyhow::{Context, Result};
use std::io::{self, Write};

use crate::config::sections::ReuseMode;

/// Asks the operator whether an existing artifact should be kept.
pub trait Prompt {
    fn confirm_reuse(&self, what: &str) -> Result<bool>;
}

/// Reads `[Y/n]` answers from stdin. An empty answer (or EOF) means yes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn confirm_reuse(&self, what: &str) -> Result<bool> {
        write!(io::stderr(), "Found {}. Re-use it? [Y/n] ", what)?;
        io::stderr().flush()?;

        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .context("reading reuse answer from stdin")?;
        Ok(parse_answer(&input))
    }
}

fn parse_answer(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "" | "y" | "yes")
}

/// Run-wide switches feeding into [`ReusePolicy::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReuseFlags {
    /// `--update-containers`: rebuild images without cache, nothing else.
    pub update: bool,
    /// `--yes`: keep whatever exists without asking.
    pub skip_prompts: bool,
    pub mode: ReuseMode,
}

impl Default for ReuseFlags {
    fn default() -> Self {
        Self {
            update: false,
            skip_prompts: false,
            mode: ReuseMode::Interactive,
        }
    }
}

/// How an existing artifact is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReusePolicy {
    /// Container images only: no-cache rebuild.
    Update,
    ForceRebuild,
    SkipPrompts,
    Interactive,
    /// Keep when the freshness marker matches.
    Auto,
}

impl ReusePolicy {
    /// Collapse the run flags and a component's `force_rebuild` into one policy.
    pub fn resolve(flags: ReuseFlags, force_rebuild: bool) -> Self {
        if flags.update {
            Self::Update
        } else if force_rebuild {
            Self::ForceRebuild
        } else if flags.skip_prompts {
            Self::SkipPrompts
        } else {
            match flags.mode {
                ReuseMode::Interactive => Self::Interactive,
                ReuseMode::Auto => Self::Auto,
            }
        }
    }

    /// Decide whether the existing artifact `what` is kept.
    ///
    /// `fresh` is only evaluated in [`ReusePolicy::Auto`]; the prompt only in
    /// [`ReusePolicy::Interactive`].
    pub fn keep(
        self,
        what: &str,
        prompt: &dyn Prompt,
        fresh: impl FnOnce() -> bool,
    ) -> Result<bool> {
        let keep = match self {
            Self::Update | Self::ForceRebuild => false,
            Self::SkipPrompts => true,
            Self::Interactive => prompt.confirm_reuse(what)?,
            Self::Auto => fresh(),
        };
        if keep {
            tracing::debug!("reusing existing {}", what);
        } else {
            tracing::info!("discarding existing {} ({:?})", what, self);
        }
        Ok(keep)
    }
}
