//! Process interrupt handling and bounded, cancellable polling.
//!
//! SIGINT/SIGTERM only flip an atomic flag. Long waits (health checks, SSH
//! connection attempts) sleep in short slices and check the flag between
//! slices, so an interrupt unwinds the pipeline with
//! [`LabError::Interrupted`] instead of killing the process mid-build.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use crate::error::LabError;

static INTERRUPTED: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Route SIGINT and SIGTERM to the process-wide interrupt flag.
pub fn install_interrupt_handler() -> Result<()> {
    for signum in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signum, Arc::clone(&INTERRUPTED))
            .with_context(|| format!("installing handler for signal {}", signum))?;
    }
    Ok(())
}

/// Handle on an interrupt flag.
#[derive(Debug, Clone, Copy)]
pub struct Cancellation {
    flag: &'static AtomicBool,
}

impl Cancellation {
    /// The flag set by [`install_interrupt_handler`].
    pub fn process() -> Self {
        let flag: &'static Arc<AtomicBool> = &INTERRUPTED;
        Self { flag }
    }

    /// A private flag no signal will ever set.
    pub fn detached() -> Self {
        Self {
            flag: Box::leak(Box::new(AtomicBool::new(false))),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Interrupted)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(LabError::Interrupted.into());
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early with `Err(Interrupted)`.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Retry bound for a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub delay: Duration,
}

impl Backoff {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Call `probe` until it yields a value or the attempts run out.
    ///
    /// `probe` receives the 1-based attempt number. Returns `Ok(None)` when
    /// every attempt came back empty; errors from `probe` abort the loop.
    pub fn poll<T>(
        &self,
        cancel: &Cancellation,
        mut probe: impl FnMut(u32) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        for attempt in 1..=self.attempts {
            cancel.check()?;
            if let Some(value) = probe(attempt)? {
                return Ok(Some(value));
            }
            if attempt < self.attempts {
                cancel.sleep(self.delay)?;
            }
        }
        Ok(None)
    }
}
