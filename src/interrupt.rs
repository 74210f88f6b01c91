use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use log::warn;

/// What Ctrl-C does while a training loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// Leave the default signal disposition alone: the process dies.
    Abort,
    /// Finish the current step, then leave the loop and carry on.
    Stop,
}

impl FromStr for InterruptPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "abort" => Ok(InterruptPolicy::Abort),
            "stop" => Ok(InterruptPolicy::Stop),
            other => anyhow::bail!("Unknown interrupt policy {other:?} (expected abort|stop)"),
        }
    }
}

/// Flag polled by training loops between steps.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<FlagState>);

#[derive(Debug, Default)]
struct FlagState {
    raised: AtomicBool,
    armed: AtomicBool,
}

/// What the Ctrl-C handler does with one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Raise the flag and let the running loop wind down.
    StopLoop,
    /// No loop is listening, or the flag is already up: exit with status 130.
    Exit,
}

/// Keeps a [`StopFlag`] armed while a training loop runs.
#[derive(Debug)]
pub struct ArmedGuard<'a>(&'a StopFlag);

impl Drop for ArmedGuard<'_> {
    fn drop(&mut self) {
        self.0.0.armed.store(false, Ordering::SeqCst);
    }
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::SeqCst)
    }

    /// Marks a training loop as polling this flag until the guard drops.
    pub fn arm(&self) -> ArmedGuard<'_> {
        self.0.armed.store(true, Ordering::SeqCst);
        ArmedGuard(self)
    }

    /// Only the first signal during an armed loop is absorbed; any other one
    /// must terminate the process.
    pub fn on_signal(&self) -> SignalAction {
        if self.0.armed.load(Ordering::SeqCst) && !self.0.raised.swap(true, Ordering::SeqCst) {
            SignalAction::StopLoop
        } else {
            SignalAction::Exit
        }
    }
}

/// Returns the flag a training loop should poll. Under [`InterruptPolicy::Stop`]
/// a Ctrl-C handler is installed that raises it; a second Ctrl-C, or one that
/// arrives outside a training loop, exits with status 130. Under `Abort`
/// nothing is installed and the flag is never raised. The handler can only be
/// installed once per process.
pub fn install(policy: InterruptPolicy) -> Result<StopFlag> {
    let flag = StopFlag::new();
    if policy == InterruptPolicy::Stop {
        let handler_flag = flag.clone();
        ctrlc::set_handler(move || match handler_flag.on_signal() {
            SignalAction::StopLoop => {
                warn!("\n[!] Interrupt received, stopping after the current step");
            }
            SignalAction::Exit => {
                warn!("\n[!] Interrupted");
                std::process::exit(130);
            }
        })
        .context("Failed to install Ctrl-C handler")?;
    }
    Ok(flag)
}
