//! SIGINT/SIGTERM cancellation for a harness run.
//!
//! The handler only sets a flag. The process runner polls it, kills the
//! running generator's process group, and lets every guard unwind normally,
//! so a hidden binary is always restored before the process exits.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Cancellation flag wired to SIGINT and SIGTERM.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Create the flag and register the OS hooks.
    ///
    /// Registration is best-effort; failures are reported on stderr.
    pub fn install() -> Self {
        let signal = Self {
            flag: Arc::new(AtomicBool::new(false)),
        };
        for (name, sig) in [("SIGINT", SIGINT), ("SIGTERM", SIGTERM)] {
            if let Err(e) = signal_hook::flag::register(sig, Arc::clone(&signal.flag)) {
                eprintln!("[ZBH-SIGNAL] failed to register {name}: {e}");
            }
        }
        signal
    }

    /// Shared flag for the runner and the harness.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Programmatically request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}
