//! Phase barrier: metamenu cases wait for the bootlist group.
//!
//! Both signals are broadcast by closing a channel. A closed channel wakes
//! every receiver, present and future, so late waiters never miss the signal
//! and no flag needs polling. "Started" closes when the single bootlist entry
//! point is claimed; "finished" closes when its guard drops, on every exit path.

#![allow(missing_docs)]

use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

/// Why a metamenu waiter was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Release {
    /// The bootlist group started and has finished.
    AfterBootlist,
    /// No bootlist group started within the grace period.
    GraceElapsed,
}

impl Release {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AfterBootlist => "after_bootlist",
            Self::GraceElapsed => "grace_elapsed",
        }
    }
}

/// One-shot, single-writer broadcast between the two phase groups.
#[derive(Debug)]
pub struct PhaseBarrier {
    started_tx: Mutex<Option<Sender<()>>>,
    started_rx: Receiver<()>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

/// Held by the bootlist group while it runs. Dropping it releases waiters.
#[derive(Debug)]
#[must_use = "dropping the guard immediately signals that the bootlist group finished"]
pub struct BootlistGuard {
    _done: Sender<()>,
}

impl Default for PhaseBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseBarrier {
    #[must_use]
    pub fn new() -> Self {
        let (started_tx, started_rx) = channel::bounded(0);
        let (done_tx, done_rx) = channel::bounded(0);
        Self {
            started_tx: Mutex::new(Some(started_tx)),
            started_rx,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
        }
    }

    /// Claim the bootlist entry point and broadcast "started".
    ///
    /// Only the first caller gets a guard; later calls return `None`.
    pub fn enter_bootlist(&self) -> Option<BootlistGuard> {
        let done = self.done_tx.lock().take()?;
        drop(self.started_tx.lock().take());
        Some(BootlistGuard { _done: done })
    }

    /// Whether the bootlist group has been observed to start.
    #[must_use]
    pub fn bootlist_started(&self) -> bool {
        matches!(
            self.started_rx.try_recv(),
            Err(channel::TryRecvError::Disconnected)
        )
    }

    /// Block until the bootlist group has started and finished, or until
    /// `grace` passes without it starting. Never waits indefinitely for a
    /// group that was filtered out of the run.
    pub fn wait_for_bootlist(&self, grace: Duration) -> Release {
        let deadline = Instant::now() + grace;
        channel::select! {
            recv(self.started_rx) -> _ => {
                let _ = self.done_rx.recv();
                Release::AfterBootlist
            }
            recv(channel::at(deadline)) -> _ => {
                if self.bootlist_started() {
                    let _ = self.done_rx.recv();
                    Release::AfterBootlist
                } else {
                    Release::GraceElapsed
                }
            }
        }
    }
}
