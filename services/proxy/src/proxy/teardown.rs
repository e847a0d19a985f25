//! One-shot session teardown.
//!
//! Both copy directions report when they end. Only the first report counts:
//! it wakes the coordinator, which waits out the grace period and then raises
//! the teardown flag that stops whatever is still running.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{watch, Notify};

/// Direction of a copy task within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client (EMR) to backend (forum).
    Upstream,
    /// Backend (forum) to client (EMR).
    Downstream,
}

impl Direction {
    /// Label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "emr->forum",
            Direction::Downstream => "forum->emr",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Teardown coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownState {
    /// Waiting for the first direction to end.
    Armed,
    /// Teardown raised; the session is closing.
    TornDown,
}

/// Signals shared by the copy tasks and the coordinator of one session.
#[derive(Debug)]
pub struct TeardownSignal {
    /// Set by the first direction to end.
    finished: AtomicBool,
    /// Wakes the coordinator. Holds a permit if nobody is waiting yet.
    first_finished: Notify,
    /// Teardown flag observed by both copy tasks.
    teardown_tx: watch::Sender<bool>,
}

impl TeardownSignal {
    /// Create an armed signal.
    pub fn new() -> Self {
        let (teardown_tx, _) = watch::channel(false);
        Self {
            finished: AtomicBool::new(false),
            first_finished: Notify::new(),
            teardown_tx,
        }
    }

    /// Report that a direction ended. Returns true only for the first report.
    pub fn side_finished(&self) -> bool {
        let first = self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.first_finished.notify_one();
        }
        first
    }

    /// Wait until some direction has ended.
    pub async fn wait_first_finished(&self) {
        self.first_finished.notified().await;
    }

    /// Raise the teardown flag.
    pub fn tear_down(&self) {
        self.teardown_tx.send_replace(true);
    }

    /// Receiver for the teardown flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.teardown_tx.subscribe()
    }

    /// Current coordinator state.
    pub fn state(&self) -> TeardownState {
        if *self.teardown_tx.borrow() {
            TeardownState::TornDown
        } else {
            TeardownState::Armed
        }
    }
}

impl Default for TeardownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once the flag behind `rx` is true or its sender is gone.
pub async fn raised(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
