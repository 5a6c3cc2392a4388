//! Campaign control signals — the approval latch and termination.
//!
//! Both are single-writer `watch` channels: the engine holds the writer, the
//! running saga and its step attempts hold readers.

use std::future;
use std::time::Duration;

use tokio::sync::watch;

// ── Approval ───────────────────────────────────────────────────

/// Writer half of the approval latch. Approving twice is a no-op.
#[derive(Debug)]
pub struct ApprovalLatch {
    tx: watch::Sender<bool>,
}

/// Reader half of the approval latch, awaited by the saga.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    rx: watch::Receiver<bool>,
}

/// The gate stayed closed for the whole window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalTimeout;

/// Create a latch, already open if the campaign was approved before a restart.
pub fn approval_latch(approved: bool) -> (ApprovalLatch, ApprovalGate) {
    let (tx, rx) = watch::channel(approved);
    (ApprovalLatch { tx }, ApprovalGate { rx })
}

impl ApprovalLatch {
    /// Open the latch. Returns true if this call flipped it.
    pub fn approve(&self) -> bool {
        self.tx.send_if_modified(|approved| {
            if *approved {
                false
            } else {
                *approved = true;
                true
            }
        })
    }

    pub fn is_approved(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ApprovalGate {
    pub fn is_approved(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until approved or until `window` elapses.
    pub async fn wait(&self, window: Duration) -> Result<(), ApprovalTimeout> {
        let mut rx = self.rx.clone();
        let approved = async move {
            if rx.wait_for(|approved| *approved).await.is_err() {
                // Writer gone: the latch can never open.
                future::pending::<()>().await;
            }
        };
        tokio::time::timeout(window, approved)
            .await
            .map_err(|_| ApprovalTimeout)
    }
}

// ── Termination ────────────────────────────────────────────────

/// Writer half of a campaign's termination signal.
#[derive(Debug)]
pub struct TerminationHandle {
    tx: watch::Sender<Option<String>>,
}

/// Reader half, observed by the saga and between step attempts.
#[derive(Debug, Clone)]
pub struct TerminationSignal {
    rx: watch::Receiver<Option<String>>,
}

pub fn termination() -> (TerminationHandle, TerminationSignal) {
    let (tx, rx) = watch::channel(None);
    (TerminationHandle { tx }, TerminationSignal { rx })
}

impl TerminationHandle {
    /// Request termination. The first reason wins; returns false if already
    /// terminated.
    pub fn terminate(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        })
    }
}

impl TerminationSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(None);
        Self { rx }
    }

    pub fn is_terminated(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve with the termination reason once termination is requested.
    /// Never resolves if the writer is dropped without terminating.
    pub async fn terminated(&self) -> String {
        let mut rx = self.rx.clone();
        let reason = match rx.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => future::pending().await,
        }
    }
}
