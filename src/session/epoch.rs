//! # Session Epochs
//!
//! An epoch is a generation number for "the current session attempt". Every start and
//! every stop advances it. Each asynchronous operation launched for a session receives
//! an [`EpochToken`] capturing the epoch it belongs to, and checks the token before it
//! applies any effect. A token whose epoch is no longer current is stale: its work is
//! dropped without touching session state.
//!
//! The counter is backed by a `tokio::sync::watch` channel so tokens can both check the
//! current value synchronously and `await` their own invalidation inside `select!`.

use tokio::sync::watch;

/// Owner side of the epoch counter. Only the session controller holds one.
#[derive(Debug)]
pub struct EpochCounter {
    tx: watch::Sender<u64>,
}

impl EpochCounter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// The epoch currently in force.
    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Move to the next epoch and return it.
    ///
    /// `send_modify` updates the value even when no token is listening, so the counter
    /// keeps advancing between sessions.
    pub fn advance(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|epoch| {
            *epoch += 1;
            next = *epoch;
        });
        next
    }

    /// A token bound to the epoch in force right now.
    pub fn token(&self) -> EpochToken {
        let rx = self.tx.subscribe();
        let captured = *rx.borrow();
        EpochToken { rx, captured }
    }
}

impl Default for EpochCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A captured epoch plus a view of the live counter.
#[derive(Debug, Clone)]
pub struct EpochToken {
    rx: watch::Receiver<u64>,
    captured: u64,
}

impl EpochToken {
    /// The epoch this token was issued for.
    pub fn epoch(&self) -> u64 {
        self.captured
    }

    /// True while no start/stop has happened since the token was issued.
    pub fn is_current(&self) -> bool {
        *self.rx.borrow() == self.captured
    }

    /// Resolves once the epoch has moved past the captured one.
    ///
    /// Also resolves if the counter itself is dropped, since a dropped controller can
    /// never make this epoch current again.
    pub async fn invalidated(&mut self) {
        let captured = self.captured;
        // wait_for checks the current value first, so an already stale token returns
        // immediately.
        let _ = self.rx.wait_for(|epoch| *epoch != captured).await;
    }
}
