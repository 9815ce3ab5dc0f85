//! Completion tokens for key watches.

use tokio::sync::watch;

/// Creates a connected completion pair.
pub(crate) fn completion_pair() -> (WatchHandle, WatchToken) {
    let (tx, rx) = watch::channel(false);
    (WatchHandle { tx }, WatchToken { rx, cancelled: false })
}

/// The producer half, held by the node core (or the fallback controller).
///
/// Dropping the handle without completing it completes the token spuriously,
/// which is exactly the behavior required on shutdown and migration.
#[derive(Debug)]
pub(crate) struct WatchHandle {
    tx: watch::Sender<bool>,
}

impl WatchHandle {
    pub fn complete(&self) {
        let _ = self.tx.send(true);
    }
}

/// A cancelable completion token returned by key watches.
///
/// The token completes when the watched key is mutated by a committed log
/// entry, and may complete spuriously — in particular on node shutdown or on
/// a fallback migration. Watchers must re-check the watched condition after
/// completion.
#[derive(Debug)]
pub struct WatchToken {
    rx: watch::Receiver<bool>,
    cancelled: bool,
}

impl WatchToken {
    /// Wait until the token completes (possibly spuriously) or is cancelled.
    pub async fn completed(&mut self) {
        if self.cancelled {
            return;
        }
        loop {
            if *self.rx.borrow() {
                return;
            }
            // A closed channel means the producer went away; treat it as a
            // spurious completion.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// True if the token has already completed.
    pub fn is_completed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Cancel the token; a cancelled token completes immediately.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_on_signal() {
        let (handle, mut token) = completion_pair();
        handle.complete();
        token.completed().await;
        assert!(token.is_completed());
    }

    #[tokio::test]
    async fn completes_spuriously_when_producer_drops() {
        let (handle, mut token) = completion_pair();
        drop(handle);
        token.completed().await;
        assert!(!token.is_completed());
    }

    #[tokio::test]
    async fn cancel_completes_immediately() {
        let (_handle, mut token) = completion_pair();
        token.cancel();
        token.completed().await;
    }
}
