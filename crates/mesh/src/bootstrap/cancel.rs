//! Cancellation of a running modern bootstrap handshake.
//!
//! Each handshake gets a fresh [`CancelToken`]. Every wait of the handshake
//! races against it, so a cancel resolves the pending wait early with the
//! reason attached. The reason is sticky: only the first cancel counts.

use crate::command::KexFailType;
use tokio::sync::watch;

pub(crate) fn cancel_pair() -> (CancelSender, CancelToken) {
    let (tx, rx) = watch::channel(None);
    (CancelSender(tx), CancelToken(rx))
}

/// Sending half, held by the controller state while the handshake runs.
#[derive(Debug)]
pub(crate) struct CancelSender(watch::Sender<Option<KexFailType>>);

impl CancelSender {
    /// Request cancellation. Returns `false` if it was already canceled.
    pub(crate) fn cancel(&self, reason: KexFailType) -> bool {
        self.0.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }
}

/// Receiving half, owned by the handshake.
pub(crate) struct CancelToken(watch::Receiver<Option<KexFailType>>);

impl CancelToken {
    /// Resolves with the reason once the handshake is canceled.
    pub(crate) async fn cancelled(&mut self) -> KexFailType {
        loop {
            if let Some(reason) = *self.0.borrow_and_update() {
                return reason;
            }
            if self.0.changed().await.is_err() {
                // sender gone without a cancel
                return std::future::pending().await;
            }
        }
    }

    /// Reason if already canceled.
    pub(crate) fn reason(&self) -> Option<KexFailType> {
        *self.0.borrow()
    }
}
