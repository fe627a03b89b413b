//! Broadcast fan-out and the single inbound broadcast receiver.
//!
//! Outbound broadcasts go to every running session.  Without retry the
//! fan-out is all-or-nothing over `try_send`: one full transmit queue and
//! the whole operation reports *tx-queue-full* (the connections stay
//! alive).  With retry, rejected sessions get an async send tagged with
//! the operation id, and the completion handler fires only when the count
//! of pending per-session sends reaches zero — with *ok* if the operation
//! is still active, *canceled* if it was withdrawn meanwhile.
//!
//! Inbound broadcasts go to at most one pending receiver; arming a second
//! receiver cancels the first with *canceled* before taking its place.

use crate::branch::connection::BranchConnection;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;
use weft_wire::Message;

/// Identifies one outbound broadcast operation; doubles as the per-session
/// send tag so the whole operation can be withdrawn at once.
pub type OperationId = u64;

type RxSlot = oneshot::Sender<(Uuid, Vec<u8>)>;

#[derive(Default)]
struct BmState {
    active: HashSet<OperationId>,
    rx_pending: Option<RxSlot>,
}

#[derive(Default)]
pub struct BroadcastManager {
    state: Mutex<BmState>,
}

impl BroadcastManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan `payload` out to `sessions`; `handler` fires once with the
    /// composite result.
    ///
    /// Sessions already torn down are skipped — delivery during a peer's
    /// crash is best-effort by design.
    pub fn send_async(
        self: &Arc<Self>,
        sessions: Vec<Arc<BranchConnection>>,
        payload: Vec<u8>,
        retry: bool,
        oid: OperationId,
        handler: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let msg = Message::Broadcast { data: payload };

        if !retry {
            let mut all_sent = true;
            for conn in &sessions {
                match conn.try_send(&msg) {
                    Ok(true) => {}
                    Ok(false) => all_sent = false,
                    Err(err) => {
                        debug!(peer = %conn.remote().info, error = %err, "skipping dead session");
                    }
                }
            }
            handler(if all_sent { Ok(()) } else { Err(Error::TxQueueFull) });
            return;
        }

        let mut pending = Vec::new();
        for conn in &sessions {
            match conn.try_send(&msg) {
                Ok(true) => {}
                Ok(false) => pending.push(conn.send_async(&msg, Some(oid))),
                Err(err) => {
                    debug!(peer = %conn.remote().info, error = %err, "skipping dead session");
                }
            }
        }
        if pending.is_empty() {
            handler(Ok(()));
            return;
        }

        self.state.lock().unwrap().active.insert(oid);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            // Individual outcomes do not matter here; the contract is that
            // the handler fires once the pending count reaches zero.
            for send in pending {
                let _ = send.await;
            }
            let still_active = manager.state.lock().unwrap().active.remove(&oid);
            handler(if still_active { Ok(()) } else { Err(Error::Canceled) });
        });
    }

    /// Withdraw operation `oid`: deactivate it and pull its tagged sends
    /// out of every session's queue.  True if at least one session
    /// reported a cancellation.
    pub fn cancel_send(&self, sessions: &[Arc<BranchConnection>], oid: OperationId) -> bool {
        if !self.state.lock().unwrap().active.remove(&oid) {
            return false;
        }
        let mut canceled = false;
        for conn in sessions {
            canceled |= conn.cancel_send(oid);
        }
        canceled
    }

    /// Arm the single broadcast receiver; a previously pending receive is
    /// cancelled first.
    pub fn receive(&self) -> impl Future<Output = Result<(Uuid, Vec<u8>)>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state.lock().unwrap();
            // Dropping the old sender fails the old future with Canceled.
            let _ = st.rx_pending.replace(tx);
        }
        async move { rx.await.map_err(|_| Error::Canceled) }
    }

    /// Disarm the pending receiver, if any; its future completes with
    /// *canceled*.
    pub fn cancel_receive(&self) -> bool {
        self.state.lock().unwrap().rx_pending.take().is_some()
    }

    /// Route an inbound broadcast to the pending receiver.
    pub fn on_received(&self, from: Uuid, data: Vec<u8>) {
        let slot = self.state.lock().unwrap().rx_pending.take();
        match slot {
            Some(tx) => {
                let _ = tx.send((from, data));
            }
            None => debug!(peer = %from, "broadcast dropped, no receiver pending"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_receive_cancels_the_first() {
        let bm = Arc::new(BroadcastManager::new());
        let first = bm.receive();
        let second = bm.receive();

        assert_eq!(first.await, Err(Error::Canceled));

        let from = Uuid::new_v4();
        bm.on_received(from, vec![1, 2]);
        assert_eq!(second.await, Ok((from, vec![1, 2])));
    }

    #[tokio::test]
    async fn cancel_receive_fires_canceled() {
        let bm = Arc::new(BroadcastManager::new());
        let armed = bm.receive();
        assert!(bm.cancel_receive());
        assert!(!bm.cancel_receive());
        assert_eq!(armed.await, Err(Error::Canceled));
    }

    #[tokio::test]
    async fn broadcast_without_receiver_is_dropped() {
        let bm = Arc::new(BroadcastManager::new());
        bm.on_received(Uuid::new_v4(), vec![9]);
        // Arming later must not observe the dropped payload.
        let armed = bm.receive();
        bm.on_received(Uuid::new_v4(), vec![1]);
        assert_eq!(armed.await.unwrap().1, vec![1]);
    }

    #[tokio::test]
    async fn fanout_to_zero_sessions_completes_ok() {
        let bm = Arc::new(BroadcastManager::new());
        let (tx, rx) = oneshot::channel();
        bm.send_async(Vec::new(), vec![1], true, 1, move |res| {
            tx.send(res).unwrap();
        });
        assert_eq!(rx.await.unwrap(), Ok(()));
        // Nothing was pending, so there is nothing to cancel.
        assert!(!bm.cancel_send(&[], 1));
    }
}
