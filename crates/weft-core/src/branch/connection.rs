//! A live, authenticated session with one peer.
//!
//! The connection owns the framed transport: it emits heartbeats at half
//! the *peer's* declared timeout (inside the transport's writer), reads
//! frames continuously, hands decoded messages to the registered receive
//! handler, and invokes the session handler exactly once when the session
//! ends — with the kind-tagged reason.
//!
//! Liveness is the mirror of heartbeat emission: if nothing (not even a
//! heartbeat) arrives within our own declared timeout, the session dies
//! with *timeout* and is never used for further sends.

use crate::branch::connect::Established;
use crate::branch::info::{LocalBranchInfo, RemoteBranchInfo};
use crate::error::{Error, Result};
use crate::transport::msg::{MessageTransport, SendTag};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use weft_wire::Message;

type CloseHandler = Box<dyn FnOnce(Error) + Send>;

struct ConnShared {
    tx: MessageTransport,
    on_close: Mutex<Option<CloseHandler>>,
}

impl ConnShared {
    /// Deliver the session error exactly once and stop the transport.
    fn shut_down(&self, reason: Error) {
        let handler = self.on_close.lock().unwrap().take();
        self.tx.close(reason.clone());
        if let Some(handler) = handler {
            handler(reason);
        }
    }
}

/// Handle to a running session.
pub struct BranchConnection {
    remote: Arc<RemoteBranchInfo>,
    connected_since: DateTime<Utc>,
    shared: Arc<ConnShared>,
    recv_task: tokio::task::JoinHandle<()>,
}

impl BranchConnection {
    /// Start the session over an established transport.
    ///
    /// `on_message` receives every inbound non-heartbeat message;
    /// `on_close` runs exactly once with the reason the session ended.
    /// An error latched during the handshake ack exchange surfaces here
    /// instead of starting the session.
    pub fn start(
        established: Established,
        local: &LocalBranchInfo,
        on_message: impl FnMut(Message) + Send + 'static,
        on_close: impl FnOnce(Error) + Send + 'static,
    ) -> BranchConnection {
        let Established { transport, remote, next_result } = established;
        let remote = Arc::new(remote);
        let connected_since = remote.connected_since;

        let (tx, mut rx) = MessageTransport::start(
            transport,
            local.info.tx_queue_size,
            Some(remote.info.heartbeat_interval()),
            local.info.rx_queue_size,
        );
        let shared = Arc::new(ConnShared {
            tx,
            on_close: Mutex::new(Some(Box::new(on_close))),
        });

        let liveness = local.info.timeout;
        let recv_shared = Arc::clone(&shared);
        let peer = remote.info.to_string();
        let recv_task = tokio::spawn(async move {
            let mut on_message = on_message;
            loop {
                let received =
                    match tokio::time::timeout(liveness, rx.next_message()).await {
                        Err(_) => {
                            warn!(%peer, "no message within the session timeout");
                            recv_shared.shut_down(Error::Timeout);
                            return;
                        }
                        Ok(Err(err)) => {
                            debug!(%peer, error = %err, "session receive failed");
                            recv_shared.shut_down(err);
                            return;
                        }
                        Ok(Ok(msg)) => msg,
                    };
                match received {
                    // Any frame counts as liveness; heartbeats carry nothing else.
                    Message::Heartbeat => {}
                    msg => on_message(msg),
                }
            }
        });

        let conn = BranchConnection { remote, connected_since, shared, recv_task };
        if let Some(err) = next_result {
            conn.close(err);
        }
        conn
    }

    pub fn remote(&self) -> &Arc<RemoteBranchInfo> {
        &self.remote
    }

    pub fn connected_since(&self) -> DateTime<Utc> {
        self.connected_since
    }

    /// Accept a message into the transmit queue if it fits right now.
    pub fn try_send(&self, msg: &Message) -> Result<bool> {
        self.shared.tx.try_send(msg)
    }

    /// Queue a message, waiting for space; an optional tag makes the send
    /// cancellable while it has not begun transmission.
    pub fn send_async(
        &self,
        msg: &Message,
        tag: Option<SendTag>,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        self.shared.tx.send_async(msg, tag)
    }

    /// Withdraw a tagged send that has not begun transmission.
    pub fn cancel_send(&self, tag: SendTag) -> bool {
        // A partially transmitted frame reports busy; that is not a
        // cancellation.
        matches!(self.shared.tx.cancel(tag), Ok(true))
    }

    /// End the session deliberately; the session handler observes `reason`.
    pub fn close(&self, reason: Error) {
        self.shared.shut_down(reason);
        self.recv_task.abort();
    }

    /// Whether the session has already ended (handler fired).
    pub fn is_closed(&self) -> bool {
        self.shared.tx.is_closed()
    }
}

impl Drop for BranchConnection {
    fn drop(&mut self) {
        self.shared.shut_down(Error::Canceled);
        self.recv_task.abort();
    }
}
