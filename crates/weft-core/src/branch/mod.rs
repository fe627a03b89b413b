//! Branches: the participants of the mesh.
//!
//! A branch binds a TCP listener, advertises itself over UDP multicast,
//! dials every beacon it observes, runs the five-step handshake on every
//! new transport, and admits the resulting sessions through the connection
//! manager.  Admitted sessions carry broadcasts; branch events report the
//! comings and goings of peers.

pub mod advertise;
pub mod broadcast;
pub mod connect;
pub mod connection;
pub mod info;
pub mod manager;

use crate::config::BranchConfig;
use crate::error::{Error, Result};
use crate::transport::byte::{ByteTransport, with_deadline};
use broadcast::{BroadcastManager, OperationId};
use chrono::{DateTime, Utc};
use connect::{Established, establish, hash_password};
use connection::BranchConnection;
use info::LocalBranchInfo;
use manager::{Admission, ConnectOrigin, ConnectionManager};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{broadcast as tokio_broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use weft_wire::Message;

/// Observable changes in the peer set.
#[derive(Debug, Clone)]
pub enum BranchEvent {
    /// A beacon from an unknown peer arrived.
    PeerDiscovered { uuid: Uuid, tcp_ep: SocketAddr },
    /// A session completed the handshake and was admitted.
    PeerConnected { uuid: Uuid, name: String, tcp_ep: SocketAddr },
    /// An admitted session ended.
    PeerDisconnected { uuid: Uuid, reason: Error },
}

/// Point-in-time view of one connected peer.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub uuid: Uuid,
    pub name: String,
    pub tcp_ep: SocketAddr,
    pub connected_since: DateTime<Utc>,
}

struct BranchInner {
    local: Arc<LocalBranchInfo>,
    password_hash: [u8; 32],
    manager: Mutex<ConnectionManager>,
    broadcast: Arc<BroadcastManager>,
    events: tokio_broadcast::Sender<BranchEvent>,
    session_seq: AtomicU64,
    next_oid: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A participant in the mesh.
pub struct Branch {
    inner: Arc<BranchInner>,
}

impl Branch {
    /// Bind, start advertising and accepting, and return the live branch.
    pub async fn create(cfg: BranchConfig) -> Result<Branch> {
        cfg.validate().map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let listener = TcpListener::bind((cfg.listen_address.as_str(), cfg.listen_port))
            .await
            .map_err(|e| Error::BindSocketFailed(e.to_string()))?;
        let tcp_ep = listener
            .local_addr()
            .map_err(|e| Error::BindSocketFailed(e.to_string()))?;

        let local = Arc::new(LocalBranchInfo::new(&cfg, tcp_ep)?);
        let (events, _) = tokio_broadcast::channel(64);
        let inner = Arc::new(BranchInner {
            local: Arc::clone(&local),
            password_hash: hash_password(&cfg.network_password),
            manager: Mutex::new(ConnectionManager::new()),
            broadcast: Arc::new(BroadcastManager::new()),
            events,
            session_seq: AtomicU64::new(0),
            next_oid: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        // Accept loop.
        let weak = Arc::downgrade(&inner);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return;
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let transport = ByteTransport::from_tcp(stream);
                    match handshake(&inner, transport, peer).await {
                        Ok(est) => {
                            admit_session(&inner, est, ConnectOrigin::Accepted);
                        }
                        Err(err) => debug!(peer = %peer, error = %err, "inbound handshake failed"),
                    }
                });
            }
        });
        inner.tasks.lock().unwrap().push(accept_task);

        // Advertising, both directions.  An interval of -1 opts the branch
        // out of discovery entirely; direct connects still work.
        if local.info.adv_interval.is_some() {
            if let Some(task) = advertise::start_sender(Arc::clone(&local))? {
                inner.tasks.lock().unwrap().push(task);
            }
            let weak = Arc::downgrade(&inner);
            let (recv_task, _) = advertise::start_receiver(Arc::clone(&local), move |uuid, ep| {
                if let Some(inner) = weak.upgrade() {
                    on_beacon(&inner, uuid, ep);
                }
            })?;
            inner.tasks.lock().unwrap().push(recv_task);
        }

        info!(branch = %local.info, name = %local.info.name, ep = %tcp_ep, "branch created");
        Ok(Branch { inner })
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.local.info.uuid
    }

    pub fn info(&self) -> &Arc<LocalBranchInfo> {
        &self.inner.local
    }

    /// The endpoint peers connect to.
    pub fn tcp_ep(&self) -> SocketAddr {
        self.inner.local.info.tcp_ep
    }

    /// Subscribe to peer events.
    pub fn events(&self) -> tokio_broadcast::Receiver<BranchEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of all connected peers.
    pub fn connected_peers(&self) -> Vec<PeerSnapshot> {
        self.inner
            .manager
            .lock()
            .unwrap()
            .running()
            .iter()
            .map(|conn| PeerSnapshot {
                uuid: conn.remote().info.uuid,
                name: conn.remote().info.name.clone(),
                tcp_ep: conn.remote().info.tcp_ep,
                connected_since: conn.connected_since(),
            })
            .collect()
    }

    /// Dial a peer endpoint directly, bypassing discovery.
    pub async fn connect_to(&self, ep: SocketAddr) -> Result<()> {
        let transport =
            ByteTransport::connect_tcp(ep, self.inner.local.info.timeout).await?;
        let est = handshake(&self.inner, transport, ep).await?;
        if admit_session(&self.inner, est, ConnectOrigin::Dialed) {
            Ok(())
        } else {
            Err(Error::DuplicateConnection)
        }
    }

    /// Deliver one payload to every live session and wait for the
    /// composite result.
    pub async fn send_broadcast(&self, payload: Vec<u8>, retry: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send_broadcast_async(payload, retry, move |res| {
            let _ = tx.send(res);
        });
        rx.await.unwrap_or(Err(Error::Canceled))
    }

    /// Async broadcast; returns the operation id usable with
    /// [`Branch::cancel_send_broadcast`].
    pub fn send_broadcast_async(
        &self,
        payload: Vec<u8>,
        retry: bool,
        handler: impl FnOnce(Result<()>) + Send + 'static,
    ) -> OperationId {
        let oid = self.inner.next_oid.fetch_add(1, Ordering::Relaxed);
        // Ghost-mode peers participate in the mesh but are excluded from
        // broadcasts.
        let sessions: Vec<_> = self
            .inner
            .manager
            .lock()
            .unwrap()
            .running()
            .into_iter()
            .filter(|conn| !conn.remote().info.ghost_mode)
            .collect();
        self.inner.broadcast.send_async(sessions, payload, retry, oid, handler);
        oid
    }

    /// Withdraw a pending broadcast.  True if at least one session
    /// reported a cancellation.
    pub fn cancel_send_broadcast(&self, oid: OperationId) -> bool {
        let sessions = self.inner.manager.lock().unwrap().running();
        self.inner.broadcast.cancel_send(&sessions, oid)
    }

    /// Await the next inbound broadcast as `(sender identity, payload)`.
    ///
    /// The receiver is armed before this returns, so a broadcast arriving
    /// between the call and the await is not lost.  Arming a second
    /// receive cancels a pending one.
    pub fn receive_broadcast(
        &self,
    ) -> impl Future<Output = Result<(Uuid, Vec<u8>)>> + Send + use<> {
        self.inner.broadcast.receive()
    }

    /// Like [`Branch::receive_broadcast`] but into a caller buffer.  A
    /// payload larger than the buffer fails with *buffer-too-small*; the
    /// broadcast still counts as received.
    pub fn receive_broadcast_into<'buf>(
        &self,
        buf: &'buf mut [u8],
    ) -> impl Future<Output = Result<(Uuid, usize)>> + Send + 'buf {
        let armed = self.inner.broadcast.receive();
        async move {
            let (from, data) = armed.await?;
            if data.len() > buf.len() {
                return Err(Error::BufferTooSmall { needed: data.len() });
            }
            buf[..data.len()].copy_from_slice(&data);
            Ok((from, data.len()))
        }
    }

    pub fn cancel_receive_broadcast(&self) -> bool {
        self.inner.broadcast.cancel_receive()
    }

    /// Stop advertising, close every session, and fire pending handlers
    /// with *canceled*.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let sessions = self.inner.manager.lock().unwrap().drain();
        for conn in sessions {
            conn.close(Error::Canceled);
        }
        self.inner.broadcast.cancel_receive();
        info!(branch = %self.inner.local.info, "branch closed");
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Discovery → session plumbing
// ---------------------------------------------------------------------------

async fn handshake(
    inner: &Arc<BranchInner>,
    transport: ByteTransport,
    peer: SocketAddr,
) -> Result<Established> {
    with_deadline(
        inner.local.info.timeout,
        establish(transport, &inner.local, &inner.password_hash, peer.ip()),
    )
    .await?
}

fn on_beacon(inner: &Arc<BranchInner>, uuid: Uuid, tcp_ep: SocketAddr) {
    if !inner.manager.lock().unwrap().begin_connect(uuid) {
        return;
    }
    let _ = inner.events.send(BranchEvent::PeerDiscovered { uuid, tcp_ep });
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let result = async {
            let transport =
                ByteTransport::connect_tcp(tcp_ep, inner.local.info.timeout).await?;
            handshake(&inner, transport, tcp_ep).await
        }
        .await;
        inner.manager.lock().unwrap().finish_connect(uuid);
        match result {
            Ok(est) => {
                admit_session(&inner, est, ConnectOrigin::Dialed);
            }
            Err(err) => debug!(peer = %uuid, error = %err, "dial after beacon failed"),
        }
    });
}

/// Start a session over an established transport and offer it to the
/// manager.  Returns whether it was admitted.
fn admit_session(inner: &Arc<BranchInner>, est: Established, origin: ConnectOrigin) -> bool {
    let uuid = est.remote.info.uuid;
    let name = est.remote.info.name.clone();
    let tcp_ep = est.remote.info.tcp_ep;
    let seq = inner.session_seq.fetch_add(1, Ordering::Relaxed);

    let weak = Arc::downgrade(inner);
    let on_message = move |msg: Message| {
        let Some(inner) = weak.upgrade() else { return };
        match msg {
            Message::Broadcast { data } => inner.broadcast.on_received(uuid, data),
            other => {
                // Terminal traffic belongs to leaf sessions, not mesh ones.
                debug!(peer = %uuid, ?other, "ignoring terminal message on a branch session");
            }
        }
    };
    let weak = Arc::downgrade(inner);
    let on_close = move |err: Error| {
        let Some(inner) = weak.upgrade() else { return };
        on_session_closed(&inner, uuid, seq, &err);
    };

    let conn = Arc::new(BranchConnection::start(est, &inner.local, on_message, on_close));

    let admission = inner.manager.lock().unwrap().admit(
        &inner.local.info.uuid,
        uuid,
        seq,
        Arc::clone(&conn),
        origin,
    );
    match admission {
        Admission::Admitted { replaced } => {
            if let Some(old) = replaced {
                debug!(peer = %uuid, "replacing session that lost the duplicate tie-break");
                old.close(Error::DuplicateConnection);
            }
            // A handshake-latched error may have ended the session before
            // it joined the map; sweep the entry back out.
            if conn.is_closed() {
                on_session_closed(
                    inner,
                    uuid,
                    seq,
                    &Error::ConnectionClosed("session ended during admission".to_owned()),
                );
                return false;
            }
            info!(peer = %uuid, name = %name, ep = %tcp_ep, "session admitted");
            let _ = inner.events.send(BranchEvent::PeerConnected { uuid, name, tcp_ep });
            true
        }
        Admission::Rejected => {
            debug!(peer = %uuid, "rejecting duplicate session");
            conn.close(Error::DuplicateConnection);
            false
        }
    }
}

fn on_session_closed(inner: &Arc<BranchInner>, uuid: Uuid, seq: u64, err: &Error) {
    let removed = inner.manager.lock().unwrap().remove_if_seq(uuid, seq);
    if removed.is_some() {
        warn!(peer = %uuid, reason = %err, "session ended");
        let _ = inner
            .events
            .send(BranchEvent::PeerDisconnected { uuid, reason: err.clone() });
    }
}
