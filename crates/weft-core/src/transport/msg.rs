//! Framed message transport.
//!
//! Chunks a byte stream into self-delimiting frames and carries unrelated
//! sends in parallel with bounded memory.  One writer task per transport
//! drains a byte-bounded transmit queue; sends that do not fit wait in a
//! FIFO pending list and are promoted as transmitted bytes free space.
//! The writer doubles as the heartbeat emitter: when no frame has been
//! written for half the peer's declared timeout, it posts a heartbeat
//! frame.  Every successful send resets that timer.
//!
//! # Send contract
//! - `try_send` accepts iff the serialized frame fits in the remaining
//!   queue bytes and nothing is already waiting for space.
//! - `send_async` preserves call order even across full-queue episodes;
//!   its completion fires once the message is accepted into the queue.
//! - `cancel` withdraws a send by tag if and only if its transmission has
//!   not begun; a partially transmitted frame reports *busy* and is never
//!   cancelled.

use crate::error::{Error, Result};
use crate::transport::byte::{ByteStream, ByteTransport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::debug;
use weft_wire::message::HEARTBEAT_TYPE_ID;
use weft_wire::{FrameDecoder, Message};

/// Tag identifying a cancellable send; operation ids are used directly.
pub type SendTag = u64;

/// Frame bytes of a heartbeat: one-byte length prefix, type-id, no payload.
const HEARTBEAT_FRAME: [u8; 2] = [1, HEARTBEAT_TYPE_ID as u8];

struct Queued {
    frame: Vec<u8>,
    tag: Option<SendTag>,
}

struct Pending {
    frame: Vec<u8>,
    tag: Option<SendTag>,
    done: oneshot::Sender<Result<()>>,
}

struct TxState {
    queue: VecDeque<Queued>,
    queued_bytes: usize,
    pending: VecDeque<Pending>,
    /// Tag of the frame currently being written, if any.
    in_flight: Option<Option<SendTag>>,
    closed: Option<Error>,
}

struct Shared {
    capacity: usize,
    state: Mutex<TxState>,
    work: Notify,
}

/// Cloneable sending half of a framed transport.
#[derive(Clone)]
pub struct MessageTransport {
    shared: Arc<Shared>,
}

impl MessageTransport {
    /// Split `transport` and start the writer task.
    ///
    /// `heartbeat` is half the peer's declared timeout; `None` disables
    /// emission.  `rx_budget` bounds the size a received frame may declare.
    pub fn start(
        transport: ByteTransport,
        tx_capacity: usize,
        heartbeat: Option<Duration>,
        rx_budget: usize,
    ) -> (MessageTransport, MessageReceiver) {
        let (read, write) = transport.into_split();
        let shared = Arc::new(Shared {
            capacity: tx_capacity,
            state: Mutex::new(TxState {
                queue: VecDeque::new(),
                queued_bytes: 0,
                pending: VecDeque::new(),
                in_flight: None,
                closed: None,
            }),
            work: Notify::new(),
        });
        tokio::spawn(run_writer(Arc::clone(&shared), write, heartbeat));
        (MessageTransport { shared }, MessageReceiver::new(read, rx_budget))
    }

    /// Accept `msg` into the transmit queue if it fits in the remaining
    /// bytes; reject without side effects otherwise.
    pub fn try_send(&self, msg: &Message) -> Result<bool> {
        let frame = self.encode_checked(msg)?;
        let mut st = self.shared.state.lock().unwrap();
        if let Some(err) = &st.closed {
            return Err(err.clone());
        }
        if !st.pending.is_empty() || frame.len() > self.shared.capacity - st.queued_bytes {
            return Ok(false);
        }
        st.queued_bytes += frame.len();
        st.queue.push_back(Queued { frame, tag: None });
        drop(st);
        self.shared.work.notify_one();
        Ok(true)
    }

    /// Enqueue `msg`, waiting for queue space if necessary.
    ///
    /// The returned future resolves once the message has been accepted into
    /// the transmit queue (or the send was cancelled / the transport
    /// closed).  Messages are transmitted in `send_async` call order.
    pub fn send_async(
        &self,
        msg: &Message,
        tag: Option<SendTag>,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let (done_tx, done_rx) = oneshot::channel();
        match self.encode_checked(msg) {
            Err(err) => {
                let _ = done_tx.send(Err(err));
            }
            Ok(frame) => {
                let mut st = self.shared.state.lock().unwrap();
                if let Some(err) = &st.closed {
                    let _ = done_tx.send(Err(err.clone()));
                } else if st.pending.is_empty()
                    && frame.len() <= self.shared.capacity - st.queued_bytes
                {
                    st.queued_bytes += frame.len();
                    st.queue.push_back(Queued { frame, tag });
                    let _ = done_tx.send(Ok(()));
                    drop(st);
                    self.shared.work.notify_one();
                } else {
                    st.pending.push_back(Pending { frame, tag, done: done_tx });
                }
            }
        }
        async move { done_rx.await.unwrap_or(Err(Error::Canceled)) }
    }

    /// Withdraw the send carrying `tag`.
    ///
    /// `Ok(true)` if a waiting or queued frame was removed, `Ok(false)` if
    /// no such tag is known (already transmitted, or never sent), and
    /// [`Error::Busy`] if the frame is being written right now.
    pub fn cancel(&self, tag: SendTag) -> Result<bool> {
        let mut st = self.shared.state.lock().unwrap();
        if st.in_flight == Some(Some(tag)) {
            return Err(Error::Busy);
        }
        if let Some(pos) = st.pending.iter().position(|p| p.tag == Some(tag)) {
            let pending = st.pending.remove(pos).unwrap();
            let _ = pending.done.send(Err(Error::Canceled));
            return Ok(true);
        }
        if let Some(pos) = st.queue.iter().position(|q| q.tag == Some(tag)) {
            let queued = st.queue.remove(pos).unwrap();
            st.queued_bytes -= queued.frame.len();
            return Ok(true);
        }
        Ok(false)
    }

    /// Tear the transport down; every waiting send completes with `err`.
    pub fn close(&self, err: Error) {
        let mut st = self.shared.state.lock().unwrap();
        if st.closed.is_some() {
            return;
        }
        st.closed = Some(err.clone());
        for pending in st.pending.drain(..) {
            let _ = pending.done.send(Err(err.clone()));
        }
        st.queue.clear();
        st.queued_bytes = 0;
        drop(st);
        self.shared.work.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed.is_some()
    }

    fn encode_checked(&self, msg: &Message) -> Result<Vec<u8>> {
        let mut frame = Vec::new();
        msg.encode_frame(&mut frame)?;
        if frame.len() > self.shared.capacity {
            return Err(Error::PayloadTooLarge {
                size: frame.len(),
                max: self.shared.capacity,
            });
        }
        Ok(frame)
    }
}

async fn run_writer(
    shared: Arc<Shared>,
    mut write: WriteHalf<Box<dyn ByteStream>>,
    heartbeat: Option<Duration>,
) {
    let mut last_send = Instant::now();
    loop {
        let next = {
            let mut st = shared.state.lock().unwrap();
            if st.closed.is_some() {
                return;
            }
            let next = st.queue.pop_front();
            if let Some(q) = &next {
                st.in_flight = Some(q.tag);
            }
            next
        };
        match next {
            Some(q) => {
                if write_frame(&mut write, &q.frame).await.is_err() {
                    shared.close_from_writer();
                    return;
                }
                last_send = Instant::now();
                let mut st = shared.state.lock().unwrap();
                if st.closed.is_some() {
                    // close() already reset the accounting.
                    return;
                }
                st.in_flight = None;
                st.queued_bytes -= q.frame.len();
                promote_pending(&mut st, shared.capacity);
            }
            None => match heartbeat {
                Some(interval) => {
                    tokio::select! {
                        () = shared.work.notified() => {}
                        () = tokio::time::sleep_until(last_send + interval) => {
                            debug!("transmit queue idle, posting heartbeat");
                            if write_frame(&mut write, &HEARTBEAT_FRAME).await.is_err() {
                                shared.close_from_writer();
                                return;
                            }
                            last_send = Instant::now();
                        }
                    }
                }
                None => shared.work.notified().await,
            },
        }
    }
}

async fn write_frame(
    write: &mut WriteHalf<Box<dyn ByteStream>>,
    frame: &[u8],
) -> std::io::Result<()> {
    write.write_all(frame).await?;
    write.flush().await
}

/// Move waiting sends into the queue, in arrival order, while they fit.
fn promote_pending(st: &mut TxState, capacity: usize) {
    while let Some(pending) = st.pending.front() {
        if pending.frame.len() > capacity - st.queued_bytes {
            break;
        }
        let pending = st.pending.pop_front().unwrap();
        st.queued_bytes += pending.frame.len();
        st.queue.push_back(Queued { frame: pending.frame, tag: pending.tag });
        let _ = pending.done.send(Ok(()));
    }
}

impl Shared {
    fn close_from_writer(&self) {
        let mut st = self.state.lock().unwrap();
        if st.closed.is_none() {
            st.closed = Some(Error::ConnectionClosed("write failed".to_owned()));
            let err = st.closed.clone().unwrap();
            for pending in st.pending.drain(..) {
                let _ = pending.done.send(Err(err.clone()));
            }
            st.queue.clear();
            st.queued_bytes = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// Receiving half
// ---------------------------------------------------------------------------

/// Reads frames off the byte stream, one at a time.
pub struct MessageReceiver {
    read: ReadHalf<Box<dyn ByteStream>>,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl MessageReceiver {
    fn new(read: ReadHalf<Box<dyn ByteStream>>, rx_budget: usize) -> Self {
        MessageReceiver { read, decoder: FrameDecoder::new(rx_budget), chunk: vec![0u8; 4096] }
    }

    /// The next complete frame body (type-id plus payload).
    pub async fn next_body(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(body) = self.decoder.next_frame()? {
                return Ok(body);
            }
            let n = self.read.read(&mut self.chunk).await.map_err(|e| Error::from_io(&e))?;
            if n == 0 {
                return Err(Error::ConnectionClosed("peer closed the stream".to_owned()));
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }

    /// The next decoded message.
    pub async fn next_message(&mut self) -> Result<Message> {
        let body = self.next_body().await?;
        Ok(Message::decode(&body)?)
    }
}
