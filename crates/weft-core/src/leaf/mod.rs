//! Leaves and their terminal state machines.
//!
//! A leaf is a grouping of terminals with a single upstream session.  Both
//! ends of a session run the same machine: they announce terminals and
//! bindings, map each other's announcements to local ids, evaluate which
//! of the peer's bindings match local terminals, and exchange
//! subscription, data, and scatter/gather traffic accordingly.
//!
//! Every operation is a *locked core* followed by deferred side-effects:
//! the core mutates [`LeafState`] under the mutex and records wire sends
//! and handler notifications into [`Effects`], which run strictly after
//! the lock is released.  User handlers can therefore call back into the
//! leaf without re-entrant locking.
//!
//! # Establishment and subscription flow
//! Binding state is owned by the terminal side: whoever hosts a terminal
//! matching a described binding reports `BindingEstablished` /
//! `BindingReleased` to the binding's owner.  On establishment, the
//! binding owner subscribes to every matching imported terminal; `Data`
//! payloads then flow addressed by the *receiver's* binding id, and
//! scatter requests by the *responder's* terminal id.

pub mod binding;
pub mod pattern;
pub mod terminal;

use crate::branch::connect::{Established, establish, hash_password};
use crate::branch::connection::BranchConnection;
use crate::branch::info::LocalBranchInfo;
use crate::config::BranchConfig;
use crate::error::{Error, Result};
use crate::transport::byte::{ByteTransport, with_deadline};
use pattern::TerminalRole;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use weft_wire::{GatherFlags, Id, IdRegister, Identifier, Message, Pattern, TerminalMsg};

/// Subscription state of a subscribable terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed,
}

/// State of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Released,
    Established,
}

/// One reply of a scatter-gather operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherReply {
    pub operation_id: Id,
    pub flags: GatherFlags,
    pub data: Vec<u8>,
}

/// A scattered request awaiting a response via
/// [`terminal::Terminal::respond`] or its siblings.
#[derive(Debug)]
pub struct ScatterRequest {
    pub operation_id: Id,
    pub data: Vec<u8>,
}

/// Gather handler; return false to abort the operation early.
pub type GatherHandler = Box<dyn FnMut(std::result::Result<GatherReply, Error>) -> bool + Send>;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Export {
    identifier: Identifier,
    role: TerminalRole,
    /// Peer's import id for this terminal, once mapped.
    mapped_id: Option<Id>,
    subscription: watch::Sender<SubscriptionState>,
    cache: Option<Vec<u8>>,
    published_tx: mpsc::UnboundedSender<Vec<u8>>,
    scatter_arm: Option<oneshot::Sender<ScatterRequest>>,
    removing: bool,
}

struct Import {
    identifier: Identifier,
    /// The terminal's id in the peer's own register.
    remote_id: Id,
    subscribed_by_us: bool,
    noticed: bool,
}

struct BindingRec {
    owner: Id,
    target: Identifier,
    /// Peer's record id for this binding, once mapped.
    mapped_id: Option<Id>,
    state: watch::Sender<BindingState>,
    removing: bool,
}

struct PeerBinding {
    target: Identifier,
    /// The binding's id in the peer's own register.
    remote_id: Id,
    established: bool,
    noticed: bool,
}

#[derive(Default)]
struct PatternState {
    exports: IdRegister<Export>,
    imports: IdRegister<Import>,
    bindings: IdRegister<BindingRec>,
    peer_bindings: IdRegister<PeerBinding>,
}

struct SgTask {
    pattern: Pattern,
    /// Responders that have not yet sent their finishing gather.
    remaining: usize,
    /// Taken out while the user handler runs; see `on_gather`.
    handler: Option<GatherHandler>,
    cancel_requested: bool,
}

struct LeafState {
    patterns: HashMap<Pattern, PatternState>,
    /// Outbound scatter-gather operations, keyed by operation id value.
    ops_out: HashMap<u64, SgTask>,
    /// Inbound scattered requests we owe a finishing gather, mapped to the
    /// responding terminal.
    ops_in: HashMap<u64, (Pattern, Id)>,
    op_ids: IdRegister<()>,
    closed: Option<Error>,
}

/// Wire sends and handler notifications collected under the lock and
/// executed after release.
#[derive(Default)]
struct Effects {
    sends: Vec<Message>,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
}

impl Effects {
    fn send(&mut self, pattern: Pattern, msg: TerminalMsg) {
        self.sends.push(Message::Terminal { pattern, msg });
    }
}

struct LeafInner {
    conn: BranchConnection,
    state: Mutex<LeafState>,
}

/// Channels and ids a freshly created terminal hands to its public handle.
pub(crate) struct TerminalParts {
    pub(crate) id: Id,
    pub(crate) sub_rx: watch::Receiver<SubscriptionState>,
    pub(crate) published_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub(crate) implicit: Option<(Id, watch::Receiver<BindingState>)>,
}

/// A grouping of terminals over one authenticated session.
#[derive(Clone)]
pub struct Leaf {
    inner: Arc<LeafInner>,
}

impl Leaf {
    /// Dial `addr` directly and run the handshake, bypassing discovery.
    pub async fn connect(addr: SocketAddr, cfg: &BranchConfig) -> Result<Leaf> {
        cfg.validate().map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let local = Arc::new(LocalBranchInfo::new(cfg, "0.0.0.0:0".parse().unwrap())?);
        let hash = hash_password(&cfg.network_password);
        let transport = ByteTransport::connect_tcp(addr, cfg.timeout_duration()).await?;
        let est = with_deadline(
            cfg.timeout_duration(),
            establish(transport, &local, &hash, addr.ip()),
        )
        .await??;
        Leaf::from_established(est, &local)
    }

    /// Wrap an already established session into a leaf.
    pub fn from_established(est: Established, local: &Arc<LocalBranchInfo>) -> Result<Leaf> {
        if let Some(err) = est.next_result.clone() {
            return Err(err);
        }
        let state = Mutex::new(LeafState {
            patterns: HashMap::new(),
            ops_out: HashMap::new(),
            ops_in: HashMap::new(),
            op_ids: IdRegister::new(),
            closed: None,
        });

        // Session callbacks feed a buffer channel so messages arriving
        // while the leaf is still being wired up are not lost; a pump task
        // drains it into the state machine.
        enum SessionInput {
            Msg(Message),
            Closed(Error),
        }
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<SessionInput>();
        let msg_tx = input_tx.clone();
        let on_message = move |msg: Message| {
            let _ = msg_tx.send(SessionInput::Msg(msg));
        };
        let on_close = move |err: Error| {
            let _ = input_tx.send(SessionInput::Closed(err));
        };

        let conn = BranchConnection::start(est, local, on_message, on_close);
        let inner = Arc::new(LeafInner { conn, state });
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                let leaf = Leaf { inner };
                match input {
                    SessionInput::Msg(msg) => leaf.on_message(msg),
                    SessionInput::Closed(err) => {
                        leaf.on_session_closed(err);
                        return;
                    }
                }
            }
        });

        let leaf = Leaf { inner };
        info!(peer = %leaf.inner.conn.remote().info, "leaf session running");
        Ok(leaf)
    }

    /// The peer's branch name, for logs and assertions.
    pub fn peer_name(&self) -> String {
        self.inner.conn.remote().info.name.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed.is_some()
    }

    /// Close the session; pending operations complete with *canceled*.
    pub fn close(&self) {
        self.inner.conn.close(Error::Canceled);
    }

    // -- message pump -------------------------------------------------------

    fn on_message(&self, msg: Message) {
        let effects = {
            let mut st = self.inner.state.lock().unwrap();
            let mut effects = Effects::default();
            match msg {
                Message::Terminal { pattern, msg } => {
                    st.handle_msg(self, pattern, msg, &mut effects);
                }
                other => debug!(?other, "ignoring non-terminal message on a leaf session"),
            }
            effects
        };
        self.run_effects(effects);
    }

    fn on_session_closed(&self, err: Error) {
        warn!(error = %err, "leaf session ended");
        let effects = {
            let mut st = self.inner.state.lock().unwrap();
            st.on_closed(err)
        };
        self.run_effects(effects);
    }

    fn run_effects(&self, effects: Effects) {
        for msg in effects.sends {
            // Queued in call order; the completion is irrelevant here, so
            // the future is dropped (the send itself stays queued).
            drop(self.inner.conn.send_async(&msg, None));
        }
        for deferred in effects.deferred {
            deferred();
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LeafState, &mut Effects) -> Result<R>) -> Result<R> {
        let (result, effects) = {
            let mut st = self.inner.state.lock().unwrap();
            let mut effects = Effects::default();
            if let Some(err) = &st.closed {
                return Err(err.clone());
            }
            (f(&mut st, &mut effects), effects)
        };
        self.run_effects(effects);
        result
    }

    // -- operations invoked by the terminal and binding handles -------------

    pub(crate) fn op_create_terminal(
        &self,
        pattern: Pattern,
        role: TerminalRole,
        identifier: Identifier,
    ) -> Result<TerminalParts> {
        self.with_state(|st, fx| st.create_terminal(pattern, role, identifier, fx))
    }

    pub(crate) fn op_create_binding(
        &self,
        pattern: Pattern,
        owner: Id,
        target: Identifier,
    ) -> Result<(Id, watch::Receiver<BindingState>)> {
        self.with_state(|st, fx| st.create_binding(pattern, owner, target, fx))
    }

    pub(crate) fn op_destroy_terminal(&self, pattern: Pattern, id: Id) -> Result<()> {
        self.with_state(|st, fx| st.destroy_terminal(pattern, id, fx))
    }

    pub(crate) fn op_destroy_binding(&self, pattern: Pattern, id: Id) -> Result<()> {
        self.with_state(|st, fx| st.destroy_binding(pattern, id, fx))
    }

    pub(crate) fn op_publish(&self, pattern: Pattern, id: Id, data: Vec<u8>) -> Result<()> {
        self.with_state(|st, fx| st.publish(pattern, id, data, fx))
    }

    pub(crate) fn op_try_get_cached(&self, pattern: Pattern, id: Id) -> Result<Vec<u8>> {
        self.with_state(|st, _| st.try_get_cached(pattern, id))
    }

    pub(crate) fn op_scatter_gather(
        &self,
        pattern: Pattern,
        id: Id,
        data: Vec<u8>,
        handler: GatherHandler,
    ) -> Result<Id> {
        self.with_state(|st, fx| st.scatter_gather(pattern, id, data, handler, fx))
    }

    pub(crate) fn op_cancel_scatter_gather(&self, operation_id: Id) -> Result<()> {
        self.with_state(|st, fx| st.cancel_scatter_gather(operation_id, fx))
    }

    pub(crate) fn op_arm_scatter_receive(
        &self,
        pattern: Pattern,
        id: Id,
    ) -> Result<oneshot::Receiver<ScatterRequest>> {
        self.with_state(|st, _| st.arm_scatter_receive(pattern, id))
    }

    pub(crate) fn op_cancel_scatter_receive(&self, pattern: Pattern, id: Id) -> Result<bool> {
        self.with_state(|st, _| st.cancel_scatter_receive(pattern, id))
    }

    pub(crate) fn op_respond_scattered(
        &self,
        terminal: Id,
        operation_id: Id,
        flags: GatherFlags,
        finish: bool,
        data: Vec<u8>,
    ) -> Result<()> {
        self.with_state(|st, fx| st.respond_scattered(terminal, operation_id, flags, finish, data, fx))
    }

    pub(crate) fn closed_error(&self) -> Error {
        self.inner
            .state
            .lock()
            .unwrap()
            .closed
            .clone()
            .unwrap_or_else(|| Error::ConnectionClosed("session ended".to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Listener for the accepting side
// ---------------------------------------------------------------------------

/// Accepts direct leaf sessions on a TCP port.
pub struct LeafListener {
    listener: TcpListener,
    local: Arc<LocalBranchInfo>,
    password_hash: [u8; 32],
}

impl LeafListener {
    pub async fn bind(addr: SocketAddr, cfg: &BranchConfig) -> Result<LeafListener> {
        cfg.validate().map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::BindSocketFailed(e.to_string()))?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::BindSocketFailed(e.to_string()))?;
        let local = Arc::new(LocalBranchInfo::new(cfg, bound)?);
        Ok(LeafListener { listener, local, password_hash: hash_password(&cfg.network_password) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local.info.tcp_ep
    }

    /// Accept one connection and run the handshake on it.
    pub async fn accept(&self) -> Result<Leaf> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::OpenSocketFailed(e.to_string()))?;
        let est = with_deadline(
            self.local.info.timeout,
            establish(
                ByteTransport::from_tcp(stream),
                &self.local,
                &self.password_hash,
                peer.ip(),
            ),
        )
        .await??;
        Leaf::from_established(est, &self.local)
    }
}

// ---------------------------------------------------------------------------
// The locked core
// ---------------------------------------------------------------------------

impl LeafState {
    fn pattern(&mut self, pattern: Pattern) -> &mut PatternState {
        self.patterns.entry(pattern).or_default()
    }

    fn handle_msg(&mut self, leaf: &Leaf, pattern: Pattern, msg: TerminalMsg, fx: &mut Effects) {
        match msg {
            TerminalMsg::TerminalDescription { identifier, id } => {
                let ps = self.pattern(pattern);
                let iid = ps.imports.insert(Import {
                    identifier,
                    remote_id: id,
                    subscribed_by_us: false,
                    noticed: false,
                });
                fx.send(pattern, TerminalMsg::TerminalMapping { terminal_id: id, mapped_id: iid });
            }
            TerminalMsg::TerminalMapping { terminal_id, mapped_id } => {
                let ps = self.pattern(pattern);
                if let Some(export) = ps.exports.get_mut(terminal_id) {
                    export.mapped_id = Some(mapped_id);
                    fx.send(pattern, TerminalMsg::TerminalNoticed { terminal_id: mapped_id });
                } else {
                    // The terminal went away before its mapping arrived;
                    // clean up the peer's record directly.
                    fx.send(pattern, TerminalMsg::TerminalRemoved { mapped_id });
                }
            }
            TerminalMsg::TerminalNoticed { terminal_id } => {
                let ps = self.pattern(pattern);
                if let Some(import) = ps.imports.get_mut(terminal_id) {
                    import.noticed = true;
                }
            }
            TerminalMsg::TerminalRemoved { mapped_id } => {
                let ps = self.pattern(pattern);
                if let Some(import) = ps.imports.remove(mapped_id) {
                    fx.send(
                        pattern,
                        TerminalMsg::TerminalRemovedAck { terminal_id: import.remote_id },
                    );
                }
            }
            TerminalMsg::TerminalRemovedAck { terminal_id } => {
                self.finish_terminal_removal(pattern, terminal_id);
            }
            TerminalMsg::BindingDescription { identifier, id } => {
                let matches = self.matching_export_exists(pattern, &identifier);
                let ps = self.pattern(pattern);
                let pbid = ps.peer_bindings.insert(PeerBinding {
                    target: identifier,
                    remote_id: id,
                    established: matches,
                    noticed: false,
                });
                fx.send(pattern, TerminalMsg::BindingMapping { binding_id: id, mapped_id: pbid });
                if matches {
                    fx.send(pattern, TerminalMsg::BindingEstablished { binding_id: id });
                }
            }
            TerminalMsg::BindingMapping { binding_id, mapped_id } => {
                let ps = self.pattern(pattern);
                if let Some(binding) = ps.bindings.get_mut(binding_id) {
                    binding.mapped_id = Some(mapped_id);
                    fx.send(pattern, TerminalMsg::BindingNoticed { binding_id: mapped_id });
                } else {
                    fx.send(pattern, TerminalMsg::BindingRemoved { mapped_id });
                }
            }
            TerminalMsg::BindingNoticed { binding_id } => {
                let ps = self.pattern(pattern);
                if let Some(pb) = ps.peer_bindings.get_mut(binding_id) {
                    pb.noticed = true;
                }
            }
            TerminalMsg::BindingRemoved { mapped_id } => {
                let ps = self.pattern(pattern);
                if let Some(pb) = ps.peer_bindings.remove(mapped_id) {
                    fx.send(pattern, TerminalMsg::BindingRemovedAck { binding_id: pb.remote_id });
                }
            }
            TerminalMsg::BindingRemovedAck { binding_id } => {
                self.finish_binding_removal(pattern, binding_id);
            }
            TerminalMsg::BindingEstablished { binding_id } => {
                self.on_binding_established(pattern, binding_id, fx);
            }
            TerminalMsg::BindingReleased { binding_id } => {
                let ps = self.pattern(pattern);
                if let Some(binding) = ps.bindings.get(binding_id) {
                    let _ = binding.state.send(BindingState::Released);
                }
            }
            TerminalMsg::Subscribe { terminal_id } => {
                self.on_subscribe(pattern, terminal_id, fx);
            }
            TerminalMsg::Unsubscribe { terminal_id } => {
                let ps = self.pattern(pattern);
                if let Some(export) = ps.exports.get_mut(terminal_id) {
                    let _ = export.subscription.send(SubscriptionState::Unsubscribed);
                }
            }
            TerminalMsg::Data { subscription_id, data }
            | TerminalMsg::CachedData { subscription_id, data } => {
                self.on_data(pattern, subscription_id, data);
            }
            TerminalMsg::Scatter { subscription_id, operation_id, data } => {
                self.on_scatter(pattern, subscription_id, operation_id, data, fx);
            }
            TerminalMsg::Gather { operation_id, flags, data } => {
                self.on_gather(leaf, operation_id, flags, data, fx);
            }
        }
    }

    fn matching_export_exists(&mut self, pattern: Pattern, identifier: &Identifier) -> bool {
        self.pattern(pattern)
            .exports
            .iter()
            .any(|(_, e)| !e.removing && e.identifier == *identifier)
    }

    /// The binding-owner side learned a match exists: flip the state and
    /// subscribe to every matching imported terminal.
    fn on_binding_established(&mut self, pattern: Pattern, binding_id: Id, fx: &mut Effects) {
        let ps = self.pattern(pattern);
        let Some(binding) = ps.bindings.get(binding_id) else {
            return;
        };
        let _ = binding.state.send(BindingState::Established);
        if !pattern.is_subscribable() {
            return;
        }
        let target = binding.target.clone();
        for (_, import) in ps.imports.iter_mut() {
            if import.identifier == target && !import.subscribed_by_us {
                import.subscribed_by_us = true;
                fx.send(pattern, TerminalMsg::Subscribe { terminal_id: import.remote_id });
            }
        }
    }

    fn on_subscribe(&mut self, pattern: Pattern, terminal_id: Id, fx: &mut Effects) {
        let ps = self.pattern(pattern);
        let Some(export) = ps.exports.get(terminal_id) else {
            return;
        };
        let _ = export.subscription.send(SubscriptionState::Subscribed);
        // A caching publisher replays its last value to each new subscriber.
        if pattern.has_cache() {
            if let Some(cache) = export.cache.clone() {
                let identifier = export.identifier.clone();
                for (_, pb) in ps.peer_bindings.iter() {
                    if pb.established && pb.target == identifier {
                        fx.send(
                            pattern,
                            TerminalMsg::CachedData {
                                subscription_id: pb.remote_id,
                                data: cache.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    /// Payload delivery: addressed by our binding id, handed to the
    /// binding's owning terminal.
    fn on_data(&mut self, pattern: Pattern, subscription_id: Id, data: Vec<u8>) {
        let ps = self.pattern(pattern);
        let Some(binding) = ps.bindings.get(subscription_id) else {
            debug!(%subscription_id, "data for an unknown binding dropped");
            return;
        };
        let owner = binding.owner;
        if let Some(export) = ps.exports.get_mut(owner) {
            if pattern.has_cache() {
                export.cache = Some(data.clone());
            }
            let _ = export.published_tx.send(data);
        }
    }

    /// A scattered request addressed to one of our terminals.
    fn on_scatter(
        &mut self,
        pattern: Pattern,
        subscription_id: Id,
        operation_id: Id,
        data: Vec<u8>,
        fx: &mut Effects,
    ) {
        let ps = self.pattern(pattern);
        let Some(export) = ps.exports.get_mut(subscription_id) else {
            fx.send(
                pattern,
                TerminalMsg::Gather {
                    operation_id,
                    flags: GatherFlags::BINDING_DESTROYED | GatherFlags::FINISHED,
                    data: Vec::new(),
                },
            );
            return;
        };
        match export.scatter_arm.take() {
            Some(armed) => {
                if armed.send(ScatterRequest { operation_id, data }).is_ok() {
                    self.ops_in.insert(operation_id.get(), (pattern, subscription_id));
                    return;
                }
                // The receiver went away between arming and delivery.
                fx.send(
                    pattern,
                    TerminalMsg::Gather {
                        operation_id,
                        flags: GatherFlags::DEAF | GatherFlags::FINISHED,
                        data: Vec::new(),
                    },
                );
            }
            None => {
                // No receiver armed: the peer learns we will not reply.
                fx.send(
                    pattern,
                    TerminalMsg::Gather {
                        operation_id,
                        flags: GatherFlags::DEAF | GatherFlags::FINISHED,
                        data: Vec::new(),
                    },
                );
            }
        }
    }

    /// A gather reply for one of our outbound operations.
    ///
    /// The handler is taken out of the task and run after the lock drops;
    /// the continuation re-locks to put it back (or finish the task).
    fn on_gather(
        &mut self,
        leaf: &Leaf,
        operation_id: Id,
        flags: GatherFlags,
        data: Vec<u8>,
        fx: &mut Effects,
    ) {
        let key = operation_id.get();
        let Some(task) = self.ops_out.get_mut(&key) else {
            debug!(%operation_id, "gather for an unknown operation dropped");
            return;
        };
        let Some(handler) = task.handler.take() else {
            // A handler can only be absent while it runs, and replies are
            // pumped serially; nothing to do but drop the reply.
            debug!(%operation_id, "gather raced a running handler, dropped");
            return;
        };
        if flags.contains(GatherFlags::FINISHED) {
            task.remaining -= 1;
        }
        let complete = task.remaining == 0;
        // Intermediate finishes from one responder of several are not the
        // operation's finish.
        let mut pass_flags = GatherFlags::from_bits(
            flags.bits() & !GatherFlags::FINISHED.bits(),
        )
        .unwrap_or(GatherFlags::NONE);
        if complete {
            pass_flags |= GatherFlags::FINISHED;
        }

        if complete {
            self.ops_out.remove(&key);
            self.op_ids.remove(operation_id);
            fx.deferred.push(Box::new(move || {
                let mut handler = handler;
                let _ = handler(Ok(GatherReply { operation_id, flags: pass_flags, data }));
            }));
            return;
        }

        let leaf = leaf.clone();
        fx.deferred.push(Box::new(move || {
            let mut handler = handler;
            let keep_going = handler(Ok(GatherReply { operation_id, flags: pass_flags, data }));

            let mut st = leaf.inner.state.lock().unwrap();
            let cancel_requested = match st.ops_out.get_mut(&key) {
                None => return,
                Some(task) => task.cancel_requested,
            };
            let follow_up = if cancel_requested {
                Err(Error::Canceled)
            } else if keep_going {
                // Operation continues: the handler goes back into the task.
                if let Some(task) = st.ops_out.get_mut(&key) {
                    task.handler = Some(handler);
                }
                return;
            } else {
                // Aborted by the handler: one synthetic final gather, then
                // the task record goes away.
                Ok(GatherReply {
                    operation_id,
                    flags: GatherFlags::FINISHED,
                    data: Vec::new(),
                })
            };
            st.ops_out.remove(&key);
            st.op_ids.remove(operation_id);
            drop(st);
            let _ = handler(follow_up);
        }));
    }

    // -- user operations ----------------------------------------------------

    fn create_terminal(
        &mut self,
        pattern: Pattern,
        role: TerminalRole,
        identifier: Identifier,
        fx: &mut Effects,
    ) -> Result<TerminalParts> {
        if !role.allowed_for(pattern) {
            return Err(Error::WrongObjectType);
        }
        let ps = self.pattern(pattern);
        if ps.exports.iter().any(|(_, e)| !e.removing && e.identifier == identifier) {
            return Err(Error::AlreadyAssigned);
        }

        let (sub_tx, sub_rx) = watch::channel(SubscriptionState::Unsubscribed);
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        let id = ps.exports.insert(Export {
            identifier: identifier.clone(),
            role,
            mapped_id: None,
            subscription: sub_tx,
            cache: None,
            published_tx,
            scatter_arm: None,
            removing: false,
        });
        fx.send(
            pattern,
            TerminalMsg::TerminalDescription { identifier: identifier.clone(), id },
        );

        // The new terminal may establish peer bindings that were waiting
        // for a match.
        for (_, pb) in ps.peer_bindings.iter_mut() {
            if !pb.established && pb.target == identifier {
                pb.established = true;
                fx.send(pattern, TerminalMsg::BindingEstablished { binding_id: pb.remote_id });
            }
        }

        let implicit = if role.auto_binds() {
            Some(self.create_binding(pattern, id, identifier, fx)?)
        } else {
            None
        };
        Ok(TerminalParts { id, sub_rx, published_rx, implicit })
    }

    fn create_binding(
        &mut self,
        pattern: Pattern,
        owner: Id,
        target: Identifier,
        fx: &mut Effects,
    ) -> Result<(Id, watch::Receiver<BindingState>)> {
        let ps = self.pattern(pattern);
        if !ps.exports.contains(owner) {
            return Err(Error::InvalidHandle);
        }
        let (state_tx, state_rx) = watch::channel(BindingState::Released);
        let id = ps.bindings.insert(BindingRec {
            owner,
            target: target.clone(),
            mapped_id: None,
            state: state_tx,
            removing: false,
        });
        fx.send(pattern, TerminalMsg::BindingDescription { identifier: target, id });
        Ok((id, state_rx))
    }

    fn destroy_terminal(&mut self, pattern: Pattern, id: Id, fx: &mut Effects) -> Result<()> {
        let ps = self.pattern(pattern);
        let export = ps.exports.get_mut(id).ok_or(Error::InvalidHandle)?;
        if export.removing {
            return Err(Error::InvalidHandle);
        }
        let identifier = export.identifier.clone();
        let mapped_id = export.mapped_id;
        let _ = export.subscription.send(SubscriptionState::Unsubscribed);
        export.scatter_arm = None;

        // Owned bindings go down with the terminal.
        let owned: Vec<Id> =
            ps.bindings.iter().filter(|(_, b)| b.owner == id && !b.removing).map(|(bid, _)| bid).collect();
        for bid in owned {
            self.destroy_binding(pattern, bid, fx)?;
        }

        // Peer bindings that matched only this terminal fall back to
        // released.
        let ps = self.pattern(pattern);
        let still_matching = ps
            .exports
            .iter()
            .any(|(eid, e)| eid != id && !e.removing && e.identifier == identifier);
        if !still_matching {
            for (_, pb) in ps.peer_bindings.iter_mut() {
                if pb.established && pb.target == identifier {
                    pb.established = false;
                    fx.send(pattern, TerminalMsg::BindingReleased { binding_id: pb.remote_id });
                }
            }
        }

        // Outstanding scattered requests aimed at this terminal get their
        // terminal condition.
        let aimed: Vec<u64> = self
            .ops_in
            .iter()
            .filter(|(_, (p, tid))| *p == pattern && *tid == id)
            .map(|(op, _)| *op)
            .collect();
        for op in aimed {
            self.ops_in.remove(&op);
            fx.send(
                pattern,
                TerminalMsg::Gather {
                    operation_id: Id::new(op).unwrap(),
                    flags: GatherFlags::BINDING_DESTROYED | GatherFlags::FINISHED,
                    data: Vec::new(),
                },
            );
        }

        // Two-phase removal: the id returns to the free-list only after
        // the peer acknowledges.
        let ps = self.pattern(pattern);
        match mapped_id {
            Some(mapped_id) => {
                ps.exports.get_mut(id).unwrap().removing = true;
                fx.send(pattern, TerminalMsg::TerminalRemoved { mapped_id });
            }
            None => {
                ps.exports.remove(id);
            }
        }
        Ok(())
    }

    fn destroy_binding(&mut self, pattern: Pattern, id: Id, fx: &mut Effects) -> Result<()> {
        let ps = self.pattern(pattern);
        let binding = ps.bindings.get_mut(id).ok_or(Error::InvalidHandle)?;
        if binding.removing {
            return Err(Error::InvalidHandle);
        }
        let target = binding.target.clone();
        let mapped_id = binding.mapped_id;
        let _ = binding.state.send(BindingState::Released);

        // Withdraw subscriptions this binding held up, unless another
        // binding still wants them.
        let still_wanted = ps
            .bindings
            .iter()
            .any(|(bid, b)| bid != id && !b.removing && b.target == target);
        if !still_wanted && pattern.is_subscribable() {
            for (_, import) in ps.imports.iter_mut() {
                if import.identifier == target && import.subscribed_by_us {
                    import.subscribed_by_us = false;
                    fx.send(pattern, TerminalMsg::Unsubscribe { terminal_id: import.remote_id });
                }
            }
        }

        let ps = self.pattern(pattern);
        match mapped_id {
            Some(mapped_id) => {
                ps.bindings.get_mut(id).unwrap().removing = true;
                fx.send(pattern, TerminalMsg::BindingRemoved { mapped_id });
            }
            None => {
                ps.bindings.remove(id);
            }
        }
        Ok(())
    }

    fn publish(&mut self, pattern: Pattern, id: Id, data: Vec<u8>, fx: &mut Effects) -> Result<()> {
        if !pattern.has_data() {
            return Err(Error::WrongObjectType);
        }
        let ps = self.pattern(pattern);
        let export = ps.exports.get_mut(id).ok_or(Error::InvalidHandle)?;
        // Caching patterns retain the value even without subscribers; it
        // is replayed to whoever subscribes first.
        if pattern.has_cache() {
            export.cache = Some(data.clone());
        }
        if *export.subscription.borrow() != SubscriptionState::Subscribed {
            return Err(Error::NotReady);
        }
        let identifier = export.identifier.clone();
        let mut sent = false;
        for (_, pb) in ps.peer_bindings.iter() {
            if pb.established && pb.target == identifier {
                fx.send(
                    pattern,
                    TerminalMsg::Data { subscription_id: pb.remote_id, data: data.clone() },
                );
                sent = true;
            }
        }
        if sent { Ok(()) } else { Err(Error::NotReady) }
    }

    fn try_get_cached(&mut self, pattern: Pattern, id: Id) -> Result<Vec<u8>> {
        if !pattern.has_cache() {
            return Err(Error::WrongObjectType);
        }
        let ps = self.pattern(pattern);
        let export = ps.exports.get(id).ok_or(Error::InvalidHandle)?;
        export.cache.clone().ok_or(Error::NotReady)
    }

    fn scatter_gather(
        &mut self,
        pattern: Pattern,
        id: Id,
        data: Vec<u8>,
        handler: GatherHandler,
        fx: &mut Effects,
    ) -> Result<Id> {
        if !pattern.has_scatter() {
            return Err(Error::WrongObjectType);
        }
        let ps = self.pattern(pattern);
        if !ps.exports.contains(id) {
            return Err(Error::InvalidHandle);
        }

        // Targets: every imported terminal matched by one of this
        // terminal's bindings, each addressed by the id the *peer*
        // assigned to it.
        let targets: Vec<Id> = {
            let mut targets = Vec::new();
            for (_, binding) in ps.bindings.iter() {
                if binding.owner != id || binding.removing {
                    continue;
                }
                for (_, import) in ps.imports.iter() {
                    if import.identifier == binding.target && !targets.contains(&import.remote_id) {
                        targets.push(import.remote_id);
                    }
                }
            }
            targets
        };
        if targets.is_empty() {
            return Err(Error::NotReady);
        }

        let operation_id = self.op_ids.insert(());
        self.ops_out.insert(
            operation_id.get(),
            SgTask {
                pattern,
                remaining: targets.len(),
                handler: Some(handler),
                cancel_requested: false,
            },
        );
        for remote_id in targets {
            fx.send(
                pattern,
                TerminalMsg::Scatter {
                    subscription_id: remote_id,
                    operation_id,
                    data: data.clone(),
                },
            );
        }
        Ok(operation_id)
    }

    fn cancel_scatter_gather(&mut self, operation_id: Id, fx: &mut Effects) -> Result<()> {
        let key = operation_id.get();
        let taken = {
            let task = self.ops_out.get_mut(&key).ok_or(Error::InvalidHandle)?;
            task.handler.take()
        };
        match taken {
            Some(mut handler) => {
                self.ops_out.remove(&key);
                self.op_ids.remove(operation_id);
                fx.deferred.push(Box::new(move || {
                    let _ = handler(Err(Error::Canceled));
                }));
            }
            // The handler is running right now; it observes the request
            // when it puts itself back.
            None => {
                if let Some(task) = self.ops_out.get_mut(&key) {
                    task.cancel_requested = true;
                }
            }
        }
        Ok(())
    }

    fn arm_scatter_receive(
        &mut self,
        pattern: Pattern,
        id: Id,
    ) -> Result<oneshot::Receiver<ScatterRequest>> {
        if !pattern.has_scatter() {
            return Err(Error::WrongObjectType);
        }
        let ps = self.pattern(pattern);
        let export = ps.exports.get_mut(id).ok_or(Error::InvalidHandle)?;
        let (tx, rx) = oneshot::channel();
        // Re-arming replaces a pending receive; the old future fails with
        // *canceled* when its sender drops.
        export.scatter_arm = Some(tx);
        Ok(rx)
    }

    fn cancel_scatter_receive(&mut self, pattern: Pattern, id: Id) -> Result<bool> {
        let ps = self.pattern(pattern);
        let export = ps.exports.get_mut(id).ok_or(Error::InvalidHandle)?;
        Ok(export.scatter_arm.take().is_some())
    }

    fn respond_scattered(
        &mut self,
        terminal: Id,
        operation_id: Id,
        flags: GatherFlags,
        finish: bool,
        data: Vec<u8>,
        fx: &mut Effects,
    ) -> Result<()> {
        let key = operation_id.get();
        let &(pattern, responder) = self.ops_in.get(&key).ok_or(Error::InvalidHandle)?;
        if responder != terminal {
            return Err(Error::WrongObjectType);
        }
        let flags = if finish { flags | GatherFlags::FINISHED } else { flags };
        fx.send(pattern, TerminalMsg::Gather { operation_id, flags, data });
        if finish {
            self.ops_in.remove(&key);
        }
        Ok(())
    }

    fn finish_terminal_removal(&mut self, pattern: Pattern, terminal_id: Id) {
        let ps = self.pattern(pattern);
        if ps.exports.get(terminal_id).is_some_and(|e| e.removing) {
            ps.exports.remove(terminal_id);
        }
    }

    fn finish_binding_removal(&mut self, pattern: Pattern, binding_id: Id) {
        let ps = self.pattern(pattern);
        if ps.bindings.get(binding_id).is_some_and(|b| b.removing) {
            ps.bindings.remove(binding_id);
        }
    }

    /// Session gone: release bindings, unsubscribe exports, finish every
    /// outstanding scatter operation with the session error.
    fn on_closed(&mut self, err: Error) -> Effects {
        let mut fx = Effects::default();
        if self.closed.is_some() {
            return fx;
        }
        self.closed = Some(err.clone());

        for ps in self.patterns.values_mut() {
            for (_, binding) in ps.bindings.iter() {
                let _ = binding.state.send(BindingState::Released);
            }
            for (_, export) in ps.exports.iter_mut() {
                let _ = export.subscription.send(SubscriptionState::Unsubscribed);
                // Dropping an armed scatter receiver fails its future.
                export.scatter_arm = None;
                // Replacing the sender closes the published channel, so a
                // pending receive observes the end of the stream.
                let (dead_tx, _) = mpsc::unbounded_channel();
                export.published_tx = dead_tx;
            }
        }
        self.ops_in.clear();
        for (_, mut task) in self.ops_out.drain() {
            if let Some(mut handler) = task.handler.take() {
                let err = err.clone();
                fx.deferred.push(Box::new(move || {
                    let _ = handler(Err(err));
                }));
            }
        }
        fx
    }
}
