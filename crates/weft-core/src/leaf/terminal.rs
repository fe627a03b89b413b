//! The terminal handle.
//!
//! A terminal is a communication endpoint belonging to one pattern family.
//! The handle owns the receiving channels; all protocol work happens in
//! the leaf's locked core.

use crate::error::{Error, Result};
use crate::leaf::pattern::TerminalRole;
use crate::leaf::{
    BindingState, GatherHandler, GatherReply, Leaf, ScatterRequest, SubscriptionState,
};
use tokio::sync::{mpsc, watch};
use weft_wire::{GatherFlags, Id, Identifier, Pattern};

/// A communication endpoint owned by a leaf.
///
/// Dropping the handle removes the terminal (two-phase, peer-acknowledged)
/// unless [`Terminal::destroy`] already ran.
pub struct Terminal {
    leaf: Leaf,
    pattern: Pattern,
    role: TerminalRole,
    identifier: Identifier,
    id: Id,
    sub_rx: watch::Receiver<SubscriptionState>,
    published_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    implicit_binding: Option<Id>,
    binding_rx: Option<watch::Receiver<BindingState>>,
    destroyed: bool,
}

impl Terminal {
    /// Create a terminal and announce it to the peer.
    ///
    /// Roles that address a named counterpart (consumer, master, slave,
    /// service, client) bind implicitly to `identifier`.
    pub fn create(
        leaf: &Leaf,
        pattern: Pattern,
        role: TerminalRole,
        identifier: Identifier,
    ) -> Result<Terminal> {
        let parts = leaf.op_create_terminal(pattern, role, identifier.clone())?;
        let (implicit_binding, binding_rx) = match parts.implicit {
            Some((id, rx)) => (Some(id), Some(rx)),
            None => (None, None),
        };
        Ok(Terminal {
            leaf: leaf.clone(),
            pattern,
            role,
            identifier,
            id: parts.id,
            sub_rx: parts.sub_rx,
            published_rx: tokio::sync::Mutex::new(parts.published_rx),
            implicit_binding,
            binding_rx,
            destroyed: false,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub fn role(&self) -> TerminalRole {
        self.role
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub(crate) fn leaf(&self) -> &Leaf {
        &self.leaf
    }

    // -- subscription state -------------------------------------------------

    pub fn subscription_state(&self) -> SubscriptionState {
        *self.sub_rx.borrow()
    }

    /// Wait for the next subscription state transition and return the new
    /// state.
    pub async fn await_subscription_state_change(&mut self) -> Result<SubscriptionState> {
        self.sub_rx.changed().await.map_err(|_| self.leaf.closed_error())?;
        Ok(*self.sub_rx.borrow())
    }

    /// State of the implicit binding of auto-binding roles.
    pub fn binding_state(&self) -> Result<BindingState> {
        self.binding_rx.as_ref().map(|rx| *rx.borrow()).ok_or(Error::WrongObjectType)
    }

    pub async fn await_binding_state_change(&mut self) -> Result<BindingState> {
        let rx = self.binding_rx.as_mut().ok_or(Error::WrongObjectType)?;
        rx.changed().await.map_err(|_| Error::Canceled)?;
        Ok(*rx.borrow())
    }

    // -- publish / receive --------------------------------------------------

    /// Send `data` to every subscribed counterpart.  Caching patterns also
    /// retain it as the last value.
    pub fn publish(&self, data: Vec<u8>) -> Result<()> {
        self.leaf.op_publish(self.pattern, self.id, data)
    }

    /// The next payload published to this terminal.
    pub async fn receive_published(&self) -> Result<Vec<u8>> {
        if !self.pattern.has_data() {
            return Err(Error::WrongObjectType);
        }
        let mut rx = self.published_rx.lock().await;
        rx.recv().await.ok_or_else(|| self.leaf.closed_error())
    }

    /// The last value published or received, for caching patterns.
    pub fn try_get_cached(&self) -> Result<Vec<u8>> {
        self.leaf.op_try_get_cached(self.pattern, self.id)
    }

    // -- scatter-gather -----------------------------------------------------

    /// Scatter `data` to every bound counterpart.
    ///
    /// `handler` runs for every gather reply; the final invocation carries
    /// `FINISHED` (or an error).  Returning false aborts the operation
    /// early.  Returns the operation id.
    pub fn async_scatter_gather(
        &self,
        data: Vec<u8>,
        handler: impl FnMut(std::result::Result<GatherReply, Error>) -> bool + Send + 'static,
    ) -> Result<Id> {
        self.leaf.op_scatter_gather(self.pattern, self.id, data, Box::new(handler) as GatherHandler)
    }

    /// Abort an outstanding operation; its handler observes *canceled*.
    pub fn cancel_scatter_gather(&self, operation_id: Id) -> Result<()> {
        self.leaf.op_cancel_scatter_gather(operation_id)
    }

    /// Arm the scattered-message receiver and await one request.
    ///
    /// The receiver is armed before this returns.  While no receiver is
    /// armed, incoming requests are answered with a `DEAF` gather.
    /// Re-arming cancels a pending receive.
    pub fn receive_scattered(
        &self,
    ) -> Result<impl Future<Output = Result<ScatterRequest>> + Send + use<>> {
        let armed = self.leaf.op_arm_scatter_receive(self.pattern, self.id)?;
        Ok(async move { armed.await.map_err(|_| Error::Canceled) })
    }

    /// Disarm a pending [`Terminal::receive_scattered`].
    pub fn cancel_receive_scattered(&self) -> Result<bool> {
        self.leaf.op_cancel_scatter_receive(self.pattern, self.id)
    }

    /// Answer a scattered request, finishing the operation.
    pub fn respond(&self, operation_id: Id, data: Vec<u8>) -> Result<()> {
        self.leaf.op_respond_scattered(self.id, operation_id, GatherFlags::NONE, true, data)
    }

    /// Send an intermediate reply; the operation stays open for more.
    pub fn respond_more(&self, operation_id: Id, data: Vec<u8>) -> Result<()> {
        self.leaf.op_respond_scattered(self.id, operation_id, GatherFlags::NONE, false, data)
    }

    /// Decline a scattered request; the originator sees an `IGNORED`
    /// gather.
    pub fn ignore(&self, operation_id: Id) -> Result<()> {
        self.leaf
            .op_respond_scattered(self.id, operation_id, GatherFlags::IGNORED, true, Vec::new())
    }

    // -- teardown -----------------------------------------------------------

    /// Remove the terminal.  The id is reused only after the peer
    /// acknowledges the removal.
    pub fn destroy(mut self) -> Result<()> {
        self.destroyed = true;
        self.leaf.op_destroy_terminal(self.pattern, self.id)
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        if !self.destroyed {
            let _ = self.leaf.op_destroy_terminal(self.pattern, self.id);
        }
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("pattern", &self.pattern)
            .field("role", &self.role)
            .field("identifier", &self.identifier)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
