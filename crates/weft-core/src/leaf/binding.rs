//! Explicit bindings.
//!
//! A binding is a named virtual link from a local terminal to any remote
//! terminal matching the target identifier.  It reports *established*
//! while at least one match is observed and *released* otherwise; the
//! terminal side of the session is the one that evaluates matches and
//! notifies the binding owner.

use crate::error::Result;
use crate::leaf::terminal::Terminal;
use crate::leaf::{BindingState, Leaf};
use tokio::sync::watch;
use weft_wire::{Id, Identifier, Pattern};

/// A named virtual link between terminals.
pub struct Binding {
    leaf: Leaf,
    pattern: Pattern,
    id: Id,
    state_rx: watch::Receiver<BindingState>,
    destroyed: bool,
}

impl Binding {
    /// Bind `terminal` to every remote terminal matching `target`.
    pub fn create(terminal: &Terminal, target: Identifier) -> Result<Binding> {
        let pattern = terminal.pattern();
        let (id, state_rx) = terminal.leaf().op_create_binding(pattern, terminal.id(), target)?;
        Ok(Binding { leaf: terminal.leaf().clone(), pattern, id, state_rx, destroyed: false })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn state(&self) -> BindingState {
        *self.state_rx.borrow()
    }

    /// Wait for the next state transition and return the new state.
    pub async fn await_state_change(&mut self) -> Result<BindingState> {
        self.state_rx
            .changed()
            .await
            .map_err(|_| crate::error::Error::Canceled)?;
        Ok(*self.state_rx.borrow())
    }

    /// Remove the binding; subscriptions held up only by it are withdrawn.
    pub fn destroy(mut self) -> Result<()> {
        self.destroyed = true;
        self.leaf.op_destroy_binding(self.pattern, self.id)
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        if !self.destroyed {
            let _ = self.leaf.op_destroy_binding(self.pattern, self.id);
        }
    }
}
