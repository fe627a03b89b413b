// weft: workspace façade.
//
// Re-exports the fabric (weft-core) and wire (weft-wire) crates for the
// root integration suites and downstream consumers.

pub use weft_core::{
    Binding, BindingState, Branch, BranchConfig, BranchEvent, Error, GatherFlags, GatherReply,
    Id, Identifier, Leaf, LeafListener, Pattern, PeerSnapshot, Result, ScatterRequest,
    SubscriptionState, Terminal, TerminalRole,
};
pub use weft_wire as wire;
