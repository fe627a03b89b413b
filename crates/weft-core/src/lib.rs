// weft-core: the peer-to-peer messaging fabric.
//
// Branches discover each other over UDP multicast beacons, establish
// authenticated heartbeat-monitored sessions over TCP, and carry
// broadcasts across the mesh.  Leaves host terminals — the typed
// communication endpoints of the deaf-mute, publish-subscribe,
// scatter-gather, producer-consumer, master-slave and service-client
// pattern families — over direct sessions.
//
// Layering, leaves first: byte transport → framed message transport →
// handshake → session → connection/broadcast managers and the terminal
// state machines.

pub mod branch;
pub mod config;
pub mod error;
pub mod leaf;
pub mod registry;
pub mod transport;

pub use branch::{Branch, BranchEvent, PeerSnapshot};
pub use config::BranchConfig;
pub use error::{Error, Result};
pub use leaf::binding::Binding;
pub use leaf::pattern::TerminalRole;
pub use leaf::terminal::Terminal;
pub use leaf::{
    BindingState, GatherReply, Leaf, LeafListener, ScatterRequest, SubscriptionState,
};
pub use weft_wire::{GatherFlags, Id, Identifier, Pattern};
