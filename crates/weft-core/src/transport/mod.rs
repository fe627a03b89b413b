//! Byte transports and the framed message transport layered on them.

pub mod byte;
pub mod msg;

pub use byte::{ByteTransport, with_deadline};
pub use msg::{MessageReceiver, MessageTransport, SendTag};
