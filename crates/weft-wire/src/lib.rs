// weft-wire: Wire-level protocol types and serialization.
//
// Everything that crosses a socket lives here: the continuation-bit varint
// encoding, the frame codec, the advertising/info datagram layouts, and the
// message-kind registry with its per-kind field layouts.  The fabric crate
// (weft-core) builds sessions and state machines on top of these types but
// never touches raw bytes itself.

pub mod beacon;
pub mod frame;
pub mod gather;
pub mod ident;
pub mod message;
pub mod varint;

pub use frame::FrameDecoder;
pub use gather::GatherFlags;
pub use ident::{Id, IdRegister, Identifier};
pub use message::{Message, Pattern, TerminalMsg, TerminalOp};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors arising from encoding or decoding wire data.
///
/// Any decode error on an established session is a protocol error; the
/// session owner terminates the session when one surfaces.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint does not fit in 64 bits")]
    VarintOverflow,
    #[error("invalid magic prefix")]
    BadMagic,
    #[error("incompatible protocol version {major}.{minor}.{patch}")]
    IncompatibleVersion { major: u8, minor: u8, patch: u8 },
    #[error("unknown message type id {0}")]
    UnknownTypeId(u64),
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
    #[error("malformed acknowledgement byte {0:#04x}")]
    BadAck(u8),
    #[error("id value zero is reserved")]
    ZeroId,
    #[error("gather flags byte {0:#04x} out of range")]
    BadGatherFlags(u8),
    #[error("message kind not valid for its pattern")]
    KindNotInPattern,
    #[error("frame of {len} bytes exceeds budget of {budget}")]
    FrameTooLarge { len: usize, budget: usize },
    #[error("invalid utf-8 in string field")]
    BadUtf8,
}
