//! The message-kind registry.
//!
//! Every frame carries a type-id assigned by a fixed enumeration of known
//! message kinds: heartbeat and broadcast first, then the terminal messages
//! of each interaction pattern in declaration order.  An unknown type-id is
//! a hard error that terminates the session.
//!
//! Terminal messages share identical field layouts across the pattern
//! families; only their semantics differ.  A pattern pins which subset of
//! operations its endpoints may exchange, and the type-id space only
//! contains valid (pattern, operation) combinations, so subset enforcement
//! falls out of the id assignment itself.

use crate::WireError;
use crate::gather::GatherFlags;
use crate::ident::{Id, Identifier};
use crate::varint::{self, Reader};

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// The interaction pattern a terminal belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    DeafMute,
    PublishSubscribe,
    ScatterGather,
    CachedPublishSubscribe,
    ProducerConsumer,
    CachedProducerConsumer,
    MasterSlave,
    CachedMasterSlave,
    ServiceClient,
}

impl Pattern {
    /// Declaration order; fixes the type-id assignment.
    pub const ALL: [Pattern; 9] = [
        Pattern::DeafMute,
        Pattern::PublishSubscribe,
        Pattern::ScatterGather,
        Pattern::CachedPublishSubscribe,
        Pattern::ProducerConsumer,
        Pattern::CachedProducerConsumer,
        Pattern::MasterSlave,
        Pattern::CachedMasterSlave,
        Pattern::ServiceClient,
    ];

    /// The operations endpoints of this pattern may exchange.
    pub fn ops(self) -> &'static [TerminalOp] {
        match self {
            Pattern::DeafMute => &BASE_OPS,
            Pattern::PublishSubscribe | Pattern::ProducerConsumer | Pattern::MasterSlave => {
                &DATA_OPS
            }
            Pattern::CachedPublishSubscribe
            | Pattern::CachedProducerConsumer
            | Pattern::CachedMasterSlave => &CACHED_OPS,
            Pattern::ScatterGather | Pattern::ServiceClient => &SCATTER_OPS,
        }
    }

    /// Whether terminals of this pattern hold a subscription state.
    pub fn is_subscribable(self) -> bool {
        self != Pattern::DeafMute
    }

    /// Whether the pattern carries `Data` payloads.
    pub fn has_data(self) -> bool {
        self.ops().contains(&TerminalOp::Data)
    }

    /// Whether the publisher keeps and re-sends the last value.
    pub fn has_cache(self) -> bool {
        self.ops().contains(&TerminalOp::CachedData)
    }

    /// Whether the pattern carries scatter/gather operations.
    pub fn has_scatter(self) -> bool {
        self.ops().contains(&TerminalOp::Scatter)
    }
}

// ---------------------------------------------------------------------------
// Operations and their per-pattern subsets
// ---------------------------------------------------------------------------

/// The operations a terminal message can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalOp {
    TerminalDescription,
    TerminalMapping,
    TerminalNoticed,
    TerminalRemoved,
    TerminalRemovedAck,
    BindingDescription,
    BindingMapping,
    BindingNoticed,
    BindingRemoved,
    BindingRemovedAck,
    BindingEstablished,
    BindingReleased,
    Subscribe,
    Unsubscribe,
    Data,
    CachedData,
    Scatter,
    Gather,
}

const BASE_OPS: [TerminalOp; 12] = [
    TerminalOp::TerminalDescription,
    TerminalOp::TerminalMapping,
    TerminalOp::TerminalNoticed,
    TerminalOp::TerminalRemoved,
    TerminalOp::TerminalRemovedAck,
    TerminalOp::BindingDescription,
    TerminalOp::BindingMapping,
    TerminalOp::BindingNoticed,
    TerminalOp::BindingRemoved,
    TerminalOp::BindingRemovedAck,
    TerminalOp::BindingEstablished,
    TerminalOp::BindingReleased,
];

const DATA_OPS: [TerminalOp; 15] = [
    TerminalOp::TerminalDescription,
    TerminalOp::TerminalMapping,
    TerminalOp::TerminalNoticed,
    TerminalOp::TerminalRemoved,
    TerminalOp::TerminalRemovedAck,
    TerminalOp::BindingDescription,
    TerminalOp::BindingMapping,
    TerminalOp::BindingNoticed,
    TerminalOp::BindingRemoved,
    TerminalOp::BindingRemovedAck,
    TerminalOp::BindingEstablished,
    TerminalOp::BindingReleased,
    TerminalOp::Subscribe,
    TerminalOp::Unsubscribe,
    TerminalOp::Data,
];

const CACHED_OPS: [TerminalOp; 16] = [
    TerminalOp::TerminalDescription,
    TerminalOp::TerminalMapping,
    TerminalOp::TerminalNoticed,
    TerminalOp::TerminalRemoved,
    TerminalOp::TerminalRemovedAck,
    TerminalOp::BindingDescription,
    TerminalOp::BindingMapping,
    TerminalOp::BindingNoticed,
    TerminalOp::BindingRemoved,
    TerminalOp::BindingRemovedAck,
    TerminalOp::BindingEstablished,
    TerminalOp::BindingReleased,
    TerminalOp::Subscribe,
    TerminalOp::Unsubscribe,
    TerminalOp::Data,
    TerminalOp::CachedData,
];

const SCATTER_OPS: [TerminalOp; 16] = [
    TerminalOp::TerminalDescription,
    TerminalOp::TerminalMapping,
    TerminalOp::TerminalNoticed,
    TerminalOp::TerminalRemoved,
    TerminalOp::TerminalRemovedAck,
    TerminalOp::BindingDescription,
    TerminalOp::BindingMapping,
    TerminalOp::BindingNoticed,
    TerminalOp::BindingRemoved,
    TerminalOp::BindingRemovedAck,
    TerminalOp::BindingEstablished,
    TerminalOp::BindingReleased,
    TerminalOp::Subscribe,
    TerminalOp::Unsubscribe,
    TerminalOp::Scatter,
    TerminalOp::Gather,
];

// ---------------------------------------------------------------------------
// Type-id assignment
// ---------------------------------------------------------------------------

pub const HEARTBEAT_TYPE_ID: u64 = 1;
pub const BROADCAST_TYPE_ID: u64 = 2;
const FIRST_TERMINAL_TYPE_ID: u64 = 3;

/// Wire type-id of a (pattern, operation) combination, or `None` when the
/// operation is not part of the pattern.
pub fn type_id(pattern: Pattern, op: TerminalOp) -> Option<u64> {
    let mut offset = FIRST_TERMINAL_TYPE_ID;
    for p in Pattern::ALL {
        if p == pattern {
            let index = p.ops().iter().position(|&o| o == op)?;
            return Some(offset + index as u64);
        }
        offset += p.ops().len() as u64;
    }
    unreachable!("Pattern::ALL covers every pattern")
}

/// Inverse of [`type_id`].
pub fn from_type_id(id: u64) -> Option<(Pattern, TerminalOp)> {
    let mut offset = FIRST_TERMINAL_TYPE_ID;
    if id < offset {
        return None;
    }
    for p in Pattern::ALL {
        let count = p.ops().len() as u64;
        if id < offset + count {
            return Some((p, p.ops()[(id - offset) as usize]));
        }
        offset += count;
    }
    None
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A terminal message; the field layout is shared across pattern families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalMsg {
    /// Announce a local terminal to the peer.
    TerminalDescription { identifier: Identifier, id: Id },
    /// Acknowledge a description and assign a peer-local id.
    TerminalMapping { terminal_id: Id, mapped_id: Id },
    /// Confirm that the mapping for a terminal arrived.
    TerminalNoticed { terminal_id: Id },
    /// First phase of removal; addresses the peer's record directly.
    TerminalRemoved { mapped_id: Id },
    /// Second phase of removal; frees the original id for reuse.
    TerminalRemovedAck { terminal_id: Id },
    BindingDescription { identifier: Identifier, id: Id },
    BindingMapping { binding_id: Id, mapped_id: Id },
    BindingNoticed { binding_id: Id },
    BindingRemoved { mapped_id: Id },
    BindingRemovedAck { binding_id: Id },
    /// The peer observed a terminal matching this binding.
    BindingEstablished { binding_id: Id },
    /// The last matching terminal went away.
    BindingReleased { binding_id: Id },
    Subscribe { terminal_id: Id },
    Unsubscribe { terminal_id: Id },
    Data { subscription_id: Id, data: Vec<u8> },
    /// The last value held by a caching publisher, sent on subscription.
    CachedData { subscription_id: Id, data: Vec<u8> },
    Scatter { subscription_id: Id, operation_id: Id, data: Vec<u8> },
    Gather { operation_id: Id, flags: GatherFlags, data: Vec<u8> },
}

impl TerminalMsg {
    pub fn op(&self) -> TerminalOp {
        match self {
            TerminalMsg::TerminalDescription { .. } => TerminalOp::TerminalDescription,
            TerminalMsg::TerminalMapping { .. } => TerminalOp::TerminalMapping,
            TerminalMsg::TerminalNoticed { .. } => TerminalOp::TerminalNoticed,
            TerminalMsg::TerminalRemoved { .. } => TerminalOp::TerminalRemoved,
            TerminalMsg::TerminalRemovedAck { .. } => TerminalOp::TerminalRemovedAck,
            TerminalMsg::BindingDescription { .. } => TerminalOp::BindingDescription,
            TerminalMsg::BindingMapping { .. } => TerminalOp::BindingMapping,
            TerminalMsg::BindingNoticed { .. } => TerminalOp::BindingNoticed,
            TerminalMsg::BindingRemoved { .. } => TerminalOp::BindingRemoved,
            TerminalMsg::BindingRemovedAck { .. } => TerminalOp::BindingRemovedAck,
            TerminalMsg::BindingEstablished { .. } => TerminalOp::BindingEstablished,
            TerminalMsg::BindingReleased { .. } => TerminalOp::BindingReleased,
            TerminalMsg::Subscribe { .. } => TerminalOp::Subscribe,
            TerminalMsg::Unsubscribe { .. } => TerminalOp::Unsubscribe,
            TerminalMsg::Data { .. } => TerminalOp::Data,
            TerminalMsg::CachedData { .. } => TerminalOp::CachedData,
            TerminalMsg::Scatter { .. } => TerminalOp::Scatter,
            TerminalMsg::Gather { .. } => TerminalOp::Gather,
        }
    }

    fn put_body(&self, out: &mut Vec<u8>) {
        match self {
            TerminalMsg::TerminalDescription { identifier, id }
            | TerminalMsg::BindingDescription { identifier, id } => {
                identifier.put(out);
                id.put(out);
            }
            TerminalMsg::TerminalMapping { terminal_id, mapped_id } => {
                terminal_id.put(out);
                mapped_id.put(out);
            }
            TerminalMsg::BindingMapping { binding_id, mapped_id } => {
                binding_id.put(out);
                mapped_id.put(out);
            }
            TerminalMsg::TerminalNoticed { terminal_id }
            | TerminalMsg::TerminalRemovedAck { terminal_id }
            | TerminalMsg::Subscribe { terminal_id }
            | TerminalMsg::Unsubscribe { terminal_id } => terminal_id.put(out),
            TerminalMsg::TerminalRemoved { mapped_id }
            | TerminalMsg::BindingRemoved { mapped_id } => mapped_id.put(out),
            TerminalMsg::BindingNoticed { binding_id }
            | TerminalMsg::BindingRemovedAck { binding_id }
            | TerminalMsg::BindingEstablished { binding_id }
            | TerminalMsg::BindingReleased { binding_id } => binding_id.put(out),
            TerminalMsg::Data { subscription_id, data }
            | TerminalMsg::CachedData { subscription_id, data } => {
                subscription_id.put(out);
                varint::put_bytes(out, data);
            }
            TerminalMsg::Scatter { subscription_id, operation_id, data } => {
                subscription_id.put(out);
                operation_id.put(out);
                varint::put_bytes(out, data);
            }
            TerminalMsg::Gather { operation_id, flags, data } => {
                operation_id.put(out);
                flags.put(out);
                varint::put_bytes(out, data);
            }
        }
    }

    fn read_body(op: TerminalOp, r: &mut Reader<'_>) -> Result<TerminalMsg, WireError> {
        let msg = match op {
            TerminalOp::TerminalDescription => TerminalMsg::TerminalDescription {
                identifier: Identifier::read(r)?,
                id: Id::read(r)?,
            },
            TerminalOp::TerminalMapping => TerminalMsg::TerminalMapping {
                terminal_id: Id::read(r)?,
                mapped_id: Id::read(r)?,
            },
            TerminalOp::TerminalNoticed => TerminalMsg::TerminalNoticed { terminal_id: Id::read(r)? },
            TerminalOp::TerminalRemoved => TerminalMsg::TerminalRemoved { mapped_id: Id::read(r)? },
            TerminalOp::TerminalRemovedAck => {
                TerminalMsg::TerminalRemovedAck { terminal_id: Id::read(r)? }
            }
            TerminalOp::BindingDescription => TerminalMsg::BindingDescription {
                identifier: Identifier::read(r)?,
                id: Id::read(r)?,
            },
            TerminalOp::BindingMapping => TerminalMsg::BindingMapping {
                binding_id: Id::read(r)?,
                mapped_id: Id::read(r)?,
            },
            TerminalOp::BindingNoticed => TerminalMsg::BindingNoticed { binding_id: Id::read(r)? },
            TerminalOp::BindingRemoved => TerminalMsg::BindingRemoved { mapped_id: Id::read(r)? },
            TerminalOp::BindingRemovedAck => {
                TerminalMsg::BindingRemovedAck { binding_id: Id::read(r)? }
            }
            TerminalOp::BindingEstablished => {
                TerminalMsg::BindingEstablished { binding_id: Id::read(r)? }
            }
            TerminalOp::BindingReleased => TerminalMsg::BindingReleased { binding_id: Id::read(r)? },
            TerminalOp::Subscribe => TerminalMsg::Subscribe { terminal_id: Id::read(r)? },
            TerminalOp::Unsubscribe => TerminalMsg::Unsubscribe { terminal_id: Id::read(r)? },
            TerminalOp::Data => TerminalMsg::Data {
                subscription_id: Id::read(r)?,
                data: r.bytes()?,
            },
            TerminalOp::CachedData => TerminalMsg::CachedData {
                subscription_id: Id::read(r)?,
                data: r.bytes()?,
            },
            TerminalOp::Scatter => TerminalMsg::Scatter {
                subscription_id: Id::read(r)?,
                operation_id: Id::read(r)?,
                data: r.bytes()?,
            },
            TerminalOp::Gather => TerminalMsg::Gather {
                operation_id: Id::read(r)?,
                flags: GatherFlags::read(r)?,
                data: r.bytes()?,
            },
        };
        Ok(msg)
    }
}

/// A framed message: heartbeat, broadcast, or a terminal message tagged
/// with its pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Heartbeat,
    Broadcast { data: Vec<u8> },
    Terminal { pattern: Pattern, msg: TerminalMsg },
}

impl Message {
    pub fn type_id(&self) -> Result<u64, WireError> {
        match self {
            Message::Heartbeat => Ok(HEARTBEAT_TYPE_ID),
            Message::Broadcast { .. } => Ok(BROADCAST_TYPE_ID),
            Message::Terminal { pattern, msg } => {
                type_id(*pattern, msg.op()).ok_or(WireError::KindNotInPattern)
            }
        }
    }

    /// Serialize as a full frame: length prefix, type-id, payload.  The
    /// length prefix covers the type-id and payload only.
    pub fn encode_frame(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        let type_id = self.type_id()?;
        let mut body = Vec::new();
        varint::put_u64(&mut body, type_id);
        match self {
            Message::Heartbeat => {}
            Message::Broadcast { data } => varint::put_bytes(&mut body, data),
            Message::Terminal { msg, .. } => msg.put_body(&mut body),
        }
        varint::put_u64(out, body.len() as u64);
        out.extend_from_slice(&body);
        Ok(())
    }

    /// Decode a frame body (type-id plus payload).  The declared frame
    /// length must match the length the deserializer consumes; a mismatch
    /// is a protocol error.
    pub fn decode(body: &[u8]) -> Result<Message, WireError> {
        let mut r = Reader::new(body);
        let type_id = r.u64()?;
        let msg = match type_id {
            HEARTBEAT_TYPE_ID => Message::Heartbeat,
            BROADCAST_TYPE_ID => Message::Broadcast { data: r.bytes()? },
            other => {
                let (pattern, op) =
                    from_type_id(other).ok_or(WireError::UnknownTypeId(other))?;
                Message::Terminal { pattern, msg: TerminalMsg::read_body(op, &mut r)? }
            }
        };
        r.expect_end()?;
        Ok(msg)
    }
}
