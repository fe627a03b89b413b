//! Bit-flags carried on gather replies.

use crate::WireError;
use crate::varint::Reader;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Flags attached to each gather reply of a scatter-gather operation.
///
/// `FINISHED` marks the terminal reply of an operation.  `IGNORED` and
/// `DEAF` are non-data replies; `BINDING_DESTROYED` and `CONNECTION_LOST`
/// are terminal conditions generated when a binding or session disappears
/// mid-operation.  The raw value must fit in seven bits on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatherFlags(u8);

impl GatherFlags {
    pub const NONE: GatherFlags = GatherFlags(0);
    pub const FINISHED: GatherFlags = GatherFlags(1 << 0);
    pub const IGNORED: GatherFlags = GatherFlags(1 << 1);
    pub const DEAF: GatherFlags = GatherFlags(1 << 2);
    pub const BINDING_DESTROYED: GatherFlags = GatherFlags(1 << 3);
    pub const CONNECTION_LOST: GatherFlags = GatherFlags(1 << 4);

    const ALL_BITS: u8 = 0x1f;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Result<GatherFlags, WireError> {
        if bits & !Self::ALL_BITS != 0 {
            return Err(WireError::BadGatherFlags(bits));
        }
        Ok(GatherFlags(bits))
    }

    pub fn contains(self, other: GatherFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn put(self, out: &mut Vec<u8>) {
        debug_assert!(self.0 <= 0x7f);
        out.push(self.0);
    }

    pub fn read(r: &mut Reader<'_>) -> Result<GatherFlags, WireError> {
        GatherFlags::from_bits(r.u8()?)
    }
}

impl BitOr for GatherFlags {
    type Output = GatherFlags;

    fn bitor(self, rhs: GatherFlags) -> GatherFlags {
        GatherFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for GatherFlags {
    fn bitor_assign(&mut self, rhs: GatherFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for GatherFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "NO_FLAGS");
        }
        let names = [
            (GatherFlags::FINISHED, "FINISHED"),
            (GatherFlags::IGNORED, "IGNORED"),
            (GatherFlags::DEAF, "DEAF"),
            (GatherFlags::BINDING_DESTROYED, "BINDING_DESTROYED"),
            (GatherFlags::CONNECTION_LOST, "CONNECTION_LOST"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::Reader;

    #[test]
    fn all_flags_combined_fit_on_the_wire() {
        let all = GatherFlags::FINISHED
            | GatherFlags::IGNORED
            | GatherFlags::DEAF
            | GatherFlags::BINDING_DESTROYED
            | GatherFlags::CONNECTION_LOST;
        assert_eq!(all.bits(), 31);

        let mut buf = Vec::new();
        all.put(&mut buf);
        assert_eq!(buf.len(), 1);
        let mut r = Reader::new(&buf);
        assert_eq!(GatherFlags::read(&mut r).unwrap(), all);
    }

    #[test]
    fn unknown_bits_are_rejected() {
        assert_eq!(GatherFlags::from_bits(0x20), Err(WireError::BadGatherFlags(0x20)));
        assert_eq!(GatherFlags::from_bits(0x80), Err(WireError::BadGatherFlags(0x80)));
    }

    #[test]
    fn display_names_the_set_flags() {
        assert_eq!(GatherFlags::NONE.to_string(), "NO_FLAGS");
        let flags = GatherFlags::DEAF | GatherFlags::IGNORED;
        assert_eq!(flags.to_string(), "IGNORED | DEAF");
    }
}
