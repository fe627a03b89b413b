//! Advertising datagram and session info-message header layouts.
//!
//! The advertising datagram is 25 bytes: 4-byte magic, 3-byte protocol
//! version (major/minor/patch), 16-byte branch identity, 2-byte big-endian
//! TCP port.  The session info-message header is the same 25 bytes followed
//! by a 4-byte big-endian body length.  All multi-byte header integers are
//! big-endian.

use crate::WireError;
use uuid::Uuid;

pub const MAGIC: [u8; 4] = *b"YOGI";

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_PATCH: u8 = 0;

pub const BEACON_SIZE: usize = 25;
pub const INFO_HEADER_SIZE: usize = BEACON_SIZE + 4;

/// Render the 25-byte advertising datagram.
pub fn encode_beacon(identity: &Uuid, tcp_port: u16) -> [u8; BEACON_SIZE] {
    let mut out = [0u8; BEACON_SIZE];
    out[..4].copy_from_slice(&MAGIC);
    out[4] = VERSION_MAJOR;
    out[5] = VERSION_MINOR;
    out[6] = VERSION_PATCH;
    out[7..23].copy_from_slice(identity.as_bytes());
    out[23..25].copy_from_slice(&tcp_port.to_be_bytes());
    out
}

/// Parse an advertising datagram into (identity, advertised TCP port).
///
/// The magic prefix must match and the peer's major/minor version must
/// equal ours; the patch level is free to differ.
pub fn decode_beacon(buf: &[u8]) -> Result<(Uuid, u16), WireError> {
    if buf.len() < BEACON_SIZE {
        return Err(WireError::UnexpectedEof);
    }
    if buf[..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let (major, minor, patch) = (buf[4], buf[5], buf[6]);
    if major != VERSION_MAJOR || minor != VERSION_MINOR {
        return Err(WireError::IncompatibleVersion { major, minor, patch });
    }
    let identity = Uuid::from_slice(&buf[7..23]).map_err(|_| WireError::UnexpectedEof)?;
    let tcp_port = u16::from_be_bytes([buf[23], buf[24]]);
    Ok((identity, tcp_port))
}

/// Render the 29-byte info-message header.
pub fn encode_info_header(identity: &Uuid, tcp_port: u16, body_len: u32) -> [u8; INFO_HEADER_SIZE] {
    let mut out = [0u8; INFO_HEADER_SIZE];
    out[..BEACON_SIZE].copy_from_slice(&encode_beacon(identity, tcp_port));
    out[BEACON_SIZE..].copy_from_slice(&body_len.to_be_bytes());
    out
}

/// Parse an info-message header into (identity, advertised TCP port,
/// body length).
pub fn decode_info_header(buf: &[u8]) -> Result<(Uuid, u16, usize), WireError> {
    if buf.len() < INFO_HEADER_SIZE {
        return Err(WireError::UnexpectedEof);
    }
    let (identity, tcp_port) = decode_beacon(buf)?;
    let body_len = u32::from_be_bytes([buf[25], buf[26], buf[27], buf[28]]);
    Ok((identity, tcp_port, body_len as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_layout_is_pinned() {
        let identity = Uuid::from_bytes([
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
        ]);
        let beacon = encode_beacon(&identity, 10000);
        assert_eq!(beacon.len(), 25);
        assert_eq!(&beacon[..4], b"YOGI");
        assert_eq!(beacon[4..7], [VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH]);
        assert_eq!(&beacon[7..23], identity.as_bytes());
        assert_eq!(beacon[23..25], 10000u16.to_be_bytes());

        assert_eq!(decode_beacon(&beacon).unwrap(), (identity, 10000));
    }

    #[test]
    fn wrong_magic_and_version_are_rejected() {
        let identity = Uuid::new_v4();
        let mut beacon = encode_beacon(&identity, 1);
        beacon[0] = b'X';
        assert_eq!(decode_beacon(&beacon), Err(WireError::BadMagic));

        let mut beacon = encode_beacon(&identity, 1);
        beacon[4] = VERSION_MAJOR.wrapping_add(1);
        assert!(matches!(
            decode_beacon(&beacon),
            Err(WireError::IncompatibleVersion { .. })
        ));

        // Patch level differences are compatible.
        let mut beacon = encode_beacon(&identity, 1);
        beacon[6] = VERSION_PATCH.wrapping_add(3);
        assert!(decode_beacon(&beacon).is_ok());
    }

    #[test]
    fn info_header_carries_the_body_length() {
        let identity = Uuid::new_v4();
        let header = encode_info_header(&identity, 24001, 321);
        assert_eq!(header.len(), 29);
        let (id, port, body_len) = decode_info_header(&header).unwrap();
        assert_eq!((id, port, body_len), (identity, 24001, 321));
    }
}
