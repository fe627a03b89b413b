//! Connection establishment.
//!
//! Walks a fresh byte transport through the five-step handshake; both peers
//! run the identical sequence regardless of who dialed.
//!
//! # Protocol
//! 1. Info exchange — each side sends its info message (29-byte header,
//!    varint body) and reads the peer's in two receives (header, body).
//! 2. Loopback check — a peer carrying our own identity is rejected.
//! 3. Info-ack — a single `0x00` byte each way.  A malformed ack is
//!    latched and returned when authentication is attempted, before any
//!    challenge goes out, so both ends observe consistent progress up to
//!    this point.
//! 4. Authentication — 8 random challenge bytes each way; each side
//!    answers with `SHA-256(remote-challenge || password-hash)` and
//!    compares the peer's answer against its own expectation.
//! 5. Solution-ack — same framing as the info-ack, but a malformed value
//!    here is latched and surfaced to the session handler once the
//!    session starts.  A solution mismatch fails with *password-mismatch*
//!    only after this ack, so both sides tear down symmetrically.

use crate::branch::info::{LocalBranchInfo, RemoteBranchInfo};
use crate::error::{Error, Result};
use crate::transport::byte::ByteTransport;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use weft_wire::WireError;
use weft_wire::beacon::INFO_HEADER_SIZE;

/// The acknowledgement byte.
pub const ACK: u8 = 0x00;

const CHALLENGE_LEN: usize = 8;
const SOLUTION_LEN: usize = 32;

/// Hash a cleartext network password for use in the handshake.
pub fn hash_password(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

/// Outcome of a completed handshake.
pub struct Established {
    pub transport: ByteTransport,
    pub remote: RemoteBranchInfo,
    /// Error latched during the solution-ack exchange; delivered to the
    /// session handler once the session starts.
    pub next_result: Option<Error>,
}

/// Run the full handshake over `transport`.
///
/// `peer_addr` is the transport's source address; together with the
/// advertised port it forms the peer's TCP server endpoint.
pub async fn establish(
    mut transport: ByteTransport,
    local: &LocalBranchInfo,
    password_hash: &[u8; 32],
    peer_addr: IpAddr,
) -> Result<Established> {
    let mut next_result = None;

    // Step 1: info exchange.
    transport.send_all(local.info_message()).await?;
    let mut header = [0u8; INFO_HEADER_SIZE];
    transport.receive_all(&mut header).await?;
    let (uuid, advertised_port, body_len) = RemoteBranchInfo::decode_header(&header)?;
    let mut body = vec![0u8; body_len];
    transport.receive_all(&mut body).await?;
    let remote = RemoteBranchInfo::from_parts(uuid, advertised_port, &body, peer_addr)?;

    // Step 2: loopback check.
    if remote.info.uuid == local.info.uuid {
        return Err(Error::LoopbackConnection);
    }

    // Step 3: info-ack.  A latched error fails establishment here, before
    // any challenge goes out; the peer stops at the same point, so both
    // ends observe consistent progress.
    exchange_ack(&mut transport, &mut next_result).await?;
    if let Some(err) = next_result.take() {
        return Err(err);
    }

    // Step 4: authentication.
    let mut my_challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut my_challenge);
    transport.send_all(&my_challenge).await?;
    let mut remote_challenge = [0u8; CHALLENGE_LEN];
    transport.receive_all(&mut remote_challenge).await?;

    transport.send_all(&solve_challenge(&remote_challenge, password_hash)).await?;
    let mut received_solution = [0u8; SOLUTION_LEN];
    transport.receive_all(&mut received_solution).await?;
    let solutions_match = received_solution == solve_challenge(&my_challenge, password_hash);

    // Step 5: solution-ack, then the verdict.
    exchange_ack(&mut transport, &mut next_result).await?;
    if !solutions_match {
        return Err(Error::PasswordMismatch);
    }

    Ok(Established { transport, remote, next_result })
}

fn solve_challenge(challenge: &[u8; CHALLENGE_LEN], password_hash: &[u8; 32]) -> [u8; SOLUTION_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(password_hash);
    hasher.finalize().into()
}

/// Send our ack, read the peer's, and latch a malformed value into
/// `next_result` without failing the exchange.
async fn exchange_ack(transport: &mut ByteTransport, next_result: &mut Option<Error>) -> Result<()> {
    transport.send_all(&[ACK]).await?;
    let mut ack = [0u8; 1];
    transport.receive_all(&mut ack).await?;
    if ack[0] != ACK && next_result.is_none() {
        *next_result = Some(Error::DeserializeFailed(WireError::BadAck(ack[0])));
    }
    Ok(())
}
