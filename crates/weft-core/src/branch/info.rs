//! Branch identity, capabilities, and the messages advertising them.
//!
//! A branch advertises a 25-byte beacon datagram and exchanges a larger
//! info message (29-byte header plus varint-encoded body) during session
//! establishment.  Both are rendered once at branch construction and
//! reused for every send.

use crate::config::{BranchConfig, MAX_INFO_BODY_SIZE, hostname};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use uuid::Uuid;
use weft_wire::beacon;
use weft_wire::varint::{self, Reader};

/// Identity and capabilities of a branch, local or remote.
#[derive(Debug, Clone)]
pub struct BranchInfo {
    /// Random identity, stable for the branch lifetime.
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub network_name: String,
    pub path: String,
    pub hostname: String,
    pub pid: u32,
    /// Endpoint on which the branch accepts peer connections.
    pub tcp_ep: SocketAddr,
    pub start_time: DateTime<Utc>,
    /// Session timeout; peers heartbeat at half this value.
    pub timeout: Duration,
    /// Beacon interval; `None` when the branch does not advertise.
    pub adv_interval: Option<Duration>,
    pub ghost_mode: bool,
    pub tx_queue_size: usize,
    pub rx_queue_size: usize,
}

impl BranchInfo {
    /// The interval at which the *peer* of this branch must emit
    /// heartbeats to keep a session alive.
    pub fn heartbeat_interval(&self) -> Duration {
        self.timeout / 2
    }

    fn put_body(&self, out: &mut Vec<u8>) {
        varint::put_str(out, &self.name);
        varint::put_str(out, &self.description);
        varint::put_str(out, &self.network_name);
        varint::put_str(out, &self.path);
        varint::put_str(out, &self.hostname);
        varint::put_u64(out, u64::from(self.pid));
        varint::put_u64(out, self.start_time.timestamp_nanos_opt().unwrap_or(0) as u64);
        varint::put_u64(out, self.timeout.as_nanos() as u64);
        varint::put_u64(
            out,
            self.adv_interval.map_or(0, |i| i.as_nanos() as u64),
        );
        varint::put_bool(out, self.ghost_mode);
        varint::put_u64(out, self.tx_queue_size as u64);
        varint::put_u64(out, self.rx_queue_size as u64);
    }
}

impl fmt::Display for BranchInfo {
    // format like this: [6ba7b810-9dad-11d1-80b4-00c04fd430c8]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.uuid)
    }
}

// ---------------------------------------------------------------------------
// Local side
// ---------------------------------------------------------------------------

/// The local branch's info plus its pre-rendered wire messages.
#[derive(Debug)]
pub struct LocalBranchInfo {
    pub info: BranchInfo,
    /// Multicast group + port beacons are sent to.
    pub adv_ep: SocketAddr,
    /// Interface addresses used for advertising.
    pub adv_ifs: Vec<IpAddr>,
    beacon_msg: [u8; beacon::BEACON_SIZE],
    info_msg: Vec<u8>,
}

impl LocalBranchInfo {
    /// Build the local info from a validated config and the bound TCP
    /// endpoint.
    pub fn new(cfg: &BranchConfig, tcp_ep: SocketAddr) -> Result<LocalBranchInfo> {
        let info = BranchInfo {
            uuid: Uuid::new_v4(),
            name: cfg.resolved_name(),
            description: cfg.description.clone(),
            network_name: cfg.resolved_network_name(),
            path: cfg.resolved_path(),
            hostname: hostname(),
            pid: std::process::id(),
            tcp_ep,
            start_time: Utc::now(),
            timeout: cfg.timeout_duration(),
            adv_interval: cfg.advertising_interval_duration(),
            ghost_mode: cfg.ghost_mode,
            tx_queue_size: cfg.tx_queue_size,
            rx_queue_size: cfg.rx_queue_size,
        };
        let adv_addr: IpAddr = cfg
            .advertising_address
            .parse()
            .map_err(|_| Error::BindSocketFailed(cfg.advertising_address.clone()))?;
        let adv_ifs = cfg
            .advertising_interfaces
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| Error::BindSocketFailed(format!("bad interface address '{s}'")))
            })
            .collect::<Result<Vec<IpAddr>>>()?;

        let beacon_msg = beacon::encode_beacon(&info.uuid, tcp_ep.port());
        let mut body = Vec::new();
        info.put_body(&mut body);
        let mut info_msg =
            beacon::encode_info_header(&info.uuid, tcp_ep.port(), body.len() as u32).to_vec();
        info_msg.extend_from_slice(&body);

        Ok(LocalBranchInfo {
            info,
            adv_ep: SocketAddr::new(adv_addr, cfg.advertising_port),
            adv_ifs,
            beacon_msg,
            info_msg,
        })
    }

    pub fn beacon_message(&self) -> &[u8] {
        &self.beacon_msg
    }

    pub fn info_message(&self) -> &[u8] {
        &self.info_msg
    }
}

// ---------------------------------------------------------------------------
// Remote side
// ---------------------------------------------------------------------------

/// A peer's info as decoded from its info message.
#[derive(Debug)]
pub struct RemoteBranchInfo {
    pub info: BranchInfo,
    /// When the session to this peer was established.
    pub connected_since: DateTime<Utc>,
}

impl RemoteBranchInfo {
    /// Parse an info-message header, returning (identity, advertised port,
    /// body length).  A body length over the configured maximum fails with
    /// *payload-too-large*.
    pub fn decode_header(header: &[u8]) -> Result<(Uuid, u16, usize)> {
        let (uuid, port, body_len) = beacon::decode_info_header(header)?;
        if body_len > MAX_INFO_BODY_SIZE {
            return Err(Error::PayloadTooLarge { size: body_len, max: MAX_INFO_BODY_SIZE });
        }
        Ok((uuid, port, body_len))
    }

    /// Assemble the remote info from a decoded header and body.  The TCP
    /// endpoint is the datagram/stream source address plus the advertised
    /// port.
    pub fn from_parts(
        uuid: Uuid,
        advertised_port: u16,
        body: &[u8],
        peer_addr: IpAddr,
    ) -> Result<RemoteBranchInfo> {
        let mut r = Reader::new(body);
        let name = r.str()?;
        let description = r.str()?;
        let network_name = r.str()?;
        let path = r.str()?;
        let host = r.str()?;
        let pid = u32::try_from(r.u64()?).map_err(|_| Error::DeserializeFailed(
            weft_wire::WireError::VarintOverflow,
        ))?;
        let start_nanos = r.u64()?;
        let timeout_nanos = r.u64()?;
        let adv_nanos = r.u64()?;
        let ghost_mode = r.bool()?;
        let tx_queue_size = r.u64()? as usize;
        let rx_queue_size = r.u64()? as usize;
        r.expect_end().map_err(Error::DeserializeFailed)?;

        Ok(RemoteBranchInfo {
            info: BranchInfo {
                uuid,
                name,
                description,
                network_name,
                path,
                hostname: host,
                pid,
                tcp_ep: SocketAddr::new(peer_addr, advertised_port),
                start_time: DateTime::from_timestamp_nanos(start_nanos as i64),
                timeout: Duration::from_nanos(timeout_nanos),
                adv_interval: if adv_nanos == 0 {
                    None
                } else {
                    Some(Duration::from_nanos(adv_nanos))
                },
                ghost_mode,
                tx_queue_size,
                rx_queue_size,
            },
            connected_since: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BranchConfig;

    fn local_info() -> LocalBranchInfo {
        let cfg = BranchConfig::from_json_str(
            r#"{"name": "alpha", "description": "test branch", "ghost_mode": true}"#,
        )
        .unwrap();
        LocalBranchInfo::new(&cfg, "127.0.0.1:24001".parse().unwrap()).unwrap()
    }

    #[test]
    fn info_message_round_trips_through_remote_decode() {
        let local = local_info();
        let msg = local.info_message();

        let (uuid, port, body_len) =
            RemoteBranchInfo::decode_header(&msg[..beacon::INFO_HEADER_SIZE]).unwrap();
        assert_eq!(uuid, local.info.uuid);
        assert_eq!(port, 24001);
        assert_eq!(beacon::INFO_HEADER_SIZE + body_len, msg.len());

        let remote = RemoteBranchInfo::from_parts(
            uuid,
            port,
            &msg[beacon::INFO_HEADER_SIZE..],
            "10.1.2.3".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(remote.info.name, "alpha");
        assert_eq!(remote.info.description, "test branch");
        assert_eq!(remote.info.tcp_ep, "10.1.2.3:24001".parse().unwrap());
        assert!(remote.info.ghost_mode);
        assert_eq!(remote.info.timeout, local.info.timeout);
        assert_eq!(remote.info.tx_queue_size, local.info.tx_queue_size);
        assert_eq!(
            remote.info.start_time.timestamp_nanos_opt(),
            local.info.start_time.timestamp_nanos_opt()
        );
    }

    #[test]
    fn oversized_body_length_is_rejected_at_the_header() {
        let local = local_info();
        let header = beacon::encode_info_header(
            &local.info.uuid,
            24001,
            (MAX_INFO_BODY_SIZE + 1) as u32,
        );
        assert!(matches!(
            RemoteBranchInfo::decode_header(&header),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn heartbeat_interval_is_half_the_timeout() {
        let local = local_info();
        assert_eq!(local.info.heartbeat_interval() * 2, local.info.timeout);
    }
}
