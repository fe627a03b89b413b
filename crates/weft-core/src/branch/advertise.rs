//! Beacon advertising over UDP multicast.
//!
//! The sender opens one socket per configured interface, pins the outbound
//! interface option, and posts the branch's 25-byte beacon at the
//! configured interval.  An interface that fails a send is dropped from
//! the rotation; once all are gone, advertising stops silently.
//!
//! The receiver binds a single address-reuse socket on the advertising
//! port, joins the multicast group on every configured interface, and
//! reports valid beacons to an observer as `(identity, deduced TCP
//! endpoint)` — the endpoint being the datagram source address plus the
//! advertised port.  Beacons carrying our own identity are discarded.

use crate::branch::info::LocalBranchInfo;
use crate::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use weft_wire::beacon;

fn new_udp_socket(addr: &SocketAddr) -> Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::OpenSocketFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::SetSocketOptionFailed(e.to_string()))?;
    Ok(socket)
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Start the beacon sender; returns `None` when advertising is disabled.
pub fn start_sender(local: Arc<LocalBranchInfo>) -> Result<Option<JoinHandle<()>>> {
    let Some(interval) = local.info.adv_interval else {
        return Ok(None);
    };

    let mut sockets = Vec::new();
    for &addr in &local.adv_ifs {
        match configure_sender_socket(addr, &local.adv_ep) {
            Ok(socket) => {
                info!(interface = %addr, "using interface for sending advertising messages");
                sockets.push((addr, socket));
            }
            Err(Error::SetSocketOptionFailed(msg)) => {
                error!(
                    interface = %addr,
                    error = %msg,
                    "could not set outbound interface; this interface will be ignored"
                );
            }
            Err(err) => return Err(err),
        }
    }

    let handle = tokio::spawn(async move {
        let mut sockets = sockets;
        loop {
            if sockets.is_empty() {
                error!("no network interfaces available for sending advertising messages");
                return;
            }
            let mut failed = Vec::new();
            for (i, (addr, socket)) in sockets.iter().enumerate() {
                if let Err(e) = socket.send_to(local.beacon_message(), local.adv_ep).await {
                    error!(
                        interface = %addr,
                        error = %e,
                        "sending advertisement failed; no more advertising over this interface"
                    );
                    failed.push(i);
                }
            }
            for i in failed.into_iter().rev() {
                sockets.remove(i);
            }
            tokio::time::sleep(interval).await;
        }
    });
    Ok(Some(handle))
}

fn configure_sender_socket(if_addr: IpAddr, adv_ep: &SocketAddr) -> Result<UdpSocket> {
    let bind_addr = SocketAddr::new(if_addr, 0);
    let socket = new_udp_socket(&bind_addr)?;
    match (if_addr, adv_ep.ip()) {
        (IpAddr::V4(v4), IpAddr::V4(_)) => {
            socket
                .set_multicast_if_v4(&v4)
                .map_err(|e| Error::SetSocketOptionFailed(e.to_string()))?;
            socket
                .set_multicast_loop_v4(true)
                .map_err(|e| Error::SetSocketOptionFailed(e.to_string()))?;
        }
        (IpAddr::V6(_), IpAddr::V6(_)) => {
            socket
                .set_multicast_loop_v6(true)
                .map_err(|e| Error::SetSocketOptionFailed(e.to_string()))?;
        }
        _ => {
            return Err(Error::SetSocketOptionFailed(format!(
                "interface {if_addr} does not match the advertising address family"
            )));
        }
    }
    socket
        .bind(&bind_addr.into())
        .map_err(|e| Error::BindSocketFailed(e.to_string()))?;
    UdpSocket::from_std(socket.into()).map_err(|e| Error::OpenSocketFailed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Start the beacon receiver.
///
/// Returns the task handle and the bound local address (relevant when the
/// advertising port was 0).  `observer` runs for every valid beacon from
/// another branch.
pub fn start_receiver(
    local: Arc<LocalBranchInfo>,
    observer: impl Fn(Uuid, SocketAddr) + Send + 'static,
) -> Result<(JoinHandle<()>, SocketAddr)> {
    let group = local.adv_ep.ip();
    let bind_addr = SocketAddr::new(
        if group.is_ipv4() { "0.0.0.0".parse().unwrap() } else { "::".parse().unwrap() },
        local.adv_ep.port(),
    );
    let socket = new_udp_socket(&bind_addr)?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::SetSocketOptionFailed(e.to_string()))?;
    socket
        .bind(&bind_addr.into())
        .map_err(|e| Error::BindSocketFailed(e.to_string()))?;
    let socket =
        UdpSocket::from_std(socket.into()).map_err(|e| Error::OpenSocketFailed(e.to_string()))?;

    let mut joined = false;
    for &addr in &local.adv_ifs {
        let res = match (group, addr) {
            (IpAddr::V4(group), IpAddr::V4(ifc)) => socket.join_multicast_v4(group, ifc),
            (IpAddr::V6(group), IpAddr::V6(_)) => socket.join_multicast_v6(&group, 0),
            _ => continue,
        };
        match res {
            Ok(()) => {
                info!(interface = %addr, "using interface for receiving advertising messages");
                joined = true;
            }
            Err(e) => error!(
                interface = %addr,
                error = %e,
                "could not join advertising multicast group; this interface will be ignored"
            ),
        }
    }
    if !joined {
        error!("no network interfaces available for receiving advertising messages");
    }

    let bound = socket
        .local_addr()
        .map_err(|e| Error::BindSocketFailed(e.to_string()))?;
    let handle = tokio::spawn(run_receiver(socket, local, observer));
    Ok((handle, bound))
}

async fn run_receiver(
    socket: UdpSocket,
    local: Arc<LocalBranchInfo>,
    observer: impl Fn(Uuid, SocketAddr) + Send + 'static,
) {
    let mut buf = [0u8; beacon::BEACON_SIZE + 1];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(ok) => ok,
            Err(e) => {
                error!(error = %e, "failed to receive advertising message; receiver stopping");
                return;
            }
        };
        if n != beacon::BEACON_SIZE {
            warn!(from = %from, size = n, "unexpected advertising message size received");
            continue;
        }
        let (uuid, tcp_port) = match beacon::decode_beacon(&buf[..n]) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(from = %from, error = %e, "invalid advertising message received");
                continue;
            }
        };
        // Ignore advertising messages that we sent ourselves.
        if uuid == local.info.uuid {
            continue;
        }
        debug!(peer = %uuid, from = %from, "beacon observed");
        observer(uuid, SocketAddr::new(from.ip(), tcp_port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BranchConfig;
    use tokio::sync::mpsc;

    fn local_on_port(port: u16) -> Arc<LocalBranchInfo> {
        let cfg = BranchConfig::from_json_str(&format!(
            r#"{{"name": "adv", "advertising_port": {port}}}"#
        ))
        .unwrap();
        Arc::new(LocalBranchInfo::new(&cfg, "127.0.0.1:24001".parse().unwrap()).unwrap())
    }

    #[tokio::test]
    async fn receiver_reports_foreign_beacons_and_discards_its_own() {
        let local = local_on_port(0);
        let (obs_tx, mut obs_rx) = mpsc::unbounded_channel();
        let (_task, bound) = start_receiver(Arc::clone(&local), move |uuid, ep| {
            let _ = obs_tx.send((uuid, ep));
        })
        .unwrap();
        let target = SocketAddr::new("127.0.0.1".parse().unwrap(), bound.port());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Our own beacon must be discarded.
        sender.send_to(local.beacon_message(), target).await.unwrap();
        // Truncated datagrams are ignored with a log line.
        sender.send_to(&[0u8; 10], target).await.unwrap();
        // A foreign beacon is reported with the deduced TCP endpoint.
        let peer_uuid = Uuid::new_v4();
        let foreign = beacon::encode_beacon(&peer_uuid, 10000);
        sender.send_to(&foreign, target).await.unwrap();

        let (uuid, ep) = obs_rx.recv().await.unwrap();
        assert_eq!(uuid, peer_uuid);
        assert_eq!(ep.port(), 10000);
        assert_eq!(ep.ip(), sender.local_addr().unwrap().ip());
        assert!(obs_rx.try_recv().is_err(), "own/truncated beacons must not be reported");
    }

    #[tokio::test]
    async fn two_receivers_share_the_advertising_port() {
        // Address reuse lets several branches on one host observe beacons.
        let first = local_on_port(0);
        let (_t1, bound) = start_receiver(Arc::clone(&first), |_, _| {}).unwrap();

        let second = local_on_port(bound.port());
        let res = start_receiver(second, |_, _| {});
        assert!(res.is_ok(), "second bind on the advertising port must succeed");
    }
}
