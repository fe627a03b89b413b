//! Integration: wire corner cases and session establishment.
//!
//! Covers the varint boundary values, loopback and password rejection on
//! real handshakes, the duplicate-connection tie-break under simultaneous
//! reciprocal dials, and heartbeat-maintained liveness.

use std::sync::Arc;
use std::time::Duration;
use weft_core::Error;
use weft_core::branch::connect::{establish, hash_password};
use weft_core::branch::info::LocalBranchInfo;
use weft_core::transport::ByteTransport;
use weft_test_utils::{HARNESS_TIMEOUT, test_config};

#[test]
fn varint_boundary_values_round_trip() {
    use weft::wire::varint;

    let cases: [(u64, usize); 6] =
        [(0, 1), (127, 1), (128, 2), (16383, 2), (16384, 3), (4_294_967_295, 5)];
    for (value, expected_len) in cases {
        let mut buf = Vec::new();
        varint::put_u64(&mut buf, value);
        assert_eq!(buf.len(), expected_len, "encoded length of {value}");
        let (decoded, used) = varint::get_u64(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(used, expected_len);
    }
}

#[tokio::test]
async fn loopback_identities_fail_fast_on_both_sides() {
    // Both ends of a socketpair advertise the same identity.
    let cfg = test_config("narcissus");
    let info = Arc::new(LocalBranchInfo::new(&cfg, "127.0.0.1:1".parse().unwrap()).unwrap());
    let hash = hash_password("");
    let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();
    let (ta, tb) = ByteTransport::pair();

    let info_a = Arc::clone(&info);
    let both = async {
        tokio::join!(
            establish(ta, &info_a, &hash, ip),
            establish(tb, &info, &hash, ip),
        )
    };
    // Well within the 100 ms bound; no user handler ever runs.
    let (res_a, res_b) = tokio::time::timeout(Duration::from_millis(100), both)
        .await
        .expect("loopback must fail fast");
    assert!(matches!(res_a, Err(Error::LoopbackConnection)));
    assert!(matches!(res_b, Err(Error::LoopbackConnection)));
}

#[tokio::test]
async fn password_mismatch_is_symmetric() {
    let mut cfg_a = test_config("alice");
    cfg_a.network_password = "alpha".to_owned();
    let mut cfg_b = test_config("bob");
    cfg_b.network_password = "beta".to_owned();

    let info_a = Arc::new(LocalBranchInfo::new(&cfg_a, "127.0.0.1:1".parse().unwrap()).unwrap());
    let info_b = Arc::new(LocalBranchInfo::new(&cfg_b, "127.0.0.1:2".parse().unwrap()).unwrap());
    let hash_a = hash_password(&cfg_a.network_password);
    let hash_b = hash_password(&cfg_b.network_password);
    let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();

    let (ta, tb) = ByteTransport::pair();
    let (res_a, res_b) = tokio::join!(
        establish(ta, &info_a, &hash_a, ip),
        establish(tb, &info_b, &hash_b, ip),
    );
    // Both sides observe the mismatch exactly once, after the second ack.
    assert!(matches!(res_a, Err(Error::PasswordMismatch)));
    assert!(matches!(res_b, Err(Error::PasswordMismatch)));
}

#[tokio::test]
async fn simultaneous_reciprocal_dials_leave_one_session() {
    let a = weft_core::Branch::create(test_config("racer-a")).await.unwrap();
    let b = weft_core::Branch::create(test_config("racer-b")).await.unwrap();

    let ep_a = a.tcp_ep();
    let ep_b = b.tcp_ep();
    // Race both dials; the tie-break may reject either or both calls, but
    // never both sessions.
    let (res_ab, res_ba) = tokio::join!(a.connect_to(ep_b), b.connect_to(ep_a));
    assert!(res_ab.is_ok() || res_ba.is_ok() || a.connected_peers().len() == 1);

    tokio::time::timeout(HARNESS_TIMEOUT, async {
        loop {
            if a.connected_peers().len() == 1 && b.connected_peers().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("exactly one admitted session per side");

    assert_eq!(a.connected_peers()[0].uuid, b.uuid());
    assert_eq!(b.connected_peers()[0].uuid, a.uuid());

    // The surviving session carries traffic.
    let armed = b.receive_broadcast();
    a.send_broadcast(vec![0x42], true).await.unwrap();
    let (from, data) = tokio::time::timeout(HARNESS_TIMEOUT, armed).await.unwrap().unwrap();
    assert_eq!((from, data), (a.uuid(), vec![0x42]));
}

#[tokio::test]
async fn heartbeats_keep_an_idle_session_alive() {
    let mut cfg_a = test_config("quiet-a");
    cfg_a.timeout = 0.5;
    let mut cfg_b = test_config("quiet-b");
    cfg_b.timeout = 0.5;

    let a = weft_core::Branch::create(cfg_a).await.unwrap();
    let b = weft_core::Branch::create(cfg_b).await.unwrap();
    a.connect_to(b.tcp_ep()).await.unwrap();

    // Four timeout periods of silence; only heartbeats flow.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(a.connected_peers().len(), 1, "session must survive on heartbeats");

    let armed = b.receive_broadcast();
    a.send_broadcast(vec![1], true).await.unwrap();
    tokio::time::timeout(HARNESS_TIMEOUT, armed).await.unwrap().unwrap();
}
