// weft-test-utils: Shared test harness for the fabric suite.
//
// Provides ready-made branch and leaf pairs over real localhost sockets,
// handshaken session pairs over in-process transports, and small await
// helpers used by the unit and integration suites.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use weft_core::branch::connect::{Established, establish, hash_password};
use weft_core::branch::info::LocalBranchInfo;
use weft_core::transport::ByteTransport;
use weft_core::{
    Branch, BranchConfig, BindingState, Leaf, LeafListener, SubscriptionState, Terminal,
};

/// How long harness waits may block before a test is declared hung.
pub const HARNESS_TIMEOUT: Duration = Duration::from_secs(10);

/// A config suitable for tests: loopback listener, no advertising.
pub fn test_config(name: &str) -> BranchConfig {
    BranchConfig::from_json_str(&format!(
        r#"{{
            "name": "{name}",
            "listen_address": "127.0.0.1",
            "advertising_interval": -1
        }}"#
    ))
    .expect("test config is valid")
}

/// Two branches on loopback, already connected to each other.
pub async fn branch_pair(name_a: &str, name_b: &str) -> (Branch, Branch) {
    let a = Branch::create(test_config(name_a)).await.expect("branch a");
    let b = Branch::create(test_config(name_b)).await.expect("branch b");
    a.connect_to(b.tcp_ep()).await.expect("connect a->b");
    (a, b)
}

/// (accepting leaf, dialling leaf) over a real localhost socket.
pub async fn leaf_pair(server_name: &str, client_name: &str) -> (Leaf, Leaf) {
    let listener = LeafListener::bind("127.0.0.1:0".parse().unwrap(), &test_config(server_name))
        .await
        .expect("leaf listener");
    let addr = listener.local_addr();
    let accepted = tokio::spawn(async move { listener.accept().await.expect("accept leaf") });
    let dialled = Leaf::connect(addr, &test_config(client_name)).await.expect("connect leaf");
    (accepted.await.expect("accept task"), dialled)
}

/// A handshaken session pair over an in-process transport, for tests that
/// want raw [`Established`] halves (custom queue sizes, session-level
/// scenarios).
pub async fn established_pair(
    cfg_a: &BranchConfig,
    cfg_b: &BranchConfig,
) -> (Established, Arc<LocalBranchInfo>, Established, Arc<LocalBranchInfo>) {
    let info_a = Arc::new(
        LocalBranchInfo::new(cfg_a, "127.0.0.1:0".parse().unwrap()).expect("local info a"),
    );
    let info_b = Arc::new(
        LocalBranchInfo::new(cfg_b, "127.0.0.1:0".parse().unwrap()).expect("local info b"),
    );
    let hash_a = hash_password(&cfg_a.network_password);
    let hash_b = hash_password(&cfg_b.network_password);
    let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();

    let (ta, tb) = ByteTransport::pair();
    let (ra, rb) = tokio::join!(
        establish(ta, &info_a, &hash_a, ip),
        establish(tb, &info_b, &hash_b, ip),
    );
    (ra.expect("handshake a"), info_a, rb.expect("handshake b"), info_b)
}

/// Block until the terminal reports `Subscribed`.
pub async fn wait_subscribed(terminal: &mut Terminal) {
    tokio::time::timeout(HARNESS_TIMEOUT, async {
        while terminal.subscription_state() != SubscriptionState::Subscribed {
            terminal
                .await_subscription_state_change()
                .await
                .expect("subscription watch ended");
        }
    })
    .await
    .expect("terminal did not become subscribed");
}

/// Block until the terminal's implicit binding reports `Established`.
pub async fn wait_bound(terminal: &mut Terminal) {
    tokio::time::timeout(HARNESS_TIMEOUT, async {
        while terminal.binding_state().expect("terminal has no implicit binding")
            != BindingState::Established
        {
            terminal.await_binding_state_change().await.expect("binding watch ended");
        }
    })
    .await
    .expect("implicit binding did not establish");
}

/// Loopback socket address with an OS-assigned port.
pub fn any_local_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn branch_pair_connects_both_ways() {
        let (a, b) = branch_pair("left", "right").await;
        assert_eq!(a.connected_peers().len(), 1);
        // The accepting side admits asynchronously.
        tokio::time::timeout(HARNESS_TIMEOUT, async {
            while b.connected_peers().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(b.connected_peers()[0].name, "left");
    }

    #[tokio::test]
    async fn leaf_pair_carries_names() {
        let (server, client) = leaf_pair("srv", "cli").await;
        assert_eq!(server.peer_name(), "cli");
        assert_eq!(client.peer_name(), "srv");
    }

    #[tokio::test]
    async fn established_pair_swaps_infos() {
        let (est_a, _info_a, est_b, _info_b) =
            established_pair(&test_config("one"), &test_config("two")).await;
        assert_eq!(est_a.remote.info.name, "two");
        assert_eq!(est_b.remote.info.name, "one");
    }
}
