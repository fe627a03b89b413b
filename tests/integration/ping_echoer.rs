//! Integration: the ping utility against a live echoer.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use weft_ping::{PingEvent, PingOptions, PingTarget, format_event, format_summary, parse_target};

async fn start_echoer(name: &str) -> std::net::SocketAddr {
    let echoer = weft_echoer::Echoer::bind("127.0.0.1:0".parse().unwrap(), name).await.unwrap();
    let addr = echoer.local_addr();
    tokio::spawn(echoer.run());
    addr
}

fn options(addr: std::net::SocketAddr, name: &str, count: u64, use_service: bool) -> PingOptions {
    PingOptions {
        target: PingTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
            path: format!("/Echoers/{name}"),
        },
        interval: Duration::from_millis(10),
        count: Some(count),
        payload_size: 4,
        use_service,
    }
}

/// A shutdown channel that never fires; the sender guard must be held
/// for the duration of the run.
fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[tokio::test]
async fn three_pings_over_master_slave() {
    let addr = start_echoer("elephant").await;

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let (_guard, shutdown) = no_shutdown();
    let stats = weft_ping::run(options(addr, "elephant", 3, false), shutdown, |event| {
        sink.lock().unwrap().push(format_event(event, false, "/Echoers/elephant"));
    })
    .await
    .unwrap();

    assert_eq!(stats.sent, 3);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(stats.round_trips.len(), 3);

    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 3);
    for line in lines.iter() {
        assert!(line.starts_with("4 bytes from Master /Echoers/elephant: time = "), "{line}");
        assert!(line.ends_with(" ms"), "{line}");
    }

    let summary = format_summary(&stats);
    assert!(summary.contains("Number of pings sent:  3"), "{summary}");
    assert!(summary.contains("Number of timeouts:    0"), "{summary}");
    assert!(summary.contains("Minimum response time:"), "{summary}");
    assert!(summary.contains("Average response time:"), "{summary}");
    assert!(summary.contains("Maximum response time:"), "{summary}");

    // min <= avg <= max.
    let (min, avg, max) =
        (stats.min().unwrap(), stats.avg().unwrap(), stats.max().unwrap());
    assert!(min <= avg && avg <= max);
}

#[tokio::test]
async fn service_mode_uses_the_client_terminal() {
    let addr = start_echoer("turtle").await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let (_guard, shutdown) = no_shutdown();
    let stats = weft_ping::run(options(addr, "turtle", 2, true), shutdown, |event| {
        sink.lock().unwrap().push(event.clone());
    })
    .await
    .unwrap();

    assert_eq!(stats.sent, 2);
    assert_eq!(stats.timeouts, 0);
    let events = events.lock().unwrap();
    assert!(events.iter().all(|e| matches!(e, PingEvent::Pong { bytes: 4, .. })));
    let line = format_event(&events[0], true, "/Echoers/turtle");
    assert!(line.contains("bytes from Service /Echoers/turtle"), "{line}");
}

#[tokio::test]
async fn connecting_to_a_dead_port_fails() {
    // Bind-then-drop guarantees an unused port.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let (_guard, shutdown) = no_shutdown();
    let res = weft_ping::run(options(addr, "nobody", 1, false), shutdown, |_| {}).await;
    assert!(matches!(res, Err(weft_ping::PingError::Connect(..))));
}

#[tokio::test]
async fn shutdown_mid_run_still_returns_partial_stats() {
    let addr = start_echoer("hare").await;

    let (tx, rx) = watch::channel(false);
    let mut opts = options(addr, "hare", 1000, false);
    opts.interval = Duration::from_millis(20);

    let pinger = tokio::spawn(weft_ping::run(opts, rx, |_| {}));
    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(10), pinger)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(stats.sent >= 1);
    assert!(stats.sent < 1000);
}

#[test]
fn target_grammar_matches_the_documented_forms() {
    let t = parse_target("127.0.0.1:10000:elephant").unwrap();
    assert_eq!(t.path, "/Echoers/elephant");
    assert_eq!((t.host.as_str(), t.port), ("127.0.0.1", 10000));

    // Empty host means loopback (":port:/path" form).
    let t = parse_target(":10000:/Echoers/elephant").unwrap();
    assert_eq!(t.host, "127.0.0.1");

    assert!(parse_target("").is_err());
}
