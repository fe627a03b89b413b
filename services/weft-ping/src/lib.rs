//! Ping over the messaging fabric.
//!
//! Connects to a peer hosting echo terminals, binds a slave (master/slave
//! mode, the default) or a client (service/client mode with `-s`), and
//! measures round-trips of random payloads.
//!
//! # Target syntax
//! `[host:[port:]](/absolute/path|name)` — a bare name is rewritten to
//! `/Echoers/name`.  Host defaults to `127.0.0.1`, port to `10000`; an
//! empty host (`:24001:/path`) also means `127.0.0.1`.

use rand::RngCore;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use weft_core::{
    BindingState, Error, GatherFlags, Identifier, Leaf, Pattern, SubscriptionState, Terminal,
    TerminalRole,
};

/// Signature of the raw-byte-payload echo terminals; matches the value the
/// echoer service exports under.
pub const ECHO_SIGNATURE: u64 = 0x52a0;

/// How long to wait for each pong.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(3);

/// How long to wait for the terminal to bind after connecting.
const READY_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 10000;

// ---------------------------------------------------------------------------
// Target parsing
// ---------------------------------------------------------------------------

/// A fully resolved ping target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingTarget {
    pub host: String,
    pub port: u16,
    /// Absolute path of the echo terminals.
    pub path: String,
}

/// Parse `[host:[port:]](/path|name)`.
///
/// The port segment must be numeric; anything else folds into the host.
/// An empty host or port segment falls back to its default.
pub fn parse_target(target: &str) -> Result<PingTarget, TargetError> {
    if target.is_empty() {
        return Err(TargetError::Empty);
    }

    let (prefix, location) = match target.rfind(':') {
        Some(pos) => (&target[..pos], &target[pos + 1..]),
        None => ("", target),
    };
    if location.is_empty() {
        return Err(TargetError::MissingLocation(target.to_owned()));
    }

    let (host_part, port_part) = match prefix.rfind(':') {
        // "host:port:location" — or the whole prefix is the host when the
        // middle segment is not numeric.
        Some(pos) => {
            let (left, right) = (&prefix[..pos], &prefix[pos + 1..]);
            if right.chars().all(|c| c.is_ascii_digit()) {
                (left, right)
            } else {
                (prefix, "")
            }
        }
        // One segment: digits mean a port, anything else a host.
        None => {
            if prefix.chars().all(|c| c.is_ascii_digit()) {
                ("", prefix)
            } else {
                (prefix, "")
            }
        }
    };

    let host = if host_part.is_empty() { DEFAULT_HOST.to_owned() } else { host_part.to_owned() };
    let port = if port_part.is_empty() {
        DEFAULT_PORT
    } else {
        port_part.parse().map_err(|_| TargetError::InvalidPort(port_part.to_owned()))?
    };
    let path = if location.starts_with('/') {
        location.to_owned()
    } else {
        format!("/Echoers/{location}")
    };
    Ok(PingTarget { host, port, path })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    Empty,
    MissingLocation(String),
    InvalidPort(String),
}

impl std::fmt::Display for TargetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetError::Empty => write!(f, "empty target"),
            TargetError::MissingLocation(t) => write!(f, "no echoer location in '{t}'"),
            TargetError::InvalidPort(p) => write!(f, "invalid port '{p}'"),
        }
    }
}

impl std::error::Error for TargetError {}

// ---------------------------------------------------------------------------
// Options, events, statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PingOptions {
    pub target: PingTarget,
    /// Delay between a pong and the next ping.
    pub interval: Duration,
    /// `None` pings until interrupted.
    pub count: Option<u64>,
    pub payload_size: usize,
    /// Use the service/client terminals instead of master/slave.
    pub use_service: bool,
}

/// Progress reported while pinging.
#[derive(Debug, Clone)]
pub enum PingEvent {
    Pong { bytes: usize, round_trip: Duration },
    Timeout { bytes: usize },
}

#[derive(Debug, Default, Clone)]
pub struct PingStats {
    pub sent: u64,
    pub timeouts: u64,
    pub round_trips: Vec<Duration>,
}

impl PingStats {
    pub fn min(&self) -> Option<Duration> {
        self.round_trips.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.round_trips.iter().max().copied()
    }

    pub fn avg(&self) -> Option<Duration> {
        if self.round_trips.is_empty() {
            return None;
        }
        Some(self.round_trips.iter().sum::<Duration>() / self.round_trips.len() as u32)
    }
}

#[derive(Debug)]
pub enum PingError {
    /// Could not connect to the target host; exit code 1.
    Connect(String, Error),
    /// Connected, but the terminal never became ready; exit code 1.
    Bind(String, Error),
}

impl std::fmt::Display for PingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PingError::Connect(target, e) => write!(f, "could not connect to {target}: {e}"),
            PingError::Bind(path, e) => write!(f, "could not bind to target {path}: {e}"),
        }
    }
}

impl std::error::Error for PingError {}

// ---------------------------------------------------------------------------
// The pinger
// ---------------------------------------------------------------------------

/// Run the ping loop until `count` is reached or `shutdown` flips.
///
/// Events are reported through `on_event`; the returned statistics feed
/// the summary.
pub async fn run(
    options: PingOptions,
    mut shutdown: watch::Receiver<bool>,
    mut on_event: impl FnMut(&PingEvent),
) -> Result<PingStats, PingError> {
    let endpoint = format!("{}:{}", options.target.host, options.target.port);
    let addr = resolve(&endpoint).await?;
    let cfg = weft_core::BranchConfig::from_json_str(r#"{"name": "weft-ping"}"#)
        .expect("static config is valid");
    let leaf = Leaf::connect(addr, &cfg)
        .await
        .map_err(|e| PingError::Connect(endpoint.clone(), e))?;

    let identifier = Identifier::new(ECHO_SIGNATURE, options.target.path.clone(), false);
    let (pattern, role) = if options.use_service {
        (Pattern::ServiceClient, TerminalRole::Client)
    } else {
        (Pattern::MasterSlave, TerminalRole::Slave)
    };
    let mut terminal = Terminal::create(&leaf, pattern, role, identifier)
        .map_err(|e| PingError::Bind(options.target.path.clone(), e))?;
    wait_ready(&mut terminal, options.use_service)
        .await
        .map_err(|e| PingError::Bind(options.target.path.clone(), e))?;

    let mut stats = PingStats::default();
    while options.count.is_none_or(|count| stats.sent < count) {
        if *shutdown.borrow() {
            break;
        }

        // The rng handle is thread-local and must not be held across an
        // await, so it is taken per ping.
        let mut payload = vec![0u8; options.payload_size];
        rand::thread_rng().fill_bytes(&mut payload);
        stats.sent += 1;

        let outcome = if options.use_service {
            ping_service(&terminal, &payload).await
        } else {
            ping_master_slave(&terminal, &payload).await
        };
        match outcome {
            Some(round_trip) => {
                stats.round_trips.push(round_trip);
                on_event(&PingEvent::Pong { bytes: payload.len(), round_trip });
            }
            None => {
                stats.timeouts += 1;
                on_event(&PingEvent::Timeout { bytes: payload.len() });
                // The next ping goes out immediately after a timeout.
                continue;
            }
        }

        if options.count.is_some_and(|count| stats.sent >= count) {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(options.interval) => {}
            _ = shutdown.changed() => {}
        }
    }
    Ok(stats)
}

async fn resolve(endpoint: &str) -> Result<SocketAddr, PingError> {
    tokio::net::lookup_host(endpoint)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| {
            PingError::Connect(
                endpoint.to_owned(),
                Error::OpenSocketFailed("host did not resolve".to_owned()),
            )
        })
}

/// Readiness: the peer must have subscribed to us, and in master/slave
/// mode our implicit binding must also be established.
async fn wait_ready(terminal: &mut Terminal, service_mode: bool) -> Result<(), Error> {
    tokio::time::timeout(READY_TIMEOUT, async {
        while terminal.subscription_state() != SubscriptionState::Subscribed {
            terminal.await_subscription_state_change().await?;
        }
        if !service_mode {
            while terminal.binding_state()? != BindingState::Established {
                terminal.await_binding_state_change().await?;
            }
        }
        Ok(())
    })
    .await
    .map_err(|_| Error::Timeout)?
}

/// Publish the payload and wait for the echo; `None` on timeout.
async fn ping_master_slave(terminal: &Terminal, payload: &[u8]) -> Option<Duration> {
    let sent_at = Instant::now();
    terminal.publish(payload.to_vec()).ok()?;
    let deadline = sent_at + PONG_TIMEOUT;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match tokio::time::timeout(remaining, terminal.receive_published()).await {
            Err(_) => return None,
            Ok(Err(_)) => return None,
            Ok(Ok(pong)) if pong == payload => return Some(sent_at.elapsed()),
            // Interference from another process pinging the same terminal.
            Ok(Ok(_)) => debug!("mismatched pong ignored"),
        }
    }
}

/// Request the payload back over the client terminal; `None` on timeout.
async fn ping_service(terminal: &Terminal, payload: &[u8]) -> Option<Duration> {
    let sent_at = Instant::now();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
    let operation = terminal
        .async_scatter_gather(payload.to_vec(), move |reply| {
            if let Ok(reply) = reply {
                let data_flags = reply.flags.bits() & !GatherFlags::FINISHED.bits();
                if data_flags == 0 {
                    let _ = pong_tx.send(reply.data);
                }
            }
            false
        })
        .ok()?;

    match tokio::time::timeout(PONG_TIMEOUT, pong_rx.recv()).await {
        Ok(Some(pong)) if pong == payload => Some(sent_at.elapsed()),
        Ok(_) => None,
        Err(_) => {
            let _ = terminal.cancel_scatter_gather(operation);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Output formatting
// ---------------------------------------------------------------------------

pub fn mode_label(use_service: bool) -> &'static str {
    if use_service { "Service" } else { "Master" }
}

pub fn format_event(event: &PingEvent, use_service: bool, path: &str) -> String {
    match event {
        PingEvent::Pong { bytes, round_trip } => format!(
            "{bytes} bytes from {} {path}: time = {:.3} ms",
            mode_label(use_service),
            round_trip.as_secs_f64() * 1000.0
        ),
        PingEvent::Timeout { bytes } => format!(
            "{bytes} bytes from {} {path}: timeout (> {} s)",
            mode_label(use_service),
            PONG_TIMEOUT.as_secs()
        ),
    }
}

pub fn format_summary(stats: &PingStats) -> String {
    let to_ms = |d: Duration| d.as_secs_f64() * 1000.0;
    let mut out = String::new();
    out.push_str(&format!("Number of pings sent:  {}\n", stats.sent));
    out.push_str(&format!("Number of timeouts:    {}\n", stats.timeouts));
    if let (Some(min), Some(avg), Some(max)) = (stats.min(), stats.avg(), stats.max()) {
        out.push_str(&format!("Minimum response time: {:.3} ms\n", to_ms(min)));
        out.push_str(&format!("Average response time: {:.3} ms\n", to_ms(avg)));
        out.push_str(&format!("Maximum response time: {:.3} ms\n", to_ms(max)));
    }
    out
}
