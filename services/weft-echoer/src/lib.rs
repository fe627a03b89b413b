//! Echoer service.
//!
//! Accepts leaf sessions and hosts two echo terminals per session under
//! the configured path: a master terminal that publishes every received
//! payload back to its slaves, and a service terminal that answers every
//! request with the request payload.  The ping utility is the usual
//! counterpart.

use std::net::SocketAddr;
use tracing::{debug, info, warn};
use weft_core::{
    Error, Identifier, Leaf, LeafListener, Pattern, Result, Terminal, TerminalRole,
};

/// Signature of the raw-byte-payload echo terminals.  The ping utility
/// hardcodes the same value.
pub const ECHO_SIGNATURE: u64 = 0x52a0;

/// A bound echoer awaiting sessions.
pub struct Echoer {
    listener: LeafListener,
    path: String,
}

impl Echoer {
    pub async fn bind(addr: SocketAddr, name: &str) -> Result<Echoer> {
        let cfg = weft_core::BranchConfig::from_json_str(&format!(
            r#"{{"name": "echoer-{name}", "advertising_interval": -1}}"#
        ))
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let listener = LeafListener::bind(addr, &cfg).await?;
        let path = echoer_path(name);
        info!(addr = %listener.local_addr(), path = %path, "echoer listening");
        Ok(Echoer { listener, path })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Serve sessions until the listener fails.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok(leaf) => {
                    debug!(peer = %leaf.peer_name(), "session accepted");
                    tokio::spawn(serve_session(leaf, self.path.clone()));
                }
                Err(err) => {
                    // Failed handshakes are per-connection; only
                    // socket-level failures end the accept loop.
                    match err {
                        Error::OpenSocketFailed(_) | Error::BindSocketFailed(_) => {
                            return Err(err);
                        }
                        other => debug!(error = %other, "session rejected"),
                    }
                }
            }
        }
    }
}

/// Bind the echoer and serve sessions until the listener fails.
pub async fn run(addr: SocketAddr, name: &str) -> Result<()> {
    Echoer::bind(addr, name).await?.run().await
}

/// `<name>` becomes `/Echoers/<name>`; absolute paths pass through.
pub fn echoer_path(name: &str) -> String {
    if name.starts_with('/') { name.to_owned() } else { format!("/Echoers/{name}") }
}

/// Host the echo terminals on one session until it ends.
pub async fn serve_session(leaf: Leaf, path: String) {
    let identifier = Identifier::new(ECHO_SIGNATURE, path.clone(), false);

    let master = match Terminal::create(
        &leaf,
        Pattern::MasterSlave,
        TerminalRole::Master,
        identifier.clone(),
    ) {
        Ok(t) => t,
        Err(err) => {
            warn!(error = %err, "could not create master terminal");
            return;
        }
    };
    let service = match Terminal::create(
        &leaf,
        Pattern::ServiceClient,
        TerminalRole::Service,
        identifier,
    ) {
        Ok(t) => t,
        Err(err) => {
            warn!(error = %err, "could not create service terminal");
            return;
        }
    };

    tokio::join!(echo_published(&master), echo_requests(&service));
    debug!(path = %path, "echo session ended");
}

/// Publish every payload a slave sends straight back.
async fn echo_published(master: &Terminal) {
    loop {
        let payload = match master.receive_published().await {
            Ok(payload) => payload,
            Err(_) => return,
        };
        match master.publish(payload) {
            Ok(()) | Err(Error::NotReady) => {}
            Err(err) => {
                debug!(error = %err, "echo publish failed");
                return;
            }
        }
    }
}

/// Answer every scattered request with its own payload.
async fn echo_requests(service: &Terminal) {
    loop {
        let pending = match service.receive_scattered() {
            Ok(pending) => pending,
            Err(_) => return,
        };
        let request = match pending.await {
            Ok(request) => request,
            Err(_) => return,
        };
        if let Err(err) = service.respond(request.operation_id, request.data) {
            debug!(error = %err, "echo response failed");
            return;
        }
    }
}
