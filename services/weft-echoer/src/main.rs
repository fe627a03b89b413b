// weft-echoer: hosts echo terminals that ping utilities can target.

use clap::{Arg, Command};
use std::net::SocketAddr;
use tracing::info;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("weft-echoer")
        .about("Echoes payloads back over master/slave and service/client terminals")
        .arg(
            Arg::new("addr")
                .short('a')
                .long("addr")
                .default_value("0.0.0.0:10000")
                .help("address to accept sessions on"),
        )
        .arg(
            Arg::new("name")
                .short('n')
                .long("name")
                .default_value("elephant")
                .help("echoer name; terminals live at /Echoers/<name>"),
        )
        .get_matches();

    let addr: SocketAddr = match matches.get_one::<String>("addr").unwrap().parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("ERROR: invalid listen address: {e}");
            std::process::exit(1);
        }
    };
    let name = matches.get_one::<String>("name").unwrap().clone();

    info!(version = env!("CARGO_PKG_VERSION"), "echoer starting");

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    if let Err(e) = runtime.block_on(weft_echoer::run(addr, &name)) {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}
