// weft-ping: measures round-trips against an echoer's terminals.

use clap::{Arg, ArgAction, Command};
use std::time::Duration;
use weft_ping::{PingEvent, PingOptions, format_event, format_summary, parse_target};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let matches = Command::new("weft-ping")
        .about("Ping echo terminals over the messaging fabric")
        .after_help(
            "The target argument specifies the location of the echo terminals. Its syntax\n\
             is \"[host:[port:]]/path\" (1) or \"[host:[port:]]name\" (2). The defaults for\n\
             host and port are 127.0.0.1 and 10000 respectively. Either an absolute path (1)\n\
             or an echoer name (2) can be given; the latter is converted to /Echoers/name.\n\n\
             Examples:\n\
             \x20   weft-ping 192.168.1.40:24001:/Echoers/elephant\n\
             \x20   weft-ping 192.168.1.40:elephant\n\
             \x20   weft-ping -i 0.5 elephant",
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .default_value("1.0")
                .help("interval between pings in seconds"),
        )
        .arg(
            Arg::new("count")
                .short('c')
                .long("count")
                .help("number of pings (default is infinity)"),
        )
        .arg(
            Arg::new("payload")
                .short('p')
                .long("payload")
                .default_value("4")
                .help("number of payload bytes"),
        )
        .arg(
            Arg::new("service")
                .short('s')
                .long("service")
                .action(ArgAction::SetTrue)
                .help("use service/client terminals instead of master/slave"),
        )
        .arg(Arg::new("target").required(true).help("echoer location"))
        .get_matches();

    let interval: f64 = match matches.get_one::<String>("interval").unwrap().parse() {
        Ok(secs) if secs > 0.0 => secs,
        _ => {
            eprintln!("ERROR: invalid interval");
            std::process::exit(1);
        }
    };
    let count: Option<u64> = match matches.get_one::<String>("count") {
        None => None,
        Some(raw) => match raw.parse() {
            Ok(count) => Some(count),
            Err(_) => {
                eprintln!("ERROR: invalid count");
                std::process::exit(1);
            }
        },
    };
    let payload_size: usize = match matches.get_one::<String>("payload").unwrap().parse() {
        Ok(size) => size,
        Err(_) => {
            eprintln!("ERROR: invalid payload size");
            std::process::exit(1);
        }
    };
    let target = match parse_target(matches.get_one::<String>("target").unwrap()) {
        Ok(target) => target,
        Err(e) => {
            eprintln!("ERROR: {e}");
            std::process::exit(1);
        }
    };

    let use_service = matches.get_flag("service");
    let path = target.path.clone();
    let options = PingOptions {
        target,
        interval: Duration::from_secs_f64(interval),
        count,
        payload_size,
        use_service,
    };

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let result = runtime.block_on(async move {
        // SIGINT/SIGTERM stop the loop; the summary still prints.
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            let _ = shutdown_tx.send(true);
        });

        weft_ping::run(options, shutdown_rx, |event: &PingEvent| {
            println!("{}", format_event(event, use_service, &path));
        })
        .await
    });

    match result {
        Ok(stats) => {
            println!();
            print!("{}", format_summary(&stats));
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            std::process::exit(1);
        }
    }
}
