//! schmeep-server: serve a Scheme REPL over TCP or a Unix socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use schmeep::{
    ConnectionSupervisor, IncompletePolicy, LoggingObserver, SupervisorConfig, TcpTransport,
    Transport,
};

mod command;

use command::CommandEvaluator;

const DEFAULT_PORT: u16 = 4040;

#[derive(Debug, PartialEq)]
enum Listen {
    Tcp(Vec<SocketAddr>),
    #[cfg(unix)]
    Unix(PathBuf),
}

#[derive(Debug, PartialEq)]
struct Options {
    listen: Listen,
    policy: Option<IncompletePolicy>,
    program: String,
    args: Vec<String>,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SCHMEEP_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "schmeep={level},schmeep_bridge={level},schmeep_server={level}"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn usage() {
    eprintln!(
        "Usage: schmeep-server [--listen ADDR]... [--unix PATH] [--policy wait|reject] -- <command> [args...]"
    );
    eprintln!();
    eprintln!("Each expression is piped to <command> on stdin; its stdout is the result.");
    eprintln!();
    eprintln!("Options:");
    eprintln!(
        "  --listen <addr>    TCP address to bind, tried in order [default: 127.0.0.1:{DEFAULT_PORT}, [::1]:{DEFAULT_PORT}]"
    );
    eprintln!("  --unix <path>      Listen on a Unix socket instead of TCP");
    eprintln!("  --policy <policy>  EVALUATE on an incomplete expression: wait or reject [default: wait]");
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut addrs: Vec<SocketAddr> = Vec::new();
    let mut unix: Option<PathBuf> = None;
    let mut policy = None;
    let mut command: Vec<String> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--listen" => {
                i += 1;
                let raw = args.get(i).ok_or("--listen requires a value")?;
                let addr = raw
                    .parse()
                    .map_err(|e| format!("invalid listen address '{raw}': {e}"))?;
                addrs.push(addr);
            }
            "--unix" => {
                i += 1;
                unix = Some(PathBuf::from(args.get(i).ok_or("--unix requires a value")?));
            }
            "--policy" => {
                i += 1;
                let raw = args.get(i).ok_or("--policy requires a value")?;
                policy = Some(raw.parse::<IncompletePolicy>()?);
            }
            "--help" | "-h" => return Err(String::new()),
            "--" => {
                command.extend(args[i + 1..].iter().cloned());
                break;
            }
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            _ => {
                command.extend(args[i..].iter().cloned());
                break;
            }
        }
        i += 1;
    }

    let mut command = command.into_iter();
    let program = command.next().ok_or("missing required argument: <command>")?;

    let listen = match unix {
        #[cfg(unix)]
        Some(path) => {
            if !addrs.is_empty() {
                return Err("--unix and --listen are mutually exclusive".to_string());
            }
            Listen::Unix(path)
        }
        #[cfg(not(unix))]
        Some(_) => return Err("--unix is only supported on unix".to_string()),
        None if addrs.is_empty() => Listen::Tcp(vec![
            SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            SocketAddr::from((std::net::Ipv6Addr::LOCALHOST, DEFAULT_PORT)),
        ]),
        None => Listen::Tcp(addrs),
    };

    Ok(Options {
        listen,
        policy,
        program,
        args: command.collect(),
    })
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    init_tracing();

    let mut config = SupervisorConfig::from_env();
    if let Some(policy) = options.policy {
        config = config.with_incomplete_policy(policy);
    }
    tracing::debug!(?config, "Loaded configuration");

    let evaluator = Arc::new(CommandEvaluator::new(options.program, options.args));
    let supervisor = ConnectionSupervisor::new(evaluator, Arc::new(LoggingObserver), config);

    let transport: Box<dyn Transport> = match options.listen {
        Listen::Tcp(addrs) => Box::new(TcpTransport::new(addrs)),
        #[cfg(unix)]
        Listen::Unix(path) => Box::new(schmeep::UnixTransport::new(path)),
    };

    supervisor
        .start(transport.as_ref())
        .await
        .context("failed to start REPL server")?;

    let signal = shutdown_signal().await;
    tracing::info!("Shutdown requested");
    supervisor.stop().await;
    signal.context("failed to listen for shutdown signal")?;

    Ok(())
}
