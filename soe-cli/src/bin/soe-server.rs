//! SOE Server - session echo server
//!
//! Accepts SOE sessions and echoes every message back on the lane it
//! arrived on.

use clap::Parser;
use soe::{Message, Service, Session, SessionStatus};
use soe_cli::{display_service_stats, display_session_stats, Config};
use soe_io::Interval;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "soe-server")]
#[command(about = "SOE session echo server", long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:44453")]
    listen: SocketAddr,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    example_config: Option<PathBuf>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long, default_value = "5")]
    stats: u64,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

/// Echo every queued message, returning how many were echoed
fn echo(session: &Session) -> usize {
    let mut echoed = 0;
    while let Some(message) = session.get_incoming_queue_message() {
        let reply = Message::from_slice(message.data()).with_priority(message.priority());
        let result = if message.fast_path() {
            session.send_channel_a_unreliable(reply)
        } else {
            session.send_channel_a(reply)
        };
        session.destroy_incoming_message(message);

        match result {
            Ok(()) => echoed += 1,
            Err(e) => {
                tracing::debug!("Cannot echo to {}: {}", session.peer(), e);
                break;
            }
        }
    }
    echoed
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(path) = &args.example_config {
        Config::example_server().to_file(path)?;
        println!("Example configuration written to {}", path.display());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::example_server(),
    };
    let listen = match (&args.config, &config.server) {
        (Some(_), Some(server)) => server.listen,
        _ => args.listen,
    };

    tracing::info!("SOE Server starting...");
    let service = Service::bind(listen, config.server_service_config())?;
    tracing::info!("Listening on: {}", service.local_addr()?);

    let mut sessions: Vec<Arc<Session>> = Vec::new();
    let mut stats_timer = Interval::new(Duration::from_secs(args.stats.max(1)), Instant::now());
    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut total_echoed = 0u64;

    loop {
        while let Some(session) = service.try_accept() {
            tracing::info!("New session from {}", session.peer());
            sessions.push(session);
        }

        for session in &sessions {
            total_echoed += echo(session) as u64;
        }

        sessions.retain(|session| {
            let status = session.status();
            if status.is_terminal() {
                tracing::info!("Session with {} ended: {}", session.peer(), status);
                if status != SessionStatus::Disconnected {
                    display_session_stats(&session.stats());
                }
                false
            } else {
                true
            }
        });

        if args.stats > 0 && stats_timer.poll(Instant::now()) {
            display_service_stats(&service.stats());
            tracing::info!(
                "{} active sessions, {} messages echoed",
                sessions.len(),
                total_echoed
            );
        }

        if deadline.map_or(false, |d| Instant::now() >= d) {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    service.shutdown();
    display_service_stats(&service.stats());
    Ok(())
}
