//! SOE Client - session test client
//!
//! Connects to an SOE server, sends numbered messages and checks the echoes.

use clap::Parser;
use soe::{Message, Service, SessionStatus};
use soe_cli::{display_compact_stats, display_session_stats, Config};
use soe_io::Interval;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "soe-client")]
#[command(about = "SOE session test client", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:44453")]
    server: SocketAddr,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    example_config: Option<PathBuf>,

    /// Number of messages to send
    #[arg(short = 'n', long, default_value = "100")]
    count: usize,

    /// Message size in bytes
    #[arg(long, default_value = "64")]
    size: usize,

    /// Use the unreliable lane
    #[arg(short, long)]
    unreliable: bool,

    /// Seconds to wait for all echoes
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Statistics interval in seconds (0 disables)
    #[arg(long, default_value = "1")]
    stats: u64,

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

/// Message `index` of `size` bytes; the leading marker byte keeps it eligible
/// for the unreliable lane
fn build_message(index: u32, size: usize) -> Message {
    let mut message = Message::new();
    message.write_u8(0x01).write_u32(index);
    let fill = size.saturating_sub(message.len());
    message.write_bytes(&vec![(index % 251) as u8; fill]);
    message
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(path) = &args.example_config {
        Config::example_client().to_file(path)?;
        println!("Example configuration written to {}", path.display());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let (server, bind, count, size, unreliable) = match (&args.config, &config.client) {
        (Some(_), Some(client)) => (
            client.server,
            client.bind,
            client.message_count,
            client.message_size,
            client.unreliable,
        ),
        _ => (
            args.server,
            SocketAddr::from(([0, 0, 0, 0], 0)),
            args.count,
            args.size,
            args.unreliable,
        ),
    };
    if size < 5 {
        anyhow::bail!("Message size must be at least 5 bytes");
    }

    let service = Service::bind(bind, config.client_service_config())?;
    tracing::info!("Bound to {}", service.local_addr()?);

    let session = service.connect(server)?;
    let started = Instant::now();
    loop {
        match session.status() {
            SessionStatus::Connected => break,
            status if status.is_terminal() => {
                anyhow::bail!("Failed to connect to {}: {}", server, status)
            }
            _ => thread::sleep(Duration::from_millis(5)),
        }
    }
    tracing::info!(
        "Connected to {} in {:?} (session {:#010x})",
        server,
        started.elapsed(),
        session.connection_id()
    );

    for index in 0..count {
        let message = build_message(index as u32, size);
        if unreliable {
            session.send_channel_a_unreliable(message)?;
        } else {
            session.send_channel_a(message)?;
        }
    }
    tracing::info!("Queued {} messages of {} bytes", count, size);

    let mut stats_timer = Interval::new(Duration::from_secs(args.stats.max(1)), Instant::now());
    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let mut next_expected = 0u32;
    let mut received = 0usize;
    let mut out_of_order = 0usize;

    while received < count && Instant::now() < deadline {
        while let Some(mut echo) = session.get_incoming_queue_message() {
            let index = echo.read_u8().and_then(|_| echo.read_u32());
            match index {
                Ok(index) if index == next_expected => next_expected += 1,
                Ok(index) => {
                    out_of_order += 1;
                    next_expected = index + 1;
                }
                Err(e) => tracing::warn!("Malformed echo: {}", e),
            }
            received += 1;
            session.destroy_incoming_message(echo);
        }

        if session.status().is_terminal() {
            break;
        }
        if args.stats > 0 && stats_timer.poll(Instant::now()) {
            display_compact_stats(&session.stats(), started.elapsed());
        }
        thread::sleep(Duration::from_millis(2));
    }
    println!();

    let stats = session.stats();
    display_session_stats(&stats);
    session.disconnect();
    service.shutdown();

    tracing::info!(
        "Received {}/{} echoes ({} out of order) in {:?}",
        received,
        count,
        out_of_order,
        started.elapsed()
    );
    if !unreliable && (received != count || out_of_order > 0) {
        anyhow::bail!("Reliable echo incomplete");
    }
    Ok(())
}
