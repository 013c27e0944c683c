//! Server binary: argument parsing, logging, the live dual-stack UDP
//! socket, and the absolute-deadline tick scheduler wrapped around
//! [`glowtrail_server::Server`].

use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use glowtrail_server::{Server, ServerConfig, canonicalize_address};
use glowtrail_wire::MAX_DATAGRAM_SIZE;

/// Authoritative Glowtrail game server.
#[derive(Parser, Debug)]
#[command(name = "glowtrail-server")]
struct Args {
    /// Board width in pixels.
    #[arg(short = 'W', default_value_t = glowtrail_server::DEFAULT_WIDTH)]
    width: u32,

    /// Board height in pixels.
    #[arg(short = 'H', default_value_t = glowtrail_server::DEFAULT_HEIGHT)]
    height: u32,

    /// UDP listen port.
    #[arg(short = 'p', default_value_t = glowtrail_server::DEFAULT_PORT)]
    port: u16,

    /// Ticks per second.
    #[arg(short = 's', default_value_t = glowtrail_server::DEFAULT_TICKS_PER_SEC)]
    ticks_per_sec: u32,

    /// Degrees turned per tick.
    #[arg(short = 't', default_value_t = glowtrail_server::DEFAULT_TURNING_SPEED_DEG)]
    turning_speed_deg: f64,

    /// PRNG seed. Defaults to the current wall-clock second.
    #[arg(short = 'r')]
    seed: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new("info"),
        ))
        .init();

    let args = Args::parse();
    let seed = args.seed.unwrap_or_else(default_seed);

    let config = ServerConfig {
        width: args.width,
        height: args.height,
        port: args.port,
        ticks_per_sec: args.ticks_per_sec,
        turning_speed_deg: args.turning_speed_deg,
        seed,
    };
    tracing::info!(?config, "starting server");

    let socket = bind_dual_stack(config.port)?;

    let terminate = Arc::new(AtomicBool::new(false));
    let handler_flag = terminate.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))?;

    run(socket, config, terminate)
}

/// Binds one dual-stack IPv6 socket (accepting IPv4-mapped peers), falling
/// back to IPv4-only if the platform has no IPv6 stack.
fn bind_dual_stack(port: u16) -> anyhow::Result<UdpSocket> {
    let v6_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    match UdpSocket::bind(v6_addr) {
        Ok(socket) => Ok(socket),
        Err(err) => {
            tracing::warn!(%err, "dual-stack bind failed, falling back to IPv4");
            let v4_addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port);
            Ok(UdpSocket::bind(v4_addr)?)
        }
    }
}

fn default_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn now_us(epoch: Instant) -> u64 {
    epoch.elapsed().as_micros() as u64
}

/// The single-threaded cooperative loop: wait on the socket with a
/// timeout derived from the next tick deadline; on wakeup, either read
/// one datagram or run a tick; after either, flush pending sends.
fn run(socket: UdpSocket, config: ServerConfig, terminate: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut server = Server::new(config);
    let epoch = Instant::now();
    let tick_period_us = config.tick_period_us();
    let mut next_tick_us = now_us(epoch) + tick_period_us;
    let mut recv_buf = [0u8; MAX_DATAGRAM_SIZE];

    while !terminate.load(Ordering::SeqCst) {
        let now = now_us(epoch);
        if now >= next_tick_us {
            server.tick(now);
            flush_sends(&socket, &mut server);
            next_tick_us += tick_period_us;
            continue;
        }

        let wait = Duration::from_micros(next_tick_us - now);
        socket.set_read_timeout(Some(wait))?;
        match socket.recv_from(&mut recv_buf) {
            Ok((len, from)) => {
                let address = canonicalize_address(from.ip());
                server.handle_datagram(address, from.port(), &recv_buf[..len], now_us(epoch));
                flush_sends(&socket, &mut server);
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Deadline reached with nothing to read; loop back around
                // to the tick check above.
            }
            Err(err) => {
                tracing::warn!(%err, "recv_from failed");
            }
        }
    }

    tracing::info!("shutting down");
    Ok(())
}

fn flush_sends(socket: &UdpSocket, server: &mut Server) {
    for pending in server.pending_sends() {
        let dest = SocketAddr::new(pending.address, pending.port);
        match socket.send_to(&pending.bytes, dest) {
            Ok(_) => server.confirm_sent(&pending),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::debug!(%err, %dest, "transient send failure, will retry next tick");
            }
            Err(err) => {
                tracing::warn!(%err, %dest, "send_to failed");
            }
        }
    }
}
