//! Client binary: argument parsing, logging, the live UDP socket to the
//! game server, the live TCP socket to the UI relay, and the loop that
//! ties [`glowtrail_client::Pipeline`] and [`glowtrail_client::DirectionState`]
//! to both.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use clap::Parser;
use glowtrail_client::{DirectionState, Pipeline, UI_INPUT_BUFFER_LEN};
use glowtrail_wire::{ClientDatagram, MAX_DATAGRAM_SIZE, PLAYER_NAME_MAX_LEN};

/// Target delay between client -> server datagrams.
const DELAY_MS: u64 = 20;

/// Client between a Glowtrail game server and a UI relay.
#[derive(Parser, Debug)]
#[command(name = "glowtrail-client")]
struct Args {
    /// Player name, 0-64 bytes of printable ASCII. Empty joins as an
    /// observer.
    player_name: String,

    /// Game server address, `host[:port]`. Default port 12345.
    server_address: String,

    /// UI relay address, `host[:port]`.
    #[arg(short = 'i', long = "ui-address", default_value = "localhost:12346")]
    ui_address: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new("info"),
        ))
        .init();

    let args = Args::parse();
    let name = args.player_name.into_bytes();
    if name.len() > PLAYER_NAME_MAX_LEN {
        bail!("player name exceeds {PLAYER_NAME_MAX_LEN} bytes");
    }
    if name.iter().any(|&b| !(33..=126).contains(&b)) {
        bail!("player name bytes must be in the printable ASCII range 33..=126");
    }

    let server_address = normalize_host_port(&args.server_address, 12345);
    let ui_address = args.ui_address.clone();

    let terminate = Arc::new(AtomicBool::new(false));
    let handler_flag = terminate.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))?;

    tracing::info!(%server_address, %ui_address, "connecting");

    let socket = UdpSocket::bind("0.0.0.0:0").context("binding client UDP socket")?;
    socket
        .connect(&server_address)
        .context("resolving game server address")?;
    socket.set_read_timeout(Some(Duration::from_millis(5)))?;

    let ui_stream = TcpStream::connect(&ui_address).context("connecting to UI relay")?;
    ui_stream.set_nodelay(true)?;
    ui_stream.set_read_timeout(Some(Duration::from_millis(5)))?;

    run(socket, ui_stream, name, terminate)
}

fn normalize_host_port(input: &str, default_port: u16) -> String {
    if input.contains(':') {
        input.to_string()
    } else {
        format!("{input}:{default_port}")
    }
}

fn session_id_from_wall_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn run(
    socket: UdpSocket,
    mut ui_stream: TcpStream,
    name: Vec<u8>,
    terminate: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let session_id = session_id_from_wall_clock();
    let mut pipeline = Pipeline::new();
    let mut direction = DirectionState::new();

    let mut recv_buf = [0u8; MAX_DATAGRAM_SIZE];
    let mut ui_read_buf = [0u8; UI_INPUT_BUFFER_LEN];
    let mut ui_pending: Vec<u8> = Vec::new();

    let mut next_send = Instant::now();

    while !terminate.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next_send {
            let datagram = ClientDatagram::new(
                session_id,
                direction.turn_direction(),
                pipeline.next_expected_event(),
                name.clone(),
            )
            .expect("datagram fields already validated at startup");
            if let Err(err) = socket.send(&datagram.encode()) {
                tracing::debug!(%err, "transient send failure to game server");
            }
            next_send = now + Duration::from_millis(DELAY_MS);
        }

        match socket.recv(&mut recv_buf) {
            Ok(len) => match pipeline.process_datagram(&recv_buf[..len]) {
                Ok(lines) => {
                    for line in lines {
                        writeln!(ui_stream, "{}", line.to_line()).context("writing to UI relay")?;
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "fatal protocol violation, aborting");
                    return Ok(());
                }
            },
            Err(err) if is_timeout(&err) => {}
            Err(err) => tracing::warn!(%err, "recv from game server failed"),
        }

        match ui_stream.read(&mut ui_read_buf) {
            Ok(0) => {
                tracing::info!("UI relay closed the connection");
                return Ok(());
            }
            Ok(n) => {
                ui_pending.extend_from_slice(&ui_read_buf[..n]);
                consume_ui_tokens(&mut ui_pending, &mut direction);
            }
            Err(err) if is_timeout(&err) => {}
            Err(err) => tracing::warn!(%err, "read from UI relay failed"),
        }
    }

    tracing::info!("shutting down");
    Ok(())
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Splits accumulated UI bytes on LF, applying each complete token to
/// `direction` and discarding lines longer than the input buffer.
fn consume_ui_tokens(pending: &mut Vec<u8>, direction: &mut DirectionState) {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        let token = &line[..line.len() - 1];
        if token.len() <= UI_INPUT_BUFFER_LEN {
            direction.apply_token(token);
        }
    }
    if pending.len() > UI_INPUT_BUFFER_LEN {
        pending.clear();
    }
}
