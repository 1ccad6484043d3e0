use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;

use ferrite::{Channel, NetConfig, NetEvent, NetworkMgr};

#[derive(Parser)]
#[command(name = "ferrite-demo")]
#[command(about = "Reliable echo over the ferrite UDP transport")]
struct Args {
    /// Run as the echo server instead of connecting to one
    #[arg(short, long)]
    listen: bool,

    /// Port to listen on, or the server port to connect to
    #[arg(short, long, default_value_t = 28800)]
    port: u16,

    /// Protocol id; both sides must agree
    #[arg(long, default_value_t = 0x4652_5254)]
    protocol: u32,

    /// Server hostname or address (client mode)
    server: Option<String>,

    /// Messages to send in client mode
    #[arg(short, long, default_value_t = 5)]
    count: u32,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.listen {
        run_server(&args)
    } else {
        run_client(&args)
    }
}

fn run_server(args: &Args) -> Result<()> {
    let mut mgr = NetworkMgr::new(NetConfig {
        local_port: args.port,
        protocol_id: args.protocol,
        max_connections: 32,
        ..NetConfig::default()
    });
    mgr.initialize().context("failed to bind server socket")?;
    info!("echo server listening on port {}", args.port);

    loop {
        mgr.network_task();
        while let Some(event) = mgr.poll_event() {
            info!("event: {event:?}");
        }
        while let Ok(message) = mgr.receive_packet() {
            if message.channel == Channel::Reliable {
                mgr.send_reliable_packet(message.from, &message.data)?;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn run_client(args: &Args) -> Result<()> {
    let Some(host) = &args.server else {
        bail!("client mode needs a server address; or pass --listen");
    };

    let mut mgr = NetworkMgr::new(NetConfig {
        protocol_id: args.protocol,
        max_connections: 1,
        ..NetConfig::default()
    });
    mgr.initialize().context("failed to bind client socket")?;

    let mut server = mgr
        .resolve_address(host)
        .wait()
        .with_context(|| format!("could not resolve {host}"))?;
    server.port = args.port;
    info!("connecting to {server}");
    mgr.connect(server)?;

    match wait_for_event(&mgr, 5000) {
        Some(NetEvent::ConnectionAccepted { .. }) => info!("connected"),
        Some(event) => bail!("connection failed: {event:?}"),
        None => bail!("connection timed out"),
    }

    for i in 0..args.count {
        let payload = format!("ping {i}");
        let sent_at = Instant::now();
        mgr.send_reliable_packet(server, payload.as_bytes())?;

        let echo = wait_for_message(&mgr, 5000).context("no echo from server")?;
        println!(
            "{} -> {} ({} ms, transport rtt {} ms)",
            payload,
            String::from_utf8_lossy(&echo.data),
            sent_at.elapsed().as_millis(),
            mgr.ping(server)?,
        );
    }

    mgr.disconnect(server)?;
    // Let the disconnect notice reach the server before the socket goes away.
    thread::sleep(Duration::from_millis(100));
    mgr.network_task();
    Ok(())
}

fn wait_for_event(mgr: &NetworkMgr, timeout_ms: u64) -> Option<NetEvent> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        mgr.network_task();
        if let Some(event) = mgr.poll_event() {
            return Some(event);
        }
        thread::sleep(Duration::from_millis(5));
    }
    None
}

fn wait_for_message(mgr: &NetworkMgr, timeout_ms: u64) -> Option<ferrite::IncomingMessage> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        mgr.network_task();
        if let Ok(message) = mgr.receive_packet() {
            return Some(message);
        }
        thread::sleep(Duration::from_millis(5));
    }
    None
}
