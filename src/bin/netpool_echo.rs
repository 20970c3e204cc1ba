//! netpool echo server
//!
//! Demo server dengan handler pool:
//! - Setiap pesan dibalas dengan reply tetap (atau di-echo dengan `--echo`)
//! - Koneksi di atas kapasitas pool langsung ditutup
//! - Server berhenti setelah `--duration` detik (0 = jalan terus)
//!
//! Usage:
//!   cargo run --release --bin netpool_echo -- --port 7232 --clients 3

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netpool::config::ServerConfig;
use netpool::network::{
    BlockingTcpSocket, CallbackHandler, NetError, PolledTcpSocket, TcpServer, Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Blocking sockets dengan receive timeout
    Blocking,
    /// Poll-backed (mio), kontrak tetap blocking dengan timeout
    Polled,
}

/// netpool echo server
#[derive(Debug, Parser)]
#[command(name = "netpool_echo", version, about)]
struct Args {
    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Port (angka atau nama service)
    #[arg(short, long, default_value = "7232")]
    port: String,

    /// Handler pool capacity
    #[arg(short, long, default_value_t = 16)]
    capacity: usize,

    /// Receive buffer size per koneksi
    #[arg(long, default_value_t = 256)]
    buffer: usize,

    /// Reply untuk setiap pesan
    #[arg(long, default_value = "hello!\r\n")]
    reply: String,

    /// Echo payload alih-alih reply tetap
    #[arg(long)]
    echo: bool,

    #[arg(long, value_enum, default_value_t = TransportKind::Blocking)]
    transport: TransportKind,

    /// Stop server setelah N detik (0 = tidak pernah)
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Jalankan N demo client terhadap server ini
    #[arg(long, default_value_t = 0)]
    clients: usize,
}

fn server_config(args: &Args) -> ServerConfig {
    ServerConfig::default()
        .with_pool_capacity(args.capacity)
        .with_recv_buffer_size(args.buffer)
}

fn handler_template<T: Transport>(args: &Args) -> CallbackHandler<T> {
    let reply: Arc<[u8]> = Arc::from(args.reply.as_bytes());
    let echo = args.echo;

    CallbackHandler::new()
        .on_connect(|conn: &T| info!(peer = ?conn.peer_addr(), "client connected"))
        .on_message(move |conn: &T, payload: &[u8]| {
            let out = if echo { payload } else { &reply[..] };
            if let Err(kind) = conn.send_all(out) {
                warn!(peer = ?conn.peer_addr(), %kind, "unable to send reply");
                conn.close();
            }
        })
        .on_disconnect(|conn: &T| info!(peer = ?conn.peer_addr(), "client disconnected"))
}

/// Demo client: kirim 5 pesan, baca reply setiap kali
fn run_client<T: Transport>(idx: usize, address: String, port: String) {
    let conn = match T::connect(&address, &port) {
        Ok(conn) => conn,
        Err(e) => {
            error!(client = idx, error = %e, "unable to connect");
            return;
        }
    };
    if let Err(kind) = conn.set_timeouts(Some(Duration::from_secs(2)), None) {
        warn!(client = idx, %kind, "unable to set timeouts");
    }

    let message = format!("{} : hello!\r\n", idx);
    let mut buf = [0u8; 256];

    for round in 0..5 {
        if let Err(kind) = conn.send_all(message.as_bytes()) {
            warn!(client = idx, %kind, "unable to send");
            return;
        }
        match conn.recv(&mut buf) {
            Ok(0) => warn!(client = idx, round, "no reply within timeout"),
            Ok(n) => info!(
                client = idx,
                round,
                reply = %String::from_utf8_lossy(&buf[..n]).trim_end(),
                "received"
            ),
            Err(kind) => {
                warn!(client = idx, %kind, "connection closed or error occurred");
                return;
            }
        }
    }

    conn.close();
}

fn run<T: Transport>(args: Args) -> Result<(), NetError> {
    let template = handler_template::<T>(&args);
    let server: TcpServer<T, CallbackHandler<T>> =
        TcpServer::new(server_config(&args), move || template.clone());

    server.start(&args.bind, &args.port)?;
    let addr = server.local_addr();
    info!(?addr, transport = ?args.transport, capacity = args.capacity, "server running");

    let clients: Vec<_> = (0..args.clients)
        .map(|idx| {
            let address = args.bind.clone();
            let port = addr
                .map(|a| a.port().to_string())
                .unwrap_or_else(|| args.port.clone());
            thread::spawn(move || run_client::<T>(idx + 1, address, port))
        })
        .collect();

    let start = Instant::now();
    let deadline = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let mut last_stats = Instant::now();

    loop {
        thread::sleep(Duration::from_millis(100));

        if last_stats.elapsed() >= Duration::from_secs(5) {
            let stats = server.stats();
            info!(
                uptime_s = start.elapsed().as_secs(),
                accepted = stats.accepted,
                rejected = stats.rejected,
                active = stats.active,
                messages = stats.messages_received,
                bytes = stats.bytes_received,
                "server stats"
            );
            last_stats = Instant::now();
        }

        if deadline.is_some_and(|d| start.elapsed() >= d) {
            break;
        }
    }

    for client in clients {
        let _ = client.join();
    }

    info!("stopping server");
    server.stop();
    server.join();

    let stats = server.stats();
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        completed = stats.completed,
        "server stopped"
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    let result = match args.transport {
        TransportKind::Blocking => run::<BlockingTcpSocket>(args),
        TransportKind::Polled => run::<PolledTcpSocket>(args),
    };

    if let Err(e) = result {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
