//! netpool - TCP connection-handling core
//!
//! Arsitektur:
//! - Bounded Pool: handler di-reuse, jumlah instance hidup dibatasi kapasitas
//! - Thread-per-connection: accept loop, watcher, dan satu thread per koneksi
//! - Cooperative Shutdown: watcher menutup listener untuk membatalkan `accept`
//! - Reject-on-exhaustion: koneksi ditutup jika tidak ada handler tersedia
//!
//! ```no_run
//! use netpool::config::ServerConfig;
//! use netpool::network::{BlockingTcpServer, BlockingTcpSocket, CallbackHandler, Transport};
//!
//! let template = CallbackHandler::new().on_message(|conn: &BlockingTcpSocket, payload: &[u8]| {
//!     let _ = conn.send_all(payload);
//! });
//! let server: BlockingTcpServer<_> =
//!     BlockingTcpServer::new(ServerConfig::default(), move || template.clone());
//! server.start("127.0.0.1", "7232").unwrap();
//! server.stop();
//! server.join();
//! ```

pub mod config;
pub mod core;
pub mod network;
