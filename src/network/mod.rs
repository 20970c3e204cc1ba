//! Network Layer: transport, handler, dan server lifecycle
//!
//! Dua transport yang bisa saling menggantikan:
//! - `BlockingTcpSocket`: blocking socket (socket2) dengan SO_RCVTIMEO/SO_SNDTIMEO
//! - `PolledTcpSocket`: poll-backed blocking transport (socket non-blocking + mio), cancel via `Waker`
//!
//! Server core (`TcpServer`) hanya bergantung pada trait `Transport`.

mod blocking;
mod error;
mod handler;
mod polled;
mod server;
mod transport;

pub use blocking::BlockingTcpSocket;
pub use error::{ErrorKind, NetError};
pub use handler::{run_connection, CallbackHandler, ConnectionHandler, RunSummary};
pub use polled::PolledTcpSocket;
pub use server::{ServerState, StatsSnapshot, TcpServer};
pub use transport::{resolve, resolve_port, Transport};

/// Server dengan transport blocking
pub type BlockingTcpServer<H> = TcpServer<BlockingTcpSocket, H>;

/// Server dengan transport poll-backed (mio)
pub type PolledTcpServer<H> = TcpServer<PolledTcpSocket, H>;
