//! Connection handler: capability set per koneksi
//!
//! Handler adalah objek long-lived yang dikelola `ResourcePool`. Satu
//! instance melayani satu koneksi pada satu waktu, lalu dikembalikan ke pool
//! dan dipakai ulang untuk koneksi berikutnya.
//!
//! Dua cara binding yang setara:
//! - implementasi trait `ConnectionHandler` (method dispatch)
//! - `CallbackHandler` dengan closure yang didaftarkan

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::error::ErrorKind;
use super::transport::Transport;

/// Capability set `{on_connect, on_message, on_disconnect}`
pub trait ConnectionHandler<T: Transport>: Send + 'static {
    fn on_connect(&mut self, _conn: &T) {}

    /// Dipanggil dengan byte yang benar-benar diterima, tanpa coalescing
    fn on_message(&mut self, conn: &T, payload: &[u8]) {
        warn!(
            peer = ?conn.peer_addr(),
            len = payload.len(),
            "message dropped, handler has no on_message"
        );
    }

    fn on_disconnect(&mut self, _conn: &T) {}
}

type ConnectFn<T> = Arc<dyn Fn(&T) + Send + Sync>;
type MessageFn<T> = Arc<dyn Fn(&T, &[u8]) + Send + Sync>;

/// Handler berbasis closure
///
/// Clone murah (closure di-share lewat `Arc`), jadi satu template bisa
/// dipakai sebagai handler factory.
pub struct CallbackHandler<T> {
    connect: Option<ConnectFn<T>>,
    message: Option<MessageFn<T>>,
    disconnect: Option<ConnectFn<T>>,
}

impl<T> CallbackHandler<T> {
    pub fn new() -> Self {
        Self {
            connect: None,
            message: None,
            disconnect: None,
        }
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.connect = Some(Arc::new(f));
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &[u8]) + Send + Sync + 'static,
    {
        self.message = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.disconnect = Some(Arc::new(f));
        self
    }
}

impl<T> Default for CallbackHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CallbackHandler<T> {
    fn clone(&self) -> Self {
        Self {
            connect: self.connect.clone(),
            message: self.message.clone(),
            disconnect: self.disconnect.clone(),
        }
    }
}

impl<T> fmt::Debug for CallbackHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandler")
            .field("on_connect", &self.connect.is_some())
            .field("on_message", &self.message.is_some())
            .field("on_disconnect", &self.disconnect.is_some())
            .finish()
    }
}

impl<T: Transport> ConnectionHandler<T> for CallbackHandler<T> {
    fn on_connect(&mut self, conn: &T) {
        if let Some(f) = &self.connect {
            f(conn);
        }
    }

    fn on_message(&mut self, conn: &T, payload: &[u8]) {
        match &self.message {
            Some(f) => f(conn, payload),
            None => warn!(
                peer = ?conn.peer_addr(),
                len = payload.len(),
                "message dropped, no on_message callback registered"
            ),
        }
    }

    fn on_disconnect(&mut self, conn: &T) {
        if let Some(f) = &self.disconnect {
            f(conn);
        }
    }
}

/// Ringkasan satu run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub messages: u64,
    pub bytes: u64,
    /// `NotConnected` untuk close normal, selain itu error fatal
    pub exit: ErrorKind,
}

/// Run loop per koneksi
///
/// `on_connect` → `recv` berulang ke `buf`, setiap chunk dikirim ke
/// `on_message` apa adanya → `on_disconnect`. Loop berhenti pada close dari
/// peer atau error fatal; receive timeout (`Ok(0)`) hanya diulang.
pub fn run_connection<T, H>(handler: &mut H, conn: &T, buf: &mut [u8]) -> RunSummary
where
    T: Transport,
    H: ConnectionHandler<T> + ?Sized,
{
    debug_assert!(!buf.is_empty(), "receive buffer must not be empty");

    let mut messages = 0u64;
    let mut bytes = 0u64;

    handler.on_connect(conn);

    let exit = loop {
        match conn.recv(buf) {
            Ok(0) => continue,
            Ok(n) => {
                messages += 1;
                bytes += n as u64;
                handler.on_message(conn, &buf[..n]);
            }
            Err(ErrorKind::NotConnected) => {
                debug!(peer = ?conn.peer_addr(), "connection closed");
                break ErrorKind::NotConnected;
            }
            Err(kind) => {
                warn!(peer = ?conn.peer_addr(), %kind, "connection error");
                break kind;
            }
        }
    };

    handler.on_disconnect(conn);

    RunSummary {
        messages,
        bytes,
        exit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::BlockingTcpSocket;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        payload: Vec<u8>,
    }

    impl ConnectionHandler<BlockingTcpSocket> for Recorder {
        fn on_connect(&mut self, _conn: &BlockingTcpSocket) {
            self.events.push("connect".into());
        }

        fn on_message(&mut self, _conn: &BlockingTcpSocket, payload: &[u8]) {
            self.events.push(format!("message:{}", payload.len()));
            self.payload.extend_from_slice(payload);
        }

        fn on_disconnect(&mut self, _conn: &BlockingTcpSocket) {
            self.events.push("disconnect".into());
        }
    }

    fn pair() -> (BlockingTcpSocket, BlockingTcpSocket) {
        let l = BlockingTcpSocket::bind("127.0.0.1", "0").unwrap();
        let port = l.local_addr().unwrap().port().to_string();
        let client = BlockingTcpSocket::connect("127.0.0.1", &port).unwrap();
        let conn = l.accept().unwrap();
        (client, conn)
    }

    #[test]
    fn test_run_loop_order_and_partial_reads() {
        let (client, conn) = pair();
        conn.set_timeouts(Some(Duration::from_millis(20)), None)
            .unwrap();

        let payload: Vec<u8> = (0..=255u8).cycle().take(20).collect();
        let sender = thread::spawn(move || {
            client.send_all(&payload).unwrap();
            thread::sleep(Duration::from_millis(60));
            client.close();
            payload
        });

        let mut handler = Recorder::default();
        let mut buf = [0u8; 8];
        let summary = run_connection(&mut handler, &conn, &mut buf);
        let sent = sender.join().unwrap();

        assert_eq!(summary.exit, ErrorKind::NotConnected);
        assert_eq!(summary.bytes, 20);
        assert_eq!(handler.payload, sent);
        assert_eq!(handler.events.first().map(String::as_str), Some("connect"));
        assert_eq!(handler.events.last().map(String::as_str), Some("disconnect"));
        // Tidak ada chunk yang melebihi ukuran buffer
        assert!(summary.messages >= 3);
    }

    #[test]
    fn test_callback_handler_dispatch() {
        let (client, conn) = pair();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut handler = {
            let on_msg = seen.clone();
            let on_conn = seen.clone();
            let on_disc = seen.clone();
            CallbackHandler::new()
                .on_connect(move |_: &BlockingTcpSocket| on_conn.lock().push(b"+".to_vec()))
                .on_message(move |_: &BlockingTcpSocket, p: &[u8]| on_msg.lock().push(p.to_vec()))
                .on_disconnect(move |_: &BlockingTcpSocket| on_disc.lock().push(b"-".to_vec()))
        };

        client.send_all(b"abc").unwrap();
        thread::sleep(Duration::from_millis(20));
        client.close();

        let mut buf = [0u8; 256];
        run_connection(&mut handler, &conn, &mut buf);

        let seen = seen.lock();
        assert_eq!(seen.first().unwrap(), b"+");
        assert_eq!(seen.last().unwrap(), b"-");
        let body: Vec<u8> = seen[1..seen.len() - 1].concat();
        assert_eq!(body, b"abc");
    }

    #[test]
    fn test_handler_closing_connection_ends_loop() {
        let (client, conn) = pair();
        let mut handler = CallbackHandler::new().on_message(|c: &BlockingTcpSocket, _: &[u8]| {
            c.close();
        });

        client.send_all(b"quit").unwrap();
        let mut buf = [0u8; 256];
        let summary = run_connection(&mut handler, &conn, &mut buf);

        assert_eq!(summary.exit, ErrorKind::NotConnected);
        assert_eq!(summary.messages, 1);
        assert!(!conn.is_open());
    }
}
