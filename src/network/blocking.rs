//! Blocking TCP transport di atas socket2
//!
//! Setiap `BlockingTcpSocket` memiliki tepat satu handle OS. Setelah `close`,
//! handle dilepas dan semua operasi berikutnya gagal dengan `NotConnected`.
//! Thread yang sedang blocking di `accept`/`recv` memegang clone `Arc` dari
//! socket, jadi fd tidak pernah dipakai ulang selagi masih dipakai.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use super::error::{ErrorKind, NetError};
use super::transport::{resolve, Transport};

const LISTEN_BACKLOG: i32 = 1024;
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Blocking, timeout-bounded TCP socket
#[derive(Debug)]
pub struct BlockingTcpSocket {
    inner: RwLock<Option<Arc<Socket>>>,
    listening: bool,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl BlockingTcpSocket {
    fn from_socket(socket: Socket, listening: bool) -> Self {
        let local = socket.local_addr().ok().and_then(|a| a.as_socket());
        let peer = if listening {
            None
        } else {
            socket.peer_addr().ok().and_then(|a| a.as_socket())
        };

        Self {
            inner: RwLock::new(Some(Arc::new(socket))),
            listening,
            local,
            peer,
        }
    }

    /// Clone handle untuk operasi yang bisa blocking (lock tidak ditahan)
    #[inline]
    fn handle(&self) -> Result<Arc<Socket>, ErrorKind> {
        self.inner.read().clone().ok_or(ErrorKind::NotConnected)
    }

    /// Buka koneksi singkat ke listener sendiri supaya `accept` yang
    /// blocking kembali, untuk platform di mana shutdown listener tidak
    /// membangunkannya.
    fn wake_acceptor(&self) {
        let Some(mut addr) = self.local else {
            return;
        };
        if addr.ip().is_unspecified() {
            let loopback = match addr {
                SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            };
            addr.set_ip(loopback);
        }
        // Di Linux listener sudah CLOSED setelah shutdown, connect langsung ditolak
        let _ = TcpStream::connect_timeout(&addr, WAKE_CONNECT_TIMEOUT);
    }
}

impl Transport for BlockingTcpSocket {
    fn connect(address: &str, port: &str) -> Result<Self, NetError> {
        let mut last_err = None;

        for addr in resolve(address, port)? {
            let attempt = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
                .and_then(|socket| socket.connect(&addr.into()).map(|()| socket));

            match attempt {
                Ok(socket) => {
                    socket.set_tcp_nodelay(true).ok();
                    debug!(%addr, "connected");
                    return Ok(Self::from_socket(socket, false));
                }
                Err(e) => {
                    trace!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(NetError::io(
            "connect",
            last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)),
        ))
    }

    fn bind(address: &str, port: &str) -> Result<Self, NetError> {
        let addr = resolve(address, port)?[0];

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| NetError::io("socket", e))?;

        // Di Windows SO_REUSEADDR mengizinkan port stealing
        #[cfg(not(windows))]
        socket
            .set_reuse_address(true)
            .map_err(|e| NetError::io("setsockopt", e))?;

        socket
            .bind(&addr.into())
            .map_err(|e| NetError::io("bind", e))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| NetError::io("listen", e))?;

        Ok(Self::from_socket(socket, true))
    }

    fn accept(&self) -> Option<Self> {
        loop {
            let listener = self.handle().ok()?;

            match listener.accept() {
                Ok((socket, _)) => {
                    if !self.is_open() {
                        // Koneksi wake dari close(), atau klien yang kalah balapan
                        return None;
                    }
                    socket.set_tcp_nodelay(true).ok();
                    return Some(Self::from_socket(socket, false));
                }
                Err(e) => match ErrorKind::from_io(&e) {
                    ErrorKind::Interrupted | ErrorKind::ConnectionAborted if self.is_open() => {
                        trace!(error = %e, "transient accept failure, retrying");
                    }
                    kind => {
                        if self.close() {
                            debug!(%kind, "accept failed, listener closed");
                        }
                        return None;
                    }
                },
            }
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, ErrorKind> {
        let socket = self.handle()?;

        match (&*socket).read(buf) {
            Ok(0) if !buf.is_empty() => Err(ErrorKind::NotConnected),
            Ok(n) => Ok(n),
            Err(e) => {
                let kind = ErrorKind::from_io(&e);
                // Windows melaporkan SO_RCVTIMEO sebagai WSAETIMEDOUT
                if kind.is_transient() || (cfg!(windows) && kind == ErrorKind::Timedout) {
                    return Ok(0);
                }
                self.close();
                Err(kind)
            }
        }
    }

    fn send(&self, buf: &[u8]) -> Result<usize, ErrorKind> {
        let socket = self.handle()?;

        match (&*socket).write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let kind = ErrorKind::from_io(&e);
                if !kind.is_transient() {
                    self.close();
                }
                Err(kind)
            }
        }
    }

    fn close(&self) -> bool {
        let Some(socket) = self.inner.write().take() else {
            return false;
        };

        // shutdown membangunkan thread lain yang blocking di accept/recv
        let _ = socket.shutdown(Shutdown::Both);
        if self.listening {
            self.wake_acceptor();
        }
        true
    }

    fn is_open(&self) -> bool {
        self.inner.read().is_some()
    }

    fn set_timeouts(
        &self,
        recv: Option<Duration>,
        send: Option<Duration>,
    ) -> Result<(), ErrorKind> {
        let socket = self.handle()?;
        socket
            .set_read_timeout(recv)
            .and_then(|()| socket.set_write_timeout(send))
            .map_err(|e| ErrorKind::from_io(&e))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Drop for BlockingTcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn listener() -> (BlockingTcpSocket, String) {
        let l = BlockingTcpSocket::bind("127.0.0.1", "0").unwrap();
        let port = l.local_addr().unwrap().port().to_string();
        (l, port)
    }

    #[test]
    fn test_close_is_idempotent() {
        let (l, _) = listener();
        assert!(l.is_open());
        assert!(l.close());
        assert!(!l.close());
        assert!(!l.is_open());
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (l, port) = listener();
        let client = BlockingTcpSocket::connect("127.0.0.1", &port).unwrap();
        let _server_side = l.accept().unwrap();

        client.close();
        let mut buf = [0u8; 8];
        assert_eq!(client.recv(&mut buf), Err(ErrorKind::NotConnected));
        assert_eq!(client.send(b"x"), Err(ErrorKind::NotConnected));
        assert_eq!(client.set_timeouts(None, None), Err(ErrorKind::NotConnected));
    }

    #[test]
    fn test_close_unblocks_accept() {
        let (l, _) = listener();
        let l = Arc::new(l);

        let acceptor = {
            let l = l.clone();
            thread::spawn(move || l.accept().is_none())
        };

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        assert!(l.close());
        assert!(acceptor.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_recv_timeout_is_not_an_error() {
        let (l, port) = listener();
        let _client = BlockingTcpSocket::connect("127.0.0.1", &port).unwrap();
        let conn = l.accept().unwrap();
        conn.set_timeouts(Some(Duration::from_millis(30)), None).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(conn.recv(&mut buf), Ok(0));
        assert!(conn.is_open());
    }

    #[test]
    fn test_peer_close_is_not_connected() {
        let (l, port) = listener();
        let client = BlockingTcpSocket::connect("127.0.0.1", &port).unwrap();
        let conn = l.accept().unwrap();

        client.send_all(b"bye").unwrap();
        client.close();

        let mut buf = [0u8; 16];
        assert_eq!(conn.recv(&mut buf), Ok(3));
        assert_eq!(&buf[..3], b"bye");
        assert_eq!(conn.recv(&mut buf), Err(ErrorKind::NotConnected));
    }

    #[test]
    fn test_bind_address_in_use() {
        let (_l, port) = listener();
        let err = BlockingTcpSocket::bind("127.0.0.1", &port).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressInUse);
    }
}
