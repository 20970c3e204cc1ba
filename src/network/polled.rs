//! Poll-backed blocking TCP transport di atas mio
//!
//! Kontraknya tetap blocking: `recv`/`send` menahan caller sampai ada hasil
//! atau timeout lewat, sama seperti `BlockingTcpSocket`.
//!
//! Socket non-blocking dengan satu `Poll` per socket. Operasi yang
//! WouldBlock menunggu readiness event dalam slice pendek, lalu mencoba
//! ulang I/O sampai deadline (receive/send timeout) lewat. `close()` memicu
//! `Waker`, jadi `accept`/`recv` yang sedang menunggu langsung kembali.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::error::{ErrorKind, NetError};
use super::transport::{resolve, Transport};

const SOURCE_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);
const EVENTS_CAPACITY: usize = 8;
/// Batas satu kali poll; edge yang terlewat hanya menunda retry sebesar ini
const POLL_SLICE: Duration = Duration::from_millis(50);

enum Source {
    Listener(TcpListener),
    Stream(TcpStream),
}

struct Reactor {
    poll: Poll,
    events: Events,
}

/// Non-blocking TCP socket dengan kontrak blocking-with-timeout
pub struct PolledTcpSocket {
    source: Source,
    reactor: Mutex<Reactor>,
    waker: Waker,
    closed: AtomicBool,
    recv_timeout: Mutex<Option<Duration>>,
    send_timeout: Mutex<Option<Duration>>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl PolledTcpSocket {
    fn register(mut source: Source) -> io::Result<Self> {
        let poll = Poll::new()?;

        let (local, peer) = match &mut source {
            Source::Listener(listener) => {
                poll.registry()
                    .register(listener, SOURCE_TOKEN, Interest::READABLE)?;
                (listener.local_addr().ok(), None)
            }
            Source::Stream(stream) => {
                poll.registry().register(
                    stream,
                    SOURCE_TOKEN,
                    Interest::READABLE.add(Interest::WRITABLE),
                )?;
                (stream.local_addr().ok(), stream.peer_addr().ok())
            }
        };
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            source,
            reactor: Mutex::new(Reactor {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
            }),
            waker,
            closed: AtomicBool::new(false),
            recv_timeout: Mutex::new(None),
            send_timeout: Mutex::new(None),
            local,
            peer,
        })
    }

    #[inline]
    fn stream(&self) -> Result<&TcpStream, ErrorKind> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ErrorKind::NotConnected);
        }
        match &self.source {
            Source::Stream(stream) => Ok(stream),
            Source::Listener(_) => Err(ErrorKind::InvalidSocket),
        }
    }

    /// Tunggu readiness event (atau wake) paling lama satu slice
    ///
    /// Returns `Err(Wouldblock)` jika deadline sudah lewat,
    /// `Err(NotConnected)` jika socket ditutup selama menunggu.
    fn wait(&self, deadline: Option<Instant>) -> Result<(), ErrorKind> {
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ErrorKind::Wouldblock);
                }
                (deadline - now).min(POLL_SLICE)
            }
            None => POLL_SLICE,
        };

        {
            let mut reactor = self.reactor.lock();
            let Reactor { poll, events } = &mut *reactor;
            match poll.poll(events, Some(slice)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ErrorKind::from_io(&e)),
            }
        }

        if self.closed.load(Ordering::Acquire) {
            return Err(ErrorKind::NotConnected);
        }
        Ok(())
    }

    fn deadline(timeout: &Mutex<Option<Duration>>) -> Option<Instant> {
        timeout.lock().map(|t| Instant::now() + t)
    }
}

impl Transport for PolledTcpSocket {
    fn connect(address: &str, port: &str) -> Result<Self, NetError> {
        let addrs = resolve(address, port)?;

        let stream = std::net::TcpStream::connect(addrs.as_slice())
            .map_err(|e| NetError::io("connect", e))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| NetError::io("set_nonblocking", e))?;
        stream.set_nodelay(true).ok();

        debug!(peer = ?stream.peer_addr().ok(), "connected (polled)");
        Self::register(Source::Stream(TcpStream::from_std(stream)))
            .map_err(|e| NetError::io("register", e))
    }

    fn bind(address: &str, port: &str) -> Result<Self, NetError> {
        let addr = resolve(address, port)?[0];
        let listener = TcpListener::bind(addr).map_err(|e| NetError::io("bind", e))?;
        Self::register(Source::Listener(listener)).map_err(|e| NetError::io("register", e))
    }

    fn accept(&self) -> Option<Self> {
        let Source::Listener(listener) = &self.source else {
            return None;
        };

        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nodelay(true).ok();
                    match Self::register(Source::Stream(stream)) {
                        Ok(conn) => return Some(conn),
                        Err(e) => {
                            // Koneksi dibuang, listener tetap dipakai
                            warn!(%peer, error = %e, "unable to register accepted connection");
                        }
                    }
                }
                Err(e) => match ErrorKind::from_io(&e) {
                    ErrorKind::Wouldblock => {
                        if self.wait(None).is_err() {
                            return None;
                        }
                    }
                    ErrorKind::Interrupted | ErrorKind::ConnectionAborted => {
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
        let deadline = Self::deadline(&self.recv_timeout);

        loop {
            let mut stream = self.stream()?;
            match stream.read(buf) {
                Ok(0) if !buf.is_empty() => return Err(ErrorKind::NotConnected),
                Ok(n) => return Ok(n),
                Err(e) => {
                    let kind = ErrorKind::from_io(&e);
                    if !kind.is_transient() {
                        self.close();
                        return Err(kind);
                    }
                    match self.wait(deadline) {
                        Ok(()) => {}
                        // Timeout: belum ada data, bukan error
                        Err(ErrorKind::Wouldblock) => return Ok(0),
                        Err(kind) => return Err(kind),
                    }
                }
            }
        }
    }

    fn send(&self, buf: &[u8]) -> Result<usize, ErrorKind> {
        let deadline = Self::deadline(&self.send_timeout);

        loop {
            let mut stream = self.stream()?;
            match stream.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) => {
                    let kind = ErrorKind::from_io(&e);
                    if !kind.is_transient() {
                        self.close();
                        return Err(kind);
                    }
                    self.wait(deadline)?;
                }
            }
        }
    }

    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        match &self.source {
            Source::Stream(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            // Listener berhenti menerima koneksi baru walau fd belum di-drop
            Source::Listener(listener) => {
                let _ = socket2::SockRef::from(listener).shutdown(Shutdown::Both);
            }
        }
        if let Err(e) = self.waker.wake() {
            trace!(error = %e, "waker failed");
        }
        true
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn set_timeouts(
        &self,
        recv: Option<Duration>,
        send: Option<Duration>,
    ) -> Result<(), ErrorKind> {
        if !self.is_open() {
            return Err(ErrorKind::NotConnected);
        }
        *self.recv_timeout.lock() = recv;
        *self.send_timeout.lock() = send;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Drop for PolledTcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
