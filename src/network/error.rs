//! Error taxonomy untuk transport layer
//!
//! `ErrorKind` adalah klasifikasi platform-independent dari kegagalan socket.
//! Mapping dari kode error OS disimpan di tabel static read-only, aman
//! dibaca dari thread mana pun tanpa sinkronisasi.

use std::fmt;
use std::io;

use thiserror::Error;

/// Normalized transport failure kind
///
/// Nilai numerik stabil; `SocketError` = -1, `Success` = 0.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Generic fatal transport failure
    SocketError = -1,
    Success = 0,
    InvalidSocket,
    InvalidAddress,
    ConnectionRefused,
    Timedout,
    /// Belum ada data (non-blocking / receive timeout), bukan error fatal
    Wouldblock,
    /// Koneksi sudah ditutup (oleh peer atau lokal)
    NotConnected,
    InProgress,
    Interrupted,
    ConnectionAborted,
    ConnectionReset,
    AddressInUse,
    Unknown,
}

#[cfg(unix)]
static OS_ERROR_TABLE: &[(i32, ErrorKind)] = &[
    (0, ErrorKind::Success),
    (libc::ENOTCONN, ErrorKind::NotConnected),
    (libc::EBADF, ErrorKind::NotConnected),
    (libc::EINTR, ErrorKind::Interrupted),
    (libc::ECONNREFUSED, ErrorKind::ConnectionRefused),
    (libc::ETIMEDOUT, ErrorKind::Timedout),
    (libc::EINPROGRESS, ErrorKind::InProgress),
    (libc::ECONNABORTED, ErrorKind::ConnectionAborted),
    (libc::EWOULDBLOCK, ErrorKind::Wouldblock),
    (libc::EAGAIN, ErrorKind::Wouldblock),
    (libc::ENOTSOCK, ErrorKind::InvalidSocket),
    (libc::ECONNRESET, ErrorKind::ConnectionReset),
    (libc::EPIPE, ErrorKind::ConnectionReset),
    (libc::EADDRINUSE, ErrorKind::AddressInUse),
    (libc::EADDRNOTAVAIL, ErrorKind::InvalidAddress),
];

// Winsock codes (WSAE*), nilainya tetap di semua versi Windows
#[cfg(windows)]
static OS_ERROR_TABLE: &[(i32, ErrorKind)] = &[
    (0, ErrorKind::Success),
    (10009, ErrorKind::NotConnected),      // WSAEBADF
    (10057, ErrorKind::NotConnected),      // WSAENOTCONN
    (10004, ErrorKind::Interrupted),       // WSAEINTR
    (10061, ErrorKind::ConnectionRefused), // WSAECONNREFUSED
    (10060, ErrorKind::Timedout),          // WSAETIMEDOUT
    (10036, ErrorKind::InProgress),        // WSAEINPROGRESS
    (10053, ErrorKind::ConnectionAborted), // WSAECONNABORTED
    (10035, ErrorKind::Wouldblock),        // WSAEWOULDBLOCK
    (10038, ErrorKind::InvalidSocket),     // WSAENOTSOCK
    (10054, ErrorKind::ConnectionReset),   // WSAECONNRESET
    (11004, ErrorKind::InvalidAddress),    // WSANO_DATA
    (10048, ErrorKind::AddressInUse),      // WSAEADDRINUSE
];

#[cfg(not(any(unix, windows)))]
static OS_ERROR_TABLE: &[(i32, ErrorKind)] = &[(0, ErrorKind::Success)];

impl ErrorKind {
    /// Kode numerik stabil
    #[inline(always)]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Lookup kode error OS di tabel static
    pub fn from_raw_os_error(code: i32) -> Option<Self> {
        OS_ERROR_TABLE
            .iter()
            .find(|(raw, _)| *raw == code)
            .map(|&(_, kind)| kind)
    }

    /// Normalisasi `io::Error`
    ///
    /// Kode OS dicek dulu; error sintetis (tanpa kode OS) dipetakan
    /// lewat `io::ErrorKind`.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(kind) = err.raw_os_error().and_then(Self::from_raw_os_error) {
            return kind;
        }

        match err.kind() {
            io::ErrorKind::WouldBlock => Self::Wouldblock,
            io::ErrorKind::TimedOut => Self::Timedout,
            io::ErrorKind::Interrupted => Self::Interrupted,
            io::ErrorKind::NotConnected => Self::NotConnected,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Self::ConnectionReset,
            io::ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            io::ErrorKind::AddrInUse => Self::AddressInUse,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => Self::InvalidAddress,
            io::ErrorKind::UnexpectedEof => Self::NotConnected,
            _ => Self::Unknown,
        }
    }

    /// "Coba lagi nanti": tidak menutup koneksi
    #[inline(always)]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Wouldblock)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::SocketError => "socket error",
            Self::Success => "success",
            Self::InvalidSocket => "invalid socket",
            Self::InvalidAddress => "invalid address",
            Self::ConnectionRefused => "connection refused",
            Self::Timedout => "timed out",
            Self::Wouldblock => "operation would block",
            Self::NotConnected => "not connected",
            Self::InProgress => "operation in progress",
            Self::Interrupted => "interrupted",
            Self::ConnectionAborted => "connection aborted",
            Self::ConnectionReset => "connection reset",
            Self::AddressInUse => "address in use",
            Self::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}

impl From<&io::Error> for ErrorKind {
    fn from(err: &io::Error) -> Self {
        Self::from_io(err)
    }
}

/// Error untuk operasi setup (resolve, connect, bind, start)
#[derive(Debug, Error)]
pub enum NetError {
    #[error("unable to resolve {address}:{port}")]
    Resolve { address: String, port: String },

    #[error("{op} failed ({kind}): {source}")]
    Io {
        op: &'static str,
        kind: ErrorKind,
        #[source]
        source: io::Error,
    },

    #[error("server is {0}, operation not allowed")]
    InvalidState(&'static str),
}

impl NetError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io {
            op,
            kind: ErrorKind::from_io(&source),
            source,
        }
    }

    /// Normalized kind dari error ini
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolve { .. } => ErrorKind::InvalidAddress,
            Self::Io { kind, .. } => *kind,
            Self::InvalidState(_) => ErrorKind::InvalidSocket,
        }
    }
}
