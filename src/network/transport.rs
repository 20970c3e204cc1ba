//! Transport capability: connection-oriented byte stream
//!
//! Server core hanya bergantung pada trait ini, jadi transport blocking
//! (socket2) dan transport poll-backed (mio) bisa saling menggantikan.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use super::error::{ErrorKind, NetError};

/// Connection-oriented byte stream transport
///
/// Kontrak yang dipakai server:
/// - `accept` returns `None` hanya jika listener sudah ditutup / tidak bisa dipakai
/// - `recv` returns `Ok(0)` jika belum ada data (receive timeout), bukan EOF.
///   EOF dari peer = `Err(ErrorKind::NotConnected)`
/// - error fatal lain pada `recv`/`send` menutup socket lalu dipropagasi
/// - `close` aman dipanggil dari thread lain yang sedang blocking di
///   `accept`/`recv`, dan membangunkannya
pub trait Transport: Send + Sync + Sized + 'static {
    /// Connect ke `address:port`, mencoba setiap alamat hasil resolve
    fn connect(address: &str, port: &str) -> Result<Self, NetError>;

    /// Bind + listen di `address:port`
    fn bind(address: &str, port: &str) -> Result<Self, NetError>;

    /// Blocking accept
    fn accept(&self) -> Option<Self>;

    fn recv(&self, buf: &mut [u8]) -> Result<usize, ErrorKind>;

    fn send(&self, buf: &[u8]) -> Result<usize, ErrorKind>;

    /// Returns `true` hanya untuk pemanggilan yang benar-benar menutup socket
    fn close(&self) -> bool;

    fn is_open(&self) -> bool;

    /// Deadline untuk `recv`/`send`; `None` = tanpa batas
    fn set_timeouts(&self, recv: Option<Duration>, send: Option<Duration>)
        -> Result<(), ErrorKind>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Kirim seluruh buffer, mengulang partial write
    ///
    /// `Wouldblock` dari `send` berarti send timeout lewat, dilaporkan
    /// sebagai `Timedout`; sebagian buffer mungkin sudah terkirim.
    fn send_all(&self, mut buf: &[u8]) -> Result<(), ErrorKind> {
        while !buf.is_empty() {
            match self.send(buf) {
                Ok(0) => return Err(ErrorKind::NotConnected),
                Ok(n) => buf = &buf[n..],
                Err(ErrorKind::Wouldblock) => return Err(ErrorKind::Timedout),
                Err(kind) => return Err(kind),
            }
        }
        Ok(())
    }
}

/// Resolve host (nama atau IP literal) + port (angka atau nama service)
pub fn resolve(address: &str, port: &str) -> Result<Vec<SocketAddr>, NetError> {
    let resolve_err = || NetError::Resolve {
        address: address.to_string(),
        port: port.to_string(),
    };

    let port_num = resolve_port(port).ok_or_else(resolve_err)?;
    let addrs: Vec<SocketAddr> = (address, port_num)
        .to_socket_addrs()
        .map_err(|_| resolve_err())?
        .collect();

    if addrs.is_empty() {
        return Err(resolve_err());
    }
    Ok(addrs)
}

/// Port numerik, atau lookup nama service (mis. "http") di services database
pub fn resolve_port(port: &str) -> Option<u16> {
    if let Ok(num) = port.trim().parse::<u16>() {
        return Some(num);
    }
    lookup_service(port.trim())
}

#[cfg(unix)]
fn lookup_service(name: &str) -> Option<u16> {
    use std::ffi::CString;

    // getservbyname memakai buffer static, jadi diserialisasi
    static SERVICES_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    let name = CString::new(name).ok()?;
    let proto = CString::new("tcp").ok()?;

    let _guard = SERVICES_LOCK.lock();
    // SAFETY: kedua pointer valid selama pemanggilan; hasil dibaca sebelum lock dilepas
    unsafe {
        let entry = libc::getservbyname(name.as_ptr(), proto.as_ptr());
        if entry.is_null() {
            return None;
        }
        // s_port dalam network byte order
        Some(u16::from_be((*entry).s_port as u16))
    }
}

#[cfg(not(unix))]
fn lookup_service(_name: &str) -> Option<u16> {
    None
}
