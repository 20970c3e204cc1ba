//! TCP server: bind → accept loop → dispatch per koneksi → cooperative shutdown
//!
//! Model thread-per-connection:
//! - satu thread accept loop (blocking `accept`)
//! - satu thread watcher yang menunggu stop request lalu menutup listener,
//!   karena `accept` yang blocking tidak bisa diinterupsi secara langsung
//! - satu thread per koneksi, handler diambil dari `ResourcePool`
//!
//! Koneksi yang datang saat pool habis langsung ditutup (tidak diantrikan).
//! `stop()` hanya menghentikan accept; handler yang sedang berjalan selesai
//! secara natural saat peer disconnect.

use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use super::error::NetError;
use super::handler::{run_connection, ConnectionHandler};
use super::transport::Transport;
use crate::config::ServerConfig;
use crate::core::ResourcePool;

type HandlerFactory<H> = Arc<dyn Fn() -> H + Send + Sync>;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unbound,
    Bound,
    Running,
    Stopping,
    Stopped,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server statistics (lock-free counters)
#[derive(Debug, Default)]
struct ServerStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    connections_active: AtomicU64,
    connections_completed: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
}

/// Snapshot dari `ServerStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Koneksi yang mendapat handler
    pub accepted: u64,
    /// Koneksi yang ditutup karena pool habis
    pub rejected: u64,
    pub active: u64,
    pub completed: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

impl ServerStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.connections_accepted.load(Ordering::Relaxed),
            rejected: self.connections_rejected.load(Ordering::Relaxed),
            active: self.connections_active.load(Ordering::Relaxed),
            completed: self.connections_completed.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// State yang di-share antara server, accept loop, watcher, dan handler
struct Shared<T, H> {
    config: ServerConfig,
    listener: Mutex<Option<Arc<T>>>,
    state: Mutex<ServerState>,
    stop_requested: Mutex<bool>,
    stop_cv: Condvar,
    pool: ResourcePool<H>,
    factory: Arc<RwLock<HandlerFactory<H>>>,
    stats: ServerStats,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, H> Shared<T, H>
where
    T: Transport,
    H: ConnectionHandler<T>,
{
    fn set_state(&self, state: ServerState) {
        let mut current = self.state.lock();
        if *current != state {
            let from = *current;
            trace!(%from, to = %state, "server state");
            *current = state;
        }
    }

    /// Set flag sekali, tidak pernah di-reset
    fn request_stop(&self) {
        {
            let mut stop = self.stop_requested.lock();
            if *stop {
                return;
            }
            *stop = true;
        }
        self.stop_cv.notify_all();

        let mut state = self.state.lock();
        *state = match *state {
            ServerState::Unbound => ServerState::Stopped,
            ServerState::Bound | ServerState::Running => ServerState::Stopping,
            other => other,
        };
    }

    fn is_stop_requested(&self) -> bool {
        *self.stop_requested.lock()
    }

    /// Watcher: tunggu stop request, lalu tutup listener
    fn watch(&self, listener: Arc<T>) {
        {
            let mut stop = self.stop_requested.lock();
            while !*stop {
                self.stop_cv.wait(&mut stop);
            }
        }

        if listener.close() {
            info!(addr = ?listener.local_addr(), "listener closed");
        }
    }

    fn accept_loop(self: &Arc<Self>, listener: Arc<T>) {
        info!(
            addr = ?listener.local_addr(),
            capacity = self.pool.capacity(),
            "accept loop started"
        );

        // None = listener ditutup (stop) atau tidak bisa dipakai lagi
        while let Some(conn) = listener.accept() {
            self.reap_workers();
            self.dispatch(conn);
        }

        info!(addr = ?listener.local_addr(), "accept loop exited");
        // Listener mati tanpa stop(): watcher tetap harus dilepas
        self.request_stop();
        self.set_state(ServerState::Stopped);
    }

    fn dispatch(self: &Arc<Self>, conn: T) {
        let peer = conn.peer_addr();

        // Factory milik user bisa panic; accept loop tidak boleh ikut mati
        let acquired = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pool.pop(self.config.pool_wait, ())
        }));
        let handler = match acquired {
            Ok(Some(handler)) => handler,
            Ok(None) => {
                warn!(
                    ?peer,
                    capacity = self.pool.capacity(),
                    "handler pool exhausted, rejecting connection"
                );
                self.reject(conn);
                return;
            }
            Err(_) => {
                error!(?peer, "handler factory panicked, rejecting connection");
                self.reject(conn);
                return;
            }
        };

        if let Err(kind) = conn.set_timeouts(self.config.recv_timeout, self.config.send_timeout) {
            warn!(?peer, %kind, "unable to configure connection");
            conn.close();
            self.pool.push(handler);
            return;
        }

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        debug!(?peer, "connection accepted");

        // Handler dititipkan di slot supaya bisa diambil kembali jika spawn gagal
        let slot = Arc::new(Mutex::new(Some(handler)));
        let shared = Arc::clone(self);
        let worker_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name("netpool-conn".into())
            .spawn(move || {
                let handler = worker_slot.lock().take();
                if let Some(handler) = handler {
                    shared.serve(handler, conn);
                }
            });

        match spawned {
            Ok(worker) => self.workers.lock().push(worker),
            Err(e) => {
                // Koneksi ikut di-drop (dan ditutup) bersama closure
                error!(?peer, error = %e, "unable to spawn connection thread");
                self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                self.abandon_loan(&slot);
            }
        }
    }

    fn reject(&self, conn: T) {
        self.stats
            .connections_rejected
            .fetch_add(1, Ordering::Relaxed);
        conn.close();
    }

    /// Kembalikan slot pinjaman dari handler yang tidak pernah dijalankan
    fn abandon_loan(&self, slot: &Mutex<Option<H>>) {
        let handler = slot.lock().take();
        match handler {
            Some(handler) => self.pool.discard(handler),
            None => self.pool.release_loan(),
        }
    }

    fn serve(&self, mut handler: H, conn: T) {
        let peer = conn.peer_addr();
        let mut buf = vec![0u8; self.config.recv_buffer_size.max(1)];

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            run_connection(&mut handler, &conn, &mut buf)
        }));

        conn.close();

        match outcome {
            Ok(summary) => {
                self.stats
                    .messages_received
                    .fetch_add(summary.messages, Ordering::Relaxed);
                self.stats
                    .bytes_received
                    .fetch_add(summary.bytes, Ordering::Relaxed);
                debug!(
                    ?peer,
                    messages = summary.messages,
                    bytes = summary.bytes,
                    exit = %summary.exit,
                    "connection finished"
                );
                self.pool.push(handler);
            }
            Err(_) => {
                error!(?peer, "handler panicked, discarding instance");
                self.pool.discard(handler);
            }
        }

        // Counter diupdate terakhir: completed berarti handler sudah kembali ke pool
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .connections_completed
            .fetch_add(1, Ordering::Relaxed);
    }

    fn reap_workers(&self) {
        self.workers.lock().retain(|worker| !worker.is_finished());
    }
}

/// Blocking TCP server dengan handler pool
///
/// `T` adalah transport (blocking atau polled), `H` adalah handler yang
/// dibuat oleh factory dan di-reuse lewat pool.
pub struct TcpServer<T, H>
where
    T: Transport,
    H: ConnectionHandler<T>,
{
    shared: Arc<Shared<T, H>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    watcher_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T, H> TcpServer<T, H>
where
    T: Transport,
    H: ConnectionHandler<T>,
{
    /// Membuat server baru dengan handler factory
    pub fn new<F>(config: ServerConfig, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: Arc<RwLock<HandlerFactory<H>>> = Arc::new(RwLock::new(Arc::new(factory)));

        let create = {
            let factory = Arc::clone(&factory);
            move |()| {
                let make = Arc::clone(&*factory.read());
                make()
            }
        };
        let pool = ResourcePool::with_destructor(
            create,
            |_handler: H| trace!("handler instance destroyed"),
            config.pool_capacity,
        );

        Self {
            shared: Arc::new(Shared {
                config,
                listener: Mutex::new(None),
                state: Mutex::new(ServerState::Unbound),
                stop_requested: Mutex::new(false),
                stop_cv: Condvar::new(),
                pool,
                factory,
                stats: ServerStats::default(),
                workers: Mutex::new(Vec::new()),
            }),
            accept_thread: Mutex::new(None),
            watcher_thread: Mutex::new(None),
        }
    }

    /// Ganti handler factory
    ///
    /// Hanya berlaku untuk handler yang dibuat setelah ini; instance yang
    /// sudah ada di pool tetap dipakai ulang.
    pub fn set_handler_factory<F>(&self, factory: F)
    where
        F: Fn() -> H + Send + Sync + 'static,
    {
        *self.shared.factory.write() = Arc::new(factory);
    }

    /// Bind + listen, lalu jalankan watcher thread
    pub fn bind(&self, address: &str, port: &str) -> Result<(), NetError> {
        let mut state = self.shared.state.lock();
        if *state != ServerState::Unbound || self.shared.is_stop_requested() {
            return Err(NetError::InvalidState(state.as_str()));
        }

        let listener = match T::bind(address, port) {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                error!(address, port, error = %e, "unable to bind");
                return Err(e);
            }
        };

        let watcher = {
            let shared = Arc::clone(&self.shared);
            let listener = Arc::clone(&listener);
            thread::Builder::new()
                .name("netpool-watcher".into())
                .spawn(move || shared.watch(listener))
                .map_err(|e| NetError::io("spawn", e))?
        };

        info!(addr = ?listener.local_addr(), "listening");
        *self.shared.listener.lock() = Some(listener);
        *self.watcher_thread.lock() = Some(watcher);
        *state = ServerState::Bound;
        Ok(())
    }

    /// Bind (jika belum) lalu jalankan accept loop di thread sendiri
    ///
    /// Returns segera setelah accept loop berjalan. Bind failure
    /// dikembalikan ke caller dan accept loop tidak pernah dimulai.
    pub fn start(&self, address: &str, port: &str) -> Result<(), NetError> {
        let mut accept_thread = self.accept_thread.lock();

        if self.state() == ServerState::Unbound {
            self.bind(address, port)?;
        }

        let mut state = self.shared.state.lock();
        if *state != ServerState::Bound || accept_thread.is_some() {
            return Err(NetError::InvalidState(state.as_str()));
        }
        let listener = self
            .shared
            .listener
            .lock()
            .clone()
            .ok_or(NetError::InvalidState(ServerState::Unbound.as_str()))?;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("netpool-accept".into())
            .spawn(move || shared.accept_loop(listener))
            .map_err(|e| NetError::io("spawn", e))?;

        *accept_thread = Some(handle);
        *state = ServerState::Running;
        Ok(())
    }

    /// Request stop (fire-and-forget)
    ///
    /// Watcher menutup listener sehingga accept loop keluar. Gunakan
    /// `join` untuk menunggu semua thread selesai.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Tunggu accept loop, watcher, dan semua handler thread selesai
    ///
    /// Blocking sampai server di-stop dan setiap koneksi aktif ditutup peer.
    pub fn join(&self) {
        let accept = self.accept_thread.lock().take();
        if let Some(handle) = accept {
            if handle.join().is_err() {
                error!("accept loop panicked");
            }
        }
        let watcher = self.watcher_thread.lock().take();
        if let Some(handle) = watcher {
            if handle.join().is_err() {
                error!("watcher panicked");
            }
        }

        loop {
            let workers = std::mem::take(&mut *self.shared.workers.lock());
            if workers.is_empty() {
                break;
            }
            for worker in workers {
                // Panic handler sudah ditangkap di serve()
                let _ = worker.join();
            }
        }

        if self.shared.is_stop_requested() {
            self.shared.set_state(ServerState::Stopped);
        }
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.lock()
    }

    /// Alamat listener (berguna saat bind ke port "0")
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .listener
            .lock()
            .as_ref()
            .and_then(|listener| listener.local_addr())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Handler pool milik server
    pub fn pool(&self) -> &ResourcePool<H> {
        &self.shared.pool
    }
}

impl<T, H> Drop for TcpServer<T, H>
where
    T: Transport,
    H: ConnectionHandler<T>,
{
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::BlockingTcpSocket;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counted(Arc<AtomicUsize>);

    impl ConnectionHandler<BlockingTcpSocket> for Counted {}

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted_server(dropped: &Arc<AtomicUsize>) -> TcpServer<BlockingTcpSocket, Counted> {
        let dropped = Arc::clone(dropped);
        TcpServer::new(ServerConfig::default().with_pool_capacity(1), move || {
            Counted(Arc::clone(&dropped))
        })
    }

    #[test]
    fn test_abandoned_loan_destroys_handler() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let server = counted_server(&dropped);

        let handler = server.pool().pop(Duration::ZERO, ()).unwrap();
        assert!(server.pool().is_empty());

        let slot = Mutex::new(Some(handler));
        server.shared.abandon_loan(&slot);

        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(server.pool().outstanding(), 0);
        assert_eq!(server.pool().idle(), 0);
        assert!(!server.pool().is_empty());
    }

    #[test]
    fn test_abandoned_empty_slot_still_frees_loan() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let server = counted_server(&dropped);

        let handler = server.pool().pop(Duration::ZERO, ()).unwrap();
        drop(handler);

        server.shared.abandon_loan(&Mutex::new(None));
        assert_eq!(server.pool().outstanding(), 0);
        assert!(!server.pool().is_empty());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ServerState::Running.to_string(), "running");
        assert_eq!(ServerState::Stopped.as_str(), "stopped");
    }
}
