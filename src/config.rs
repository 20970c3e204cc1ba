//! Server configuration

use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Jumlah maksimal handler hidup (= koneksi yang dilayani bersamaan)
    pub pool_capacity: usize,
    /// Ukuran buffer `recv` di run loop
    pub recv_buffer_size: usize,
    /// Receive deadline untuk setiap koneksi yang di-accept
    pub recv_timeout: Option<Duration>,
    /// Send deadline untuk setiap koneksi yang di-accept
    pub send_timeout: Option<Duration>,
    /// Timeout `pop` di accept loop. Nol = tolak koneksi saat pool habis
    pub pool_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 16,
            recv_buffer_size: 256,
            recv_timeout: Some(Duration::from_secs(1)),
            send_timeout: Some(Duration::from_secs(5)),
            pool_wait: Duration::ZERO,
        }
    }
}

impl ServerConfig {
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Minimal 1 byte
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.max(1);
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.recv_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_pool_wait(mut self, wait: Duration) -> Self {
        self.pool_wait = wait;
        self
    }
}
