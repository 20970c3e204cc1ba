//! Core module: resource pooling
//!
//! Prinsip desain:
//! - Bounded: jumlah instance hidup tidak pernah melebihi kapasitas
//! - Reuse: instance dikembalikan ke pool, bukan dialokasi ulang per koneksi
//! - No busy-wait: acquire yang menunggu tidur di condvar sampai deadline

mod pool;

pub use pool::ResourcePool;
