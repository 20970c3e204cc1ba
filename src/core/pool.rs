//! Bounded Resource Pool dengan blocking acquire
//!
//! Pool menyimpan instance yang bisa dipakai ulang (handler, buffer, dll).
//! Instance dibuat secara lazy lewat factory, maksimal `capacity` instance
//! hidup bersamaan (idle di free list + sedang dipinjam).
//!
//! - Reuse: LIFO, instance yang terakhir dikembalikan dipakai lebih dulu
//! - Exhausted: `pop` dengan timeout nol langsung gagal (fail-fast)
//! - Blocking: `pop` dengan timeout > 0 menunggu `push` sampai deadline

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

type CreateFn<T, A> = Box<dyn Fn(A) -> T + Send + Sync>;
type DestroyFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// Bookkeeping pool, selalu diakses di bawah satu lock
struct PoolState<T> {
    free: Vec<T>,
    outstanding: usize,
}

impl<T> PoolState<T> {
    /// Instance bisa didapat tanpa menunggu
    #[inline(always)]
    fn can_produce(&self, capacity: usize) -> bool {
        !self.free.is_empty() || self.outstanding < capacity
    }
}

/// Bounded, lazily-populated object pool
///
/// `A` adalah tipe argumen konstruktor yang diteruskan ke factory
/// hanya saat instance baru perlu dibuat.
pub struct ResourcePool<T, A = ()> {
    create: CreateFn<T, A>,
    destroy: Option<DestroyFn<T>>,
    capacity: usize,
    state: Mutex<PoolState<T>>,
    // Condvar terikat ke mutex `state`: predicate dicek ulang di bawah lock
    // yang sama dengan `push`, jadi wakeup tidak bisa hilang.
    available: Condvar,
}

impl<T, A> ResourcePool<T, A> {
    /// Membuat pool baru
    ///
    /// # Arguments
    /// * `create` - Factory untuk instance baru
    /// * `destroy` - Destructor opsional; tanpa destructor, `push` selalu
    ///   menyimpan instance ke free list
    /// * `capacity` - Jumlah maksimal instance hidup bersamaan
    pub fn new<C>(create: C, destroy: Option<DestroyFn<T>>, capacity: usize) -> Self
    where
        C: Fn(A) -> T + Send + Sync + 'static,
    {
        Self {
            create: Box::new(create),
            destroy,
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(capacity),
                outstanding: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Pool dengan destructor
    pub fn with_destructor<C, D>(create: C, destroy: D, capacity: usize) -> Self
    where
        C: Fn(A) -> T + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Self::new(create, Some(Box::new(destroy)), capacity)
    }

    /// Ambil instance dari pool
    ///
    /// Urutan: free list (LIFO) → buat baru jika masih di bawah kapasitas →
    /// tunggu sampai `timeout` jika timeout > 0. Returns `None` jika pool
    /// exhausted (langsung saat timeout nol, atau setelah deadline lewat).
    pub fn pop(&self, timeout: Duration, args: A) -> Option<T> {
        let mut state = self.state.lock();

        if !state.can_produce(self.capacity) {
            if timeout.is_zero() {
                return None;
            }

            let deadline = Instant::now() + timeout;
            while !state.can_produce(self.capacity) {
                if self.available.wait_until(&mut state, deadline).timed_out() {
                    // Deadline lewat, tapi push bisa saja terjadi tepat di batas
                    if state.can_produce(self.capacity) {
                        break;
                    }
                    trace!(capacity = self.capacity, "pool pop timed out");
                    return None;
                }
            }
        }

        state.outstanding += 1;
        if let Some(item) = state.free.pop() {
            return Some(item);
        }
        drop(state);

        // Slot sudah dihitung di outstanding; factory dipanggil tanpa lock.
        // Jika factory panic, guard mengembalikan slot sebelum unwind lanjut.
        let reservation = LoanReservation { pool: self };
        let item = (self.create)(args);
        std::mem::forget(reservation);
        Some(item)
    }

    /// Kembalikan instance ke pool
    ///
    /// Jika free list sudah penuh (dan ada destructor), instance di-destroy.
    pub fn push(&self, item: T) {
        let overflow = {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);

            if state.free.len() < self.capacity || self.destroy.is_none() {
                state.free.push(item);
                None
            } else {
                Some(item)
            }
        };

        self.available.notify_one();

        if let (Some(item), Some(destroy)) = (overflow, self.destroy.as_ref()) {
            trace!(capacity = self.capacity, "pool full, destroying pushed instance");
            destroy(item);
        }
    }

    /// Buang instance yang sedang dipinjam tanpa mengembalikannya ke free list
    ///
    /// Slot pinjaman dibebaskan, jadi `pop` berikutnya boleh membuat instance baru.
    pub fn discard(&self, item: T) {
        self.release_loan();
        match self.destroy.as_ref() {
            Some(destroy) => destroy(item),
            None => drop(item),
        }
    }

    /// Bebaskan slot pinjaman yang instance-nya sudah hilang
    pub(crate) fn release_loan(&self) {
        {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        self.available.notify_one();
    }

    /// Tidak ada instance yang bisa didapat tanpa menunggu
    pub fn is_empty(&self) -> bool {
        !self.state.lock().can_produce(self.capacity)
    }

    /// Kapasitas pool
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jumlah instance idle di free list
    pub fn idle(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Jumlah instance yang sedang dipinjam
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Destroy semua instance idle
    ///
    /// Instance yang sedang dipinjam tetap tanggung jawab peminjam.
    pub fn clear(&self) {
        let drained: Vec<T> = std::mem::take(&mut self.state.lock().free);
        match self.destroy.as_ref() {
            Some(destroy) => drained.into_iter().for_each(|item| destroy(item)),
            None => drop(drained),
        }
    }
}

/// Slot yang sudah di-reserve tapi instance-nya belum jadi
struct LoanReservation<'a, T, A> {
    pool: &'a ResourcePool<T, A>,
}

impl<T, A> Drop for LoanReservation<'_, T, A> {
    fn drop(&mut self) {
        trace!(capacity = self.pool.capacity, "factory unwound, releasing slot");
        self.pool.release_loan();
    }
}

impl<T, A> Drop for ResourcePool<T, A> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn counting_pool(capacity: usize) -> (ResourcePool<usize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        let d = destroyed.clone();
        let pool = ResourcePool::with_destructor(
            move |()| c.fetch_add(1, Ordering::SeqCst) + 1,
            move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            },
            capacity,
        );
        (pool, created, destroyed)
    }

    #[test]
    fn test_lazy_creation_up_to_capacity() {
        let (pool, created, _) = counting_pool(2);
        assert_eq!(created.load(Ordering::SeqCst), 0);

        assert_eq!(pool.pop(Duration::ZERO, ()), Some(1));
        assert_eq!(pool.pop(Duration::ZERO, ()), Some(2));
        assert_eq!(pool.pop(Duration::ZERO, ()), None);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn test_lifo_reuse() {
        let (pool, created, _) = counting_pool(2);
        let a = pool.pop(Duration::ZERO, ()).unwrap();
        let b = pool.pop(Duration::ZERO, ()).unwrap();

        pool.push(a);
        pool.push(b);

        assert_eq!(pool.pop(Duration::ZERO, ()), Some(b));
        assert_eq!(pool.pop(Duration::ZERO, ()), Some(a));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_is_empty() {
        let (pool, _, _) = counting_pool(1);
        assert!(!pool.is_empty());

        let a = pool.pop(Duration::ZERO, ()).unwrap();
        assert!(pool.is_empty());

        pool.push(a);
        assert!(!pool.is_empty());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_destruction_balance() {
        let (pool, created, destroyed) = counting_pool(2);
        let a = pool.pop(Duration::ZERO, ()).unwrap();
        let b = pool.pop(Duration::ZERO, ()).unwrap();

        pool.push(a);
        pool.push(b);
        // Ketiga melebihi kapasitas free list
        pool.push(99);

        assert_eq!(pool.idle(), 2);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        drop(pool);
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_destructor_keeps_everything() {
        let pool: ResourcePool<u32> = ResourcePool::new(|()| 7, None, 1);
        let a = pool.pop(Duration::ZERO, ()).unwrap();
        pool.push(a);
        pool.push(8);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_blocking_pop_receives_pushed_instance() {
        let (pool, _, _) = counting_pool(1);
        let pool = Arc::new(pool);
        let held = pool.pop(Duration::ZERO, ()).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let start = Instant::now();
                (pool.pop(Duration::from_millis(500), ()), start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(50));
        pool.push(held);

        let (got, waited) = waiter.join().unwrap();
        assert_eq!(got, Some(held));
        assert!(waited < Duration::from_millis(500));
    }

    #[test]
    fn test_blocking_pop_times_out() {
        let (pool, _, _) = counting_pool(1);
        let _held = pool.pop(Duration::ZERO, ()).unwrap();

        let start = Instant::now();
        assert_eq!(pool.pop(Duration::from_millis(100), ()), None);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_discard_frees_loan_slot() {
        let (pool, created, destroyed) = counting_pool(1);
        let a = pool.pop(Duration::ZERO, ()).unwrap();
        assert!(pool.is_empty());

        pool.discard(a);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle(), 0);

        assert_eq!(pool.pop(Duration::ZERO, ()), Some(2));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clear_destroys_idle_only() {
        let (pool, _, destroyed) = counting_pool(3);
        let a = pool.pop(Duration::ZERO, ()).unwrap();
        let b = pool.pop(Duration::ZERO, ()).unwrap();
        let _c = pool.pop(Duration::ZERO, ()).unwrap();
        pool.push(a);
        pool.push(b);

        pool.clear();
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_factory_panic_releases_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = {
            let calls = calls.clone();
            ResourcePool::new(
                move |()| {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("factory failed");
                    }
                    5u32
                },
                None,
                1,
            )
        };

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.pop(Duration::ZERO, ())
        }));
        assert!(outcome.is_err());
        assert_eq!(pool.outstanding(), 0);
        assert!(!pool.is_empty());

        // Lock tidak poisoned dan slot bisa dipakai lagi
        assert_eq!(pool.pop(Duration::ZERO, ()), Some(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_factory_panic_on_other_thread_frees_slot() {
        let pool = Arc::new(ResourcePool::new(
            |fail: bool| {
                if fail {
                    panic!("factory failed");
                }
                1u32
            },
            None,
            1,
        ));

        // Thread pertama memegang slot lewat factory yang akhirnya panic
        let failing = {
            let pool = pool.clone();
            thread::spawn(move || pool.pop(Duration::ZERO, true))
        };
        assert!(failing.join().is_err());

        let start = Instant::now();
        assert_eq!(pool.pop(Duration::from_millis(500), false), Some(1));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_capacity_never_exceeded_under_contention() {
        const CAPACITY: usize = 4;
        let (pool, created, _) = counting_pool(CAPACITY);
        let pool = Arc::new(pool);
        let on_loan = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let on_loan = on_loan.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        if let Some(item) = pool.pop(Duration::from_millis(20), ()) {
                            let now = on_loan.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            thread::yield_now();
                            on_loan.fetch_sub(1, Ordering::SeqCst);
                            pool.push(item);
                        }
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert!(created.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(pool.outstanding(), 0);
    }
}
