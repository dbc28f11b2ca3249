//! Transfer slot pool.
//!
//! A fixed set of bulk-transfer buffers shared between the frame loop,
//! which fills and submits them, and the transport's completion context,
//! which hands them back. Admission is a counting semaphore with one
//! permit per free slot; the free list itself sits behind a plain mutex
//! that is only held for the push or pop, never across a wait.
//!
//! ```text
//!   acquire ──► SlotLease ──► submit ──► transport ──► complete
//!      ▲                                                  │
//!      └──────────────── free list + permit ◄─────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::error::{DlfbError, TransportError};

// ── Constants ────────────────────────────────────────────────────

/// Transfers kept in flight per device.
pub const WRITES_IN_FLIGHT: usize = 4;
/// Default slot size: 16 pages less one bulk packet.
pub const MAX_TRANSFER: usize = 16 * 4096 - 512;
/// Allocation fallback stops halving here.
pub const MIN_SLOT_SIZE: usize = 4096;

// ── BulkTransport ────────────────────────────────────────────────

/// The host side of the device's bulk OUT endpoint.
///
/// `submit` must not block. Once it returns `Ok` the transport owns the
/// lease and must complete it exactly once, from any thread or task, when
/// the transfer finishes. Dropping a lease completes it as well.
pub trait BulkTransport: Send + Sync {
    fn submit(&self, lease: SlotLease) -> Result<(), Rejected>;
}

/// A submission the transport refused; the lease comes back to the caller.
#[derive(Debug)]
pub struct Rejected {
    pub lease: SlotLease,
    pub reason: TransportError,
}

// ── SlotBuffer ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SlotBuffer {
    id: usize,
    data: Vec<u8>,
    /// Declared transfer length; full size while on the free list.
    len: usize,
}

// ── PoolShared ───────────────────────────────────────────────────

#[derive(Debug)]
struct PoolShared {
    free: Mutex<VecDeque<SlotBuffer>>,
    limit: Semaphore,
    capacity: usize,
    slot_size: usize,
    lost_pixels: AtomicBool,
}

impl PoolShared {
    fn free_list(&self) -> MutexGuard<'_, VecDeque<SlotBuffer>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn recycle(&self, mut slot: SlotBuffer, status: Result<(), TransportError>) {
        if let Err(reason) = status {
            warn!(slot = slot.id, "transfer failed: {reason}");
            self.lost_pixels.store(true, Ordering::SeqCst);
        }
        slot.len = self.slot_size;

        self.free_list().push_back(slot);
        self.limit.add_permits(1);
    }
}

// ── SlotLease ────────────────────────────────────────────────────

/// Exclusive hold on one slot, either by the frame loop or by an
/// in-flight transfer.
#[derive(Debug)]
pub struct SlotLease {
    slot: SlotBuffer,
    returned: bool,
    shared: Arc<PoolShared>,
}

impl SlotLease {
    /// Index of the slot within its pool.
    pub fn id(&self) -> usize {
        self.slot.id
    }

    /// Size of the slot buffer.
    pub fn capacity(&self) -> usize {
        self.slot.data.len()
    }

    /// Declared payload length.
    pub fn len(&self) -> usize {
        self.slot.len
    }

    pub fn is_empty(&self) -> bool {
        self.slot.len == 0
    }

    /// The bytes to put on the wire.
    pub fn payload(&self) -> &[u8] {
        &self.slot.data[..self.slot.len]
    }

    /// The whole buffer, for filling.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.slot.data
    }

    fn set_len(&mut self, len: usize) {
        self.slot.len = len.min(self.slot.data.len());
    }

    fn give_back(&mut self, status: Result<(), TransportError>) {
        if !self.returned {
            self.returned = true;
            self.shared.recycle(std::mem::take(&mut self.slot), status);
        }
    }

    /// Hand the slot back to its pool.
    ///
    /// An error status marks the session as having lost pixels.
    pub fn complete(mut self, status: Result<(), TransportError>) {
        self.give_back(status);
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.give_back(Ok(()));
    }
}

// ── SlotPool ─────────────────────────────────────────────────────

/// Fixed-size pool of transfer slots with counting admission.
#[derive(Debug, Clone)]
pub struct SlotPool {
    shared: Arc<PoolShared>,
}

impl SlotPool {
    /// Allocate `count` slots of `size` bytes in one batch.
    ///
    /// If the allocation fails the slot size is halved and the whole batch
    /// retried, down to [`MIN_SLOT_SIZE`]. Nothing is kept from a failed
    /// attempt.
    pub fn new(count: usize, size: usize) -> Result<Self, DlfbError> {
        if count == 0 || size < MIN_SLOT_SIZE {
            return Err(DlfbError::Config(format!(
                "slot pool needs at least one slot of {MIN_SLOT_SIZE} bytes (got {count} x {size})"
            )));
        }

        let mut size = size;
        let free = loop {
            match Self::alloc_slots(count, size) {
                Ok(free) => break free,
                Err(bytes) if size / 2 >= MIN_SLOT_SIZE => {
                    warn!("slot allocation of {bytes} bytes failed; retrying at {}", size / 2);
                    size /= 2;
                }
                Err(bytes) => return Err(DlfbError::Allocation { bytes }),
            }
        };

        debug!(count, size, "transfer slots allocated");

        Ok(Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                limit: Semaphore::new(count),
                capacity: count,
                slot_size: size,
                lost_pixels: AtomicBool::new(false),
            }),
        })
    }

    fn alloc_slots(count: usize, size: usize) -> Result<VecDeque<SlotBuffer>, usize> {
        let mut free = VecDeque::new();
        free.try_reserve_exact(count)
            .map_err(|_| count * std::mem::size_of::<SlotBuffer>())?;

        for id in 0..count {
            let mut data = Vec::new();
            data.try_reserve_exact(size).map_err(|_| size)?;
            data.resize(size, 0);
            free.push_back(SlotBuffer { id, data, len: size });
        }
        Ok(free)
    }

    /// Wait up to `timeout` for a free slot.
    ///
    /// A timeout or a closed pool marks pixels as lost.
    pub async fn acquire(&self, timeout: Duration) -> Result<SlotLease, DlfbError> {
        let permit = match tokio::time::timeout(timeout, self.shared.limit.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.shared.lost_pixels.store(true, Ordering::SeqCst);
                return Err(DlfbError::PoolClosed);
            }
            Err(_) => {
                self.shared.lost_pixels.store(true, Ordering::SeqCst);
                warn!(
                    available = self.available(),
                    "wait for transfer slot timed out after {timeout:?}"
                );
                return Err(DlfbError::SlotTimeout(timeout));
            }
        };
        // the slot now belongs to the lease; `recycle` returns the unit
        permit.forget();

        let slot = self.shared.free_list().pop_front();
        match slot {
            Some(slot) => Ok(SlotLease {
                slot,
                returned: false,
                shared: Arc::clone(&self.shared),
            }),
            None => {
                // permits and free list disagree; give the unit back
                error!("admission granted with an empty free list");
                self.shared.limit.add_permits(1);
                self.shared.lost_pixels.store(true, Ordering::SeqCst);
                Err(DlfbError::PoolClosed)
            }
        }
    }

    /// Submit `len` bytes of the lease to `transport`.
    ///
    /// A rejected transfer is completed on the spot and marks pixels lost.
    pub fn submit(
        &self,
        mut lease: SlotLease,
        len: usize,
        transport: &dyn BulkTransport,
    ) -> Result<(), DlfbError> {
        debug_assert!(len <= lease.capacity());
        lease.set_len(len);

        match transport.submit(lease) {
            Ok(()) => Ok(()),
            Err(Rejected { lease, reason }) => {
                error!(slot = lease.id(), "submit failed: {reason}");
                lease.complete(Err(reason.clone()));
                self.shared.lost_pixels.store(true, Ordering::SeqCst);
                Err(reason.into())
            }
        }
    }

    /// Wait for every slot to come home, then close the pool and free the
    /// buffers. Later acquires fail with [`DlfbError::PoolClosed`].
    pub async fn drain(&self, timeout: Duration) -> Result<(), DlfbError> {
        let all = self.shared.capacity as u32;
        match tokio::time::timeout(timeout, self.shared.limit.acquire_many(all)).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.shared.limit.close();
                self.shared.free_list().clear();
                debug!("transfer slots drained");
                Ok(())
            }
            Ok(Err(_)) => Err(DlfbError::PoolClosed),
            Err(_) => Err(DlfbError::SlotTimeout(timeout)),
        }
    }

    /// Number of slots in the pool.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Size of each slot in bytes (after any allocation fallback).
    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    /// Slots currently on the free list.
    pub fn available(&self) -> usize {
        self.shared.free_list().len()
    }

    /// Slots held by the frame loop or in flight.
    pub fn outstanding(&self) -> usize {
        self.shared.capacity - self.available()
    }

    /// Whether any transfer was lost since the flag was last taken.
    pub fn lost_pixels(&self) -> bool {
        self.shared.lost_pixels.load(Ordering::SeqCst)
    }

    /// Read and clear the lost-pixels flag.
    pub fn take_lost_pixels(&self) -> bool {
        self.shared.lost_pixels.swap(false, Ordering::SeqCst)
    }

    /// Raise the lost-pixels flag from outside the pool.
    pub fn mark_lost_pixels(&self) {
        self.shared.lost_pixels.store(true, Ordering::SeqCst);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_millis(20);

    struct RejectAll;

    impl BulkTransport for RejectAll {
        fn submit(&self, lease: SlotLease) -> Result<(), Rejected> {
            Err(Rejected {
                lease,
                reason: TransportError::Stall,
            })
        }
    }

    /// Completes every transfer on a separate task after a short delay.
    #[derive(Clone, Default)]
    struct Deferred {
        done: Arc<AtomicUsize>,
        /// Leases acquired and not yet completed.
        live: Arc<AtomicUsize>,
    }

    impl BulkTransport for Deferred {
        fn submit(&self, lease: SlotLease) -> Result<(), Rejected> {
            let done = Arc::clone(&self.done);
            let live = Arc::clone(&self.live);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis((lease.id() as u64 % 3) + 1)).await;
                // tests that don't count leases leave this at zero
                let _ = live.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                lease.complete(Ok(()));
                done.fetch_add(1, Ordering::SeqCst);
            });
            Ok(())
        }
    }

    #[test]
    fn rejects_empty_pool() {
        assert!(matches!(SlotPool::new(0, MAX_TRANSFER), Err(DlfbError::Config(_))));
        assert!(matches!(SlotPool::new(4, 100), Err(DlfbError::Config(_))));
    }

    #[tokio::test]
    async fn acquire_until_exhausted_then_time_out() {
        let pool = SlotPool::new(2, MIN_SLOT_SIZE).unwrap();
        let a = pool.acquire(WAIT).await.unwrap();
        let b = pool.acquire(WAIT).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.available(), 0);
        assert!(!pool.lost_pixels());

        let err = pool.acquire(WAIT).await.unwrap_err();
        assert!(matches!(err, DlfbError::SlotTimeout(_)));
        assert!(pool.take_lost_pixels());
        assert!(!pool.lost_pixels());

        a.complete(Ok(()));
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn completion_resets_length() {
        let pool = SlotPool::new(1, MIN_SLOT_SIZE).unwrap();
        let lease = pool.acquire(WAIT).await.unwrap();
        let transport = Deferred::default();
        pool.submit(lease, 10, &transport).unwrap();

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease.len(), MIN_SLOT_SIZE);
        assert!(!pool.lost_pixels());
    }

    #[tokio::test]
    async fn rejected_submit_returns_slot_and_loses_pixels() {
        let pool = SlotPool::new(1, MIN_SLOT_SIZE).unwrap();
        let lease = pool.acquire(WAIT).await.unwrap();
        let err = pool.submit(lease, 64, &RejectAll).unwrap_err();
        assert!(matches!(err, DlfbError::Transport(TransportError::Stall)));
        assert_eq!(pool.available(), 1);
        assert!(pool.lost_pixels());
    }

    #[tokio::test]
    async fn failed_completion_loses_pixels() {
        let pool = SlotPool::new(1, MIN_SLOT_SIZE).unwrap();
        let lease = pool.acquire(WAIT).await.unwrap();
        lease.complete(Err(TransportError::Disconnected));
        assert!(pool.lost_pixels());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn live_leases_never_exceed_capacity() {
        let pool = SlotPool::new(WRITES_IN_FLIGHT, MIN_SLOT_SIZE).unwrap();
        let transport = Deferred::default();
        let peak = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let pool = pool.clone();
                let transport = transport.clone();
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    for i in 0..50 {
                        let lease = pool.acquire(Duration::from_secs(2)).await.unwrap();
                        let now = transport.live.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        pool.submit(lease, (p * 50 + i) % 50 + 1, &transport).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        pool.drain(Duration::from_secs(2)).await.unwrap();
        assert_eq!(transport.done.load(Ordering::SeqCst), 200);
        assert_eq!(transport.live.load(Ordering::SeqCst), 0);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= WRITES_IN_FLIGHT, "peak {peak}");
        assert!(!pool.lost_pixels());
    }

    #[tokio::test]
    async fn all_slots_return_after_completion() {
        let pool = SlotPool::new(3, MIN_SLOT_SIZE).unwrap();
        let transport = Deferred::default();
        for _ in 0..3 {
            let lease = pool.acquire(WAIT).await.unwrap();
            pool.submit(lease, 1, &transport).unwrap();
        }
        for _ in 0..100 {
            if pool.available() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(pool.available(), pool.capacity());
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_then_closes() {
        let pool = SlotPool::new(2, MIN_SLOT_SIZE).unwrap();
        let held = pool.acquire(WAIT).await.unwrap();

        assert!(matches!(pool.drain(WAIT).await, Err(DlfbError::SlotTimeout(_))));

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            held.complete(Ok(()));
        });
        pool.drain(Duration::from_secs(1)).await.unwrap();
        releaser.await.unwrap();

        assert!(matches!(pool.acquire(WAIT).await, Err(DlfbError::PoolClosed)));
    }
}
