//! Hierarchical memory quotas and the endpoint allocator bridge.
//!
//! A [`MemoryQuota`] is a named accounting pool; quotas can be chained so a
//! child charge also counts against its parent. A [`MemoryAllocator`] is the
//! capability endpoints use for every read/write buffer allocation, letting
//! the quota observe a channel's footprint and push back by refusing
//! allocations. Quotas never own sockets or buffers; they are pure policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{EngineError, Result};
use crate::slice::Slice;

/// A named, hierarchical memory accounting pool.
pub struct MemoryQuota {
    name: String,
    capacity: usize,
    used: AtomicUsize,
    parent: Option<Arc<MemoryQuota>>,
}

impl MemoryQuota {
    /// Creates a root quota with the given byte capacity.
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        Arc::new(MemoryQuota {
            name: name.into(),
            capacity,
            used: AtomicUsize::new(0),
            parent: None,
        })
    }

    /// Creates a child quota; charges against it also charge `parent`.
    pub fn with_parent(
        name: impl Into<String>,
        capacity: usize,
        parent: Arc<MemoryQuota>,
    ) -> Arc<Self> {
        Arc::new(MemoryQuota {
            name: name.into(),
            capacity,
            used: AtomicUsize::new(0),
            parent: Some(parent),
        })
    }

    /// Creates a quota that never refuses.
    pub fn unlimited(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, usize::MAX)
    }

    /// Quota name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total byte capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently charged.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Bytes still available before refusal.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used())
    }

    /// Charges `n` bytes against this quota and its ancestors.
    pub fn try_charge(&self, n: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(n) {
                Some(next) if next <= self.capacity => next,
                _ => {
                    return Err(EngineError::ResourceExhausted(format!(
                        "quota {} refused {} bytes ({} of {} in use)",
                        self.name,
                        n,
                        current,
                        self.capacity
                    )))
                }
            };
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if let Some(parent) = &self.parent {
            if let Err(err) = parent.try_charge(n) {
                self.used.fetch_sub(n, Ordering::Relaxed);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Returns `n` bytes to this quota and its ancestors.
    pub fn release(&self, n: usize) {
        self.used.fetch_sub(n, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.release(n);
        }
    }
}

impl std::fmt::Debug for MemoryQuota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQuota")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}

/// A live charge against a quota, released exactly once on drop.
pub struct QuotaReservation {
    quota: Arc<MemoryQuota>,
    outstanding: Arc<AtomicUsize>,
    bytes: usize,
}

impl QuotaReservation {
    /// Size of the reservation in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        self.quota.release(self.bytes);
        self.outstanding.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

/// Capability for quota-accounted buffer allocation.
///
/// Cloneable; clones share the same outstanding-bytes counter so the
/// per-endpoint footprint stays visible wherever the allocator travels.
#[derive(Clone)]
pub struct MemoryAllocator {
    quota: Arc<MemoryQuota>,
    label: Arc<str>,
    outstanding: Arc<AtomicUsize>,
}

impl MemoryAllocator {
    /// Creates an allocator charging `quota`, labelled for logs.
    pub fn new(quota: Arc<MemoryQuota>, label: impl Into<String>) -> Self {
        MemoryAllocator {
            quota,
            label: label.into().into(),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocates a writable buffer of exactly `n` bytes capacity.
    ///
    /// Fails with `ResourceExhausted` when the quota refuses the charge.
    pub fn allocate(&self, n: usize) -> Result<QuotaBuffer> {
        self.quota.try_charge(n)?;
        self.outstanding.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(allocator = %self.label, bytes = n, "allocated");
        Ok(QuotaBuffer {
            buf: BytesMut::with_capacity(n),
            reservation: QuotaReservation {
                quota: Arc::clone(&self.quota),
                outstanding: Arc::clone(&self.outstanding),
                bytes: n,
            },
        })
    }

    /// Bytes currently reserved through this allocator (all clones).
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Debug label, normally the peer address.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The quota this allocator charges.
    pub fn quota(&self) -> &Arc<MemoryQuota> {
        &self.quota
    }
}

impl std::fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("label", &self.label)
            .field("quota", &self.quota.name())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Creates one allocator per accepted endpoint, all against one quota.
#[derive(Clone, Debug)]
pub struct MemoryAllocatorFactory {
    quota: Arc<MemoryQuota>,
}

impl MemoryAllocatorFactory {
    /// Builds a factory over `quota`.
    pub fn new(quota: Arc<MemoryQuota>) -> Self {
        MemoryAllocatorFactory { quota }
    }

    /// Creates an allocator labelled with `label` (typically the peer).
    pub fn create_allocator(&self, label: impl Into<String>) -> MemoryAllocator {
        MemoryAllocator::new(Arc::clone(&self.quota), label)
    }
}

/// A quota-backed writable buffer.
///
/// Freeze it into a [`Slice`] once filled; the reservation rides along and is
/// released when the last clone of the slice drops.
pub struct QuotaBuffer {
    buf: BytesMut,
    reservation: QuotaReservation,
}

impl QuotaBuffer {
    /// Mutable access to the underlying bytes.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reserved capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.reservation.bytes()
    }

    /// Converts the written portion into an immutable, reservation-carrying
    /// slice.
    pub fn freeze(self) -> Slice {
        Slice::with_reservation(self.buf.freeze(), Arc::new(self.reservation))
    }
}

impl std::fmt::Debug for QuotaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "QuotaBuffer({} of {} bytes)",
            self.len(),
            self.capacity()
        )
    }
}
