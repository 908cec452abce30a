//! Lock-free single-producer/single-consumer byte ring
//!
//! Every boundary in the mux (interrupt to worker, caller to worker, worker
//! to caller) goes through one of these. `put` never blocks and never
//! allocates, so it is usable from interrupt context. The consumer can either
//! copy bytes out with [`RingBuffer::get`] or borrow the contiguous readable
//! span with [`RingBuffer::claim`] and advance the read cursor afterwards.
//!
//! The producer and consumer roles are each held by at most one caller at a
//! time. A second concurrent producer (or consumer) is refused and moves zero
//! bytes instead of racing the first one.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Fixed-capacity byte FIFO
pub struct RingBuffer {
    storage: Box<[UnsafeCell<u8>]>,
    /// Write cursor, kept in `0..2 * capacity` so full and empty differ
    head: AtomicUsize,
    /// Read cursor, same range as `head`
    tail: AtomicUsize,
    producer: AtomicBool,
    consumer: AtomicBool,
}

// SAFETY: bytes are written only by the producer-role holder and only in the
// free region; they are read only by the consumer-role holder and only in the
// used region published through a release store of `head`.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring holding at most `capacity` bytes
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be > 0");
        Self {
            storage: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            producer: AtomicBool::new(false),
            consumer: AtomicBool::new(false),
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of bytes waiting to be read
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        self.used(head, tail)
    }

    /// Whether there is nothing to read
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes `put` would accept right now
    pub fn space_available(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Append as much of `data` as fits, returning the accepted count
    ///
    /// Never blocks. Bytes that do not fit are not stored; the caller decides
    /// whether to report the loss.
    pub fn put(&self, data: &[u8]) -> usize {
        self.try_put(data).unwrap_or(0)
    }

    /// Like [`put`](Self::put), but `None` when another producer holds the
    /// role, so a refusal is not mistaken for a full ring
    pub fn try_put(&self, data: &[u8]) -> Option<usize> {
        let _role = Role::acquire(&self.producer)?;
        if data.is_empty() {
            return Some(0);
        }

        let cap = self.capacity();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let n = data.len().min(cap - self.used(head, tail));
        if n == 0 {
            return Some(0);
        }

        let start = head % cap;
        let first = n.min(cap - start);
        // SAFETY: `start..start + first` and `0..n - first` are inside the
        // free region, which the consumer never touches, and inside storage.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(start), first);
            ptr::copy_nonoverlapping(data.as_ptr().add(first), self.base(), n - first);
        }

        self.head.store(self.advance(head, n), Ordering::Release);
        Some(n)
    }

    /// Borrow the contiguous readable span without copying
    ///
    /// The span ends at the physical end of storage, so a wrapped ring needs
    /// two claims to drain. Nothing is consumed until [`Claim::release`].
    /// While another consumer holds the role the claim is empty.
    pub fn claim(&self) -> Claim<'_> {
        let Some(role) = Role::acquire(&self.consumer) else {
            return Claim {
                ring: self,
                data: &[],
                _role: None,
            };
        };

        let cap = self.capacity();
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let start = tail % cap;
        let len = self.used(head, tail).min(cap - start);
        // SAFETY: the used region is published by the producer's release
        // store of `head` and is not rewritten until `tail` moves past it,
        // which only the role holder (this claim) can do.
        let data = unsafe { slice::from_raw_parts(self.base().add(start).cast_const(), len) };

        Claim {
            ring: self,
            data,
            _role: Some(role),
        }
    }

    /// Copy up to `out.len()` bytes out of the ring
    pub fn get(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let Some(_role) = Role::acquire(&self.consumer) else {
            return 0;
        };

        let cap = self.capacity();
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let n = out.len().min(self.used(head, tail));
        if n == 0 {
            return 0;
        }

        let start = tail % cap;
        let first = n.min(cap - start);
        // SAFETY: both source ranges are inside the published used region.
        unsafe {
            ptr::copy_nonoverlapping(self.base().add(start), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.base(), out.as_mut_ptr().add(first), n - first);
        }

        self.tail.store(self.advance(tail, n), Ordering::Release);
        n
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    fn used(&self, head: usize, tail: usize) -> usize {
        let wrap = 2 * self.capacity();
        (head + wrap - tail) % wrap
    }

    fn advance(&self, cursor: usize, by: usize) -> usize {
        (cursor + by) % (2 * self.capacity())
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// Borrowed readable span of a [`RingBuffer`]
///
/// Holds the consumer role until released or dropped. Dropping without
/// calling [`Claim::release`] consumes nothing.
pub struct Claim<'a> {
    ring: &'a RingBuffer,
    data: &'a [u8],
    _role: Option<Role<'a>>,
}

impl Claim<'_> {
    /// Consume the first `len` bytes of the claimed span
    ///
    /// `len` is clamped to the claimed length.
    pub fn release(self, len: usize) {
        let n = len.min(self.data.len());
        if n > 0 {
            let tail = self.ring.tail.load(Ordering::Relaxed);
            self.ring
                .tail
                .store(self.ring.advance(tail, n), Ordering::Release);
        }
    }

    /// Consume the whole claimed span
    pub fn release_all(self) {
        let n = self.data.len();
        self.release(n);
    }
}

impl Deref for Claim<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl fmt::Debug for Claim<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim").field("len", &self.data.len()).finish()
    }
}

/// Exclusive producer or consumer role on a ring
struct Role<'a>(&'a AtomicBool);

impl<'a> Role<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Role(flag))
    }
}

impl Drop for Role<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
