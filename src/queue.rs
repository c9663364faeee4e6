//! Byte-queue contract for streamed endpoint I/O
//!
//! Streamed transfers source from, and sink into, circular byte queues
//! owned by the surrounding kernel. The driver never owns a queue; it moves
//! bytes in word-sized bursts and therefore needs direct access to the
//! contiguous span between a cursor and the ring's physical end. The
//! counter-and-wake bookkeeping stays on the queue side, under whatever
//! locking discipline the queue already uses for its blocked tasks.
//!
//! Cursor ownership is split while a transfer is active: the driver is the
//! only mover of the transmit queue's read cursor and the receive queue's
//! write cursor. The opposite cursors remain with the producer and consumer
//! tasks.

/// Read side of a circular byte queue feeding an IN endpoint.
///
/// # Safety
///
/// Implementations must wrap the read cursor eagerly: a grant always starts
/// inside the ring storage, and a grant is only empty when the queue holds
/// no data. While a transfer is active, the granted span must not be
/// written by anyone else, and `release` must only ever be called with a
/// length no larger than the last grant.
pub unsafe trait TransmitQueue: Sync {
    /// Contiguous readable bytes from the read cursor to the ring's
    /// physical end.
    fn read_grant(&self) -> &[u8];

    /// Advances the read cursor by `n` bytes, wrapping to the ring start
    /// when the physical end is reached.
    fn release(&self, n: usize);

    /// Credits `n` consumed bytes and wakes every task blocked waiting for
    /// queue space. Called once per completed bulk move, zero-length moves
    /// included.
    fn notify(&self, n: usize);
}

/// Write side of a circular byte queue fed by an OUT endpoint.
///
/// # Safety
///
/// Same rules as [`TransmitQueue`], for the write cursor: grants start
/// inside the ring, wrap eagerly, and are exclusive to the driver while a
/// transfer is active. A grant is only empty when the queue is full.
pub unsafe trait ReceiveQueue: Sync {
    /// Contiguous writable bytes from the write cursor to the ring's
    /// physical end.
    fn write_grant(&self) -> &mut [u8];

    /// Advances the write cursor by `n` bytes, wrapping to the ring start
    /// when the physical end is reached.
    fn commit(&self, n: usize);

    /// Credits `n` produced bytes and wakes every task blocked waiting for
    /// data. Called once per completed bulk move, zero-length moves
    /// included.
    fn notify(&self, n: usize);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{ReceiveQueue, TransmitQueue};
    use core::cell::{Cell, UnsafeCell};
    use std::vec;
    use std::vec::Vec;

    /// Ring double implementing both queue contracts over the same
    /// storage, with counters exposed for assertions.
    pub struct TestRing {
        storage: UnsafeCell<Vec<u8>>,
        rd: Cell<usize>,
        wr: Cell<usize>,
        pub counter: Cell<usize>,
        pub notifies: Cell<usize>,
    }

    // Safety: tests are single-threaded per ring.
    unsafe impl Sync for TestRing {}

    impl TestRing {
        pub fn new(capacity: usize) -> Self {
            TestRing {
                storage: UnsafeCell::new(vec![0; capacity]),
                rd: Cell::new(0),
                wr: Cell::new(0),
                counter: Cell::new(0),
                notifies: Cell::new(0),
            }
        }

        pub fn with_cursors(capacity: usize, rd: usize, wr: usize) -> Self {
            let ring = Self::new(capacity);
            ring.rd.set(rd);
            ring.wr.set(wr);
            ring
        }

        fn capacity(&self) -> usize {
            unsafe { &*self.storage.get() }.len()
        }

        pub fn rd(&self) -> usize {
            self.rd.get()
        }

        pub fn wr(&self) -> usize {
            self.wr.get()
        }

        /// Lays `bytes` into the ring starting at the read cursor, wrapping
        /// at the physical end, as if a producer had queued them.
        pub fn seed(&self, bytes: &[u8]) {
            let capacity = self.capacity();
            let storage = unsafe { &mut *self.storage.get() };
            for (i, b) in bytes.iter().enumerate() {
                storage[(self.rd.get() + i) % capacity] = *b;
            }
        }

        /// Reads `n` bytes starting at `from`, wrapping at the physical
        /// end.
        pub fn contents(&self, from: usize, n: usize) -> Vec<u8> {
            let capacity = self.capacity();
            let storage = unsafe { &*self.storage.get() };
            (0..n).map(|i| storage[(from + i) % capacity]).collect()
        }

        fn advance(cursor: &Cell<usize>, n: usize, capacity: usize) {
            let mut next = cursor.get() + n;
            if next >= capacity {
                next -= capacity;
            }
            cursor.set(next);
        }
    }

    unsafe impl TransmitQueue for TestRing {
        fn read_grant(&self) -> &[u8] {
            let storage = unsafe { &*self.storage.get() };
            &storage[self.rd.get()..]
        }
        fn release(&self, n: usize) {
            Self::advance(&self.rd, n, self.capacity());
        }
        fn notify(&self, n: usize) {
            self.counter.set(self.counter.get() + n);
            self.notifies.set(self.notifies.get() + 1);
        }
    }

    unsafe impl ReceiveQueue for TestRing {
        fn write_grant(&self) -> &mut [u8] {
            let storage = unsafe { &mut *self.storage.get() };
            &mut storage[self.wr.get()..]
        }
        fn commit(&self, n: usize) {
            Self::advance(&self.wr, n, self.capacity());
        }
        fn notify(&self, n: usize) {
            self.counter.set(self.counter.get() + n);
            self.notifies.set(self.notifies.get() + 1);
        }
    }
}
