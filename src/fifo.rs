//! Shared FIFO RAM: the region allocator and word-granular packet movement
//!
//! The OTG core exposes one data FIFO window per endpoint; every access is
//! a 32-bit, LSB-first word, and a packet is always drained or filled as a
//! whole number of words. The routines here are the only code that touches
//! a FIFO window.

use crate::queue::{ReceiveQueue, TransmitQueue};

/// Bump allocator over the shared FIFO RAM, in words.
///
/// The receive FIFO occupies the bottom of the RAM; transmit regions are
/// handed out above it, in configuration order, and only ever reclaimed all
/// at once by [`reset`](FifoAllocator::reset). Allocation happens during
/// endpoint configuration with the device stopped or between activation
/// sections, so running out of room is a configuration fault, not a
/// run-time condition.
pub(crate) struct FifoAllocator {
    next: u32,
    base: u32,
    depth: u32,
}

impl FifoAllocator {
    pub const fn new(rx_words: u32, depth_words: u32) -> Self {
        FifoAllocator {
            next: rx_words,
            base: rx_words,
            depth: depth_words,
        }
    }

    /// Returns the allocation cursor to the word following the receive
    /// FIFO.
    pub fn reset(&mut self) {
        self.next = self.base;
    }

    /// Hands out a `words`-sized region, returning its start address.
    ///
    /// # Panics
    ///
    /// Panics when the region would extend past the FIFO RAM; the endpoint
    /// size table is wrong and the device must not come up.
    pub fn allocate(&mut self, words: u32) -> u32 {
        let next = self.next;
        self.next += words;
        assert!(self.next <= self.depth, "FIFO memory overflow");
        next
    }

    pub fn next_free(&self) -> u32 {
        self.next
    }
}

/// Single-word access to one endpoint's FIFO window.
pub(crate) trait WordIo {
    fn push(&self, word: u32);
    fn pop(&self) -> u32;
}

/// A hardware FIFO window: one 32-bit register aliased over its page.
pub(crate) struct Fifo {
    window: *mut u32,
}

impl Fifo {
    /// # Safety
    ///
    /// `window` must be the FIFO window of an endpoint owned by the caller.
    pub unsafe fn new(window: *mut u32) -> Self {
        Fifo {
            window,
        }
    }
}

impl WordIo for Fifo {
    fn push(&self, word: u32) {
        // Safety: window address vouched for at construction.
        unsafe { self.window.write_volatile(word) }
    }
    fn pop(&self) -> u32 {
        unsafe { self.window.read_volatile() }
    }
}

fn word_of(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Pushes `buf` into a TX FIFO, one word at a time. A partial trailing word
/// is zero-padded; the core only transmits the bytes counted by the
/// transfer size register.
pub(crate) fn write_from_buffer(fifo: &impl WordIo, buf: &[u8]) {
    let mut chunks = buf.chunks_exact(4);
    for chunk in chunks.by_ref() {
        fifo.push(word_of(chunk));
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut word = [0; 4];
        word[..tail.len()].copy_from_slice(tail);
        fifo.push(u32::from_le_bytes(word));
    }
}

/// Pushes `n` bytes from a circular queue into a TX FIFO.
///
/// Whole words are pushed in contiguous bursts bounded by the ring's
/// physical end; a word straddling the wrap boundary, and any final partial
/// word, is assembled one byte at a time. The queue's consumed-byte counter
/// and the producer wake-up are settled once, after the whole move.
pub(crate) fn write_from_queue(fifo: &impl WordIo, queue: &dyn TransmitQueue, n: usize) {
    let mut ntogo = n;
    while ntogo > 0 {
        if ntogo / 4 > 0 {
            let run = queue.read_grant();
            let streak = (ntogo / 4).min(run.len() / 4);
            if streak > 0 {
                for chunk in run[..streak * 4].chunks_exact(4) {
                    fifo.push(word_of(chunk));
                }
                queue.release(streak * 4);
                ntogo -= streak * 4;
                continue;
            }
        }

        // A word lying across the ring boundary, or fewer than four bytes
        // remaining.
        let mut word = 0;
        let mut i = 0;
        while ntogo > 0 && i < 4 {
            word |= u32::from(queue.read_grant()[0]) << (i * 8);
            queue.release(1);
            ntogo -= 1;
            i += 1;
        }
        fifo.push(word);
    }
    queue.notify(n);
}

/// Drains `n` bytes from the RX FIFO, copying at most `buf.len()` of them
/// and discarding the rest. The FIFO must always be emptied of the whole
/// word-rounded packet, even when the destination cannot hold it.
pub(crate) fn read_to_buffer(fifo: &impl WordIo, buf: &mut [u8], n: usize) {
    let mut offset = 0;
    for _ in 0..(n + 3) / 4 {
        let word = fifo.pop().to_le_bytes();
        if offset < buf.len() {
            let take = (buf.len() - offset).min(4);
            buf[offset..offset + take].copy_from_slice(&word[..take]);
            offset += take;
        }
    }
}

/// Drains `n` bytes from the RX FIFO into a circular queue.
///
/// The mirror of [`write_from_queue`]: word bursts bounded by the span to
/// the ring's physical end, byte-at-a-time across the wrap boundary and for
/// the packet tail, one counter-and-wake settlement at the end.
pub(crate) fn read_to_queue(fifo: &impl WordIo, queue: &dyn ReceiveQueue, n: usize) {
    let mut ntogo = n;
    while ntogo > 0 {
        if ntogo / 4 > 0 {
            let run = queue.write_grant();
            let streak = (ntogo / 4).min(run.len() / 4);
            if streak > 0 {
                for chunk in run[..streak * 4].chunks_exact_mut(4) {
                    chunk.copy_from_slice(&fifo.pop().to_le_bytes());
                }
                queue.commit(streak * 4);
                ntogo -= streak * 4;
                continue;
            }
        }

        let word = fifo.pop().to_le_bytes();
        let mut i = 0;
        while ntogo > 0 && i < 4 {
            queue.write_grant()[0] = word[i];
            queue.commit(1);
            ntogo -= 1;
            i += 1;
        }
    }
    queue.notify(n);
}
