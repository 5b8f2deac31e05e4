//! Recycled scratch work-lists for the trace.
//!
//! Frontiers and per-task output lists are borrowed from here and returned
//! cleared, so a warmed-up collector allocates no new lists while marking.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;

use super::object::ObjectHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrayPoolStats {
    pub pooled: usize,
    pub in_use: i64,
    pub acquired: u64,
    pub released: u64,
    pub allocated: u64,
}

#[derive(Debug, Default)]
pub struct GcArrayPool {
    pool: SegQueue<Vec<ObjectHandle>>,
    in_use: CachePadded<AtomicI64>,
    acquired: CachePadded<AtomicU64>,
    released: CachePadded<AtomicU64>,
    allocated: AtomicU64,
}

impl GcArrayPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an empty list, reusing a pooled one when available.
    pub fn acquire(&self) -> Vec<ObjectHandle> {
        self.in_use.fetch_add(1, Ordering::Relaxed);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.pool.pop().unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Vec::new()
        })
    }

    /// Return a list to the pool. Its contents are discarded.
    pub fn release(&self, mut array: Vec<ObjectHandle>) {
        array.clear();
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.released.fetch_add(1, Ordering::Relaxed);
        self.pool.push(array);
    }

    /// True when every acquired list has come back.
    pub fn check_leaks(&self) -> bool {
        let in_use = self.in_use.load(Ordering::Relaxed);
        if in_use != 0 {
            tracing::warn!(in_use, "GC array pool has outstanding arrays");
        }
        in_use == 0
    }

    /// Drop every pooled list. Returns the number of lists and their bytes.
    pub fn cleanup(&self) -> (usize, usize) {
        let mut count = 0;
        let mut bytes = 0;
        while let Some(array) = self.pool.pop() {
            count += 1;
            bytes += array.capacity() * size_of::<ObjectHandle>();
        }
        tracing::info!(
            arrays = count,
            "freed {:.3} MB from the GC array pool",
            bytes as f64 / (1024.0 * 1024.0)
        );
        (count, bytes)
    }

    pub fn stats(&self) -> ArrayPoolStats {
        ArrayPoolStats {
            pooled: self.pool.len(),
            in_use: self.in_use.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }
}
