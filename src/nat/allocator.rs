//! Fake port allocation.

use std::sync::atomic::{AtomicU16, Ordering};

/// Port allocator cycling through an inclusive range.
///
/// The cursor only advances, so ports released by closed flows are reused
/// after a full cycle rather than immediately.
#[derive(Debug)]
pub struct PortAllocator {
    /// Start of port range.
    start: u16,
    /// End of port range (inclusive).
    end: u16,
    /// Next port to try (wraps around).
    next: AtomicU16,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end);
        Self {
            start,
            end,
            next: AtomicU16::new(start),
        }
    }

    /// Allocator over every non-zero port.
    pub fn full_range() -> Self {
        Self::new(1, u16::MAX)
    }

    /// Number of ports in the range.
    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Try to allocate a port, skipping those `is_in_use` reports.
    /// Returns `None` once a full cycle finds nothing free.
    pub fn allocate<F>(&self, is_in_use: F) -> Option<u16>
    where
        F: Fn(u16) -> bool,
    {
        // One extra step absorbs the wrap back to the start of the range
        for _ in 0..=self.capacity() {
            let port = self.next.fetch_add(1, Ordering::Relaxed);

            if port < self.start || port > self.end {
                let _ = self.next.compare_exchange(
                    port.wrapping_add(1),
                    self.start,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
                continue;
            }

            if !is_in_use(port) {
                return Some(port);
            }
        }

        None
    }
}
