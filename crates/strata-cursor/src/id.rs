use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Cursor-id layout: bit 63 marks file-backed cursors, bits 62..48 hold a
/// per-process prefix drawn at startup, bits 47..0 a monotonic counter.
/// Ids stay unique across processes without coordination; zero is never
/// produced (the wire reserves 0 for "no cursor").
pub struct CursorIdAllocator {
    prefix: u64,
    counter: AtomicU64,
}

const FILE_BACKED_BIT: u64 = 1 << 63;
const PREFIX_SHIFT: u32 = 48;
const PREFIX_MASK: u64 = 0x7FFF;
const COUNTER_MASK: u64 = (1 << 48) - 1;

impl CursorIdAllocator {
    pub fn new() -> Self {
        Self::with_prefix(rand::thread_rng().r#gen::<u64>() & PREFIX_MASK)
    }

    pub fn with_prefix(prefix: u64) -> Self {
        Self {
            prefix: prefix & PREFIX_MASK,
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self, file_backed: bool) -> i64 {
        let count = self.counter.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
        let mut id = (self.prefix << PREFIX_SHIFT) | count;
        if file_backed {
            id |= FILE_BACKED_BIT;
        }
        id as i64
    }

    pub fn is_file_backed(id: i64) -> bool {
        (id as u64) & FILE_BACKED_BIT != 0
    }
}

impl Default for CursorIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let alloc = CursorIdAllocator::with_prefix(7);
        let a = alloc.next(false);
        let b = alloc.next(false);
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn file_bit_is_the_top_bit() {
        let alloc = CursorIdAllocator::with_prefix(7);
        let plain = alloc.next(false);
        let file = alloc.next(true);
        assert!(!CursorIdAllocator::is_file_backed(plain));
        assert!(CursorIdAllocator::is_file_backed(file));
        assert!(file < 0); // the sign bit doubles as the file marker
    }

    #[test]
    fn prefix_separates_processes() {
        let a = CursorIdAllocator::with_prefix(1).next(false);
        let b = CursorIdAllocator::with_prefix(2).next(false);
        assert_ne!(a, b);
    }
}
