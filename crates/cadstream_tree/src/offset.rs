//! Node id offset allocation
//!
//! Each inclusion reserves a contiguous runtime id range `[offset, offset +
//! span)`. Live ranges never overlap; released ranges are reused first-fit.

use cadstream_core::id::NodeIdOffset;
use std::collections::BTreeMap;

/// Allocator of non-overlapping runtime id ranges
#[derive(Debug, Default)]
pub struct OffsetAllocator {
    next: i32,
    free: Vec<(i32, u32)>,
    live: BTreeMap<i32, u32>,
}

impl OffsetAllocator {
    /// Create an empty allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a range of `span` ids; `None` once the id space is exhausted
    pub fn allocate(&mut self, span: u32) -> Option<NodeIdOffset> {
        let span = span.max(1);

        if let Some(pos) = self.free.iter().position(|(_, len)| *len >= span) {
            let (start, len) = self.free[pos];
            if len == span {
                self.free.remove(pos);
            } else {
                self.free[pos] = (start + span as i32, len - span);
            }
            self.live.insert(start, span);
            return Some(NodeIdOffset::new(start));
        }

        let start = self.next;
        let end = start.checked_add(i32::try_from(span).ok()?)?;
        self.next = end;
        self.live.insert(start, span);
        Some(NodeIdOffset::new(start))
    }

    /// Release a range; returns false if the offset is not live
    pub fn release(&mut self, offset: NodeIdOffset) -> bool {
        let Some(span) = self.live.remove(&offset.raw()) else {
            return false;
        };
        self.free.push((offset.raw(), span));
        self.coalesce();
        true
    }

    /// Span of a live range
    pub fn span_of(&self, offset: NodeIdOffset) -> Option<u32> {
        self.live.get(&offset.raw()).copied()
    }

    /// Number of live ranges
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Release every range and start over
    pub fn reset(&mut self) {
        self.next = 0;
        self.free.clear();
        self.live.clear();
    }

    fn coalesce(&mut self) {
        self.free.sort_unstable_by_key(|(start, _)| *start);
        let mut merged: Vec<(i32, u32)> = Vec::with_capacity(self.free.len());
        for (start, len) in self.free.drain(..) {
            match merged.last_mut() {
                Some((prev_start, prev_len)) if *prev_start + *prev_len as i32 == start => {
                    *prev_len += len;
                }
                _ => merged.push((start, len)),
            }
        }

        // A free range touching the high-water mark shrinks it instead
        if let Some(&(start, len)) = merged.last() {
            if start + len as i32 == self.next {
                self.next = start;
                merged.pop();
            }
        }
        self.free = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_do_not_overlap() {
        let mut alloc = OffsetAllocator::new();
        let a = alloc.allocate(10).unwrap();
        let b = alloc.allocate(5).unwrap();
        assert_eq!(a.raw(), 0);
        assert_eq!(b.raw(), 10);
        assert_eq!(alloc.live_count(), 2);
    }

    #[test]
    fn test_release_and_reuse() {
        let mut alloc = OffsetAllocator::new();
        let a = alloc.allocate(10).unwrap();
        let _b = alloc.allocate(10).unwrap();

        assert!(alloc.release(a));
        assert!(!alloc.release(a));

        let c = alloc.allocate(4).unwrap();
        assert_eq!(c.raw(), 0);
        let d = alloc.allocate(6).unwrap();
        assert_eq!(d.raw(), 4);
        let e = alloc.allocate(1).unwrap();
        assert_eq!(e.raw(), 20);
    }

    #[test]
    fn test_tail_release_lowers_high_water() {
        let mut alloc = OffsetAllocator::new();
        let _a = alloc.allocate(3).unwrap();
        let b = alloc.allocate(3).unwrap();
        alloc.release(b);
        assert_eq!(alloc.allocate(8).unwrap().raw(), 3);
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = OffsetAllocator::new();
        assert!(alloc.allocate(u32::MAX).is_none());
        assert!(alloc.allocate(i32::MAX as u32).is_some());
        assert!(alloc.allocate(1).is_none());
    }
}
