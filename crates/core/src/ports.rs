//! Even/odd UDP port-pair allocator.
//!
//! Every stream-side needs one RTP port and the adjacent RTCP port
//! immediately above it, so the pool hands out pairs, not individual ports.
//! Internally this keeps the teacher's bitmap-with-leading-ones trick from
//! its single-port allocator, just reindexed so that bit `i` of the bitmap
//! represents the pair `(start + i * 2, start + i * 2 + 1)` instead of a
//! single port `start + i`.

use std::str::FromStr;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// `start` must be even; `end` is rounded down to the nearest even value
    /// if it isn't already, so that every pair `(p, p+1)` in range fits.
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end, "port range start must not exceed end");
        assert!(start % 2 == 0, "port range start must be even");

        let end = if end % 2 == 0 { end } else { end - 1 };
        Self { start, end }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of even/odd pairs available in the range.
    pub fn pairs(&self) -> usize {
        ((self.end - self.start) / 2) as usize + 1
    }

    pub fn contains_pair(&self, even_port: u16) -> bool {
        even_port >= self.start && even_port <= self.end && (even_port - self.start) % 2 == 0
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(49152, 65534)
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug)]
pub struct PortRangeParseError(String);

impl std::error::Error for PortRangeParseError {}

impl std::fmt::Display for PortRangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<std::num::ParseIntError> for PortRangeParseError {
    fn from(error: std::num::ParseIntError) -> Self {
        PortRangeParseError(error.to_string())
    }
}

impl FromStr for PortRange {
    type Err = PortRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once("..")
            .ok_or_else(|| PortRangeParseError(s.to_string()))?;

        Ok(Self::new(start.parse()?, end.parse()?))
    }
}

#[derive(PartialEq, Eq)]
enum Bit {
    Low,
    High,
}

/// Bitmap-backed pool of even/odd port pairs.
///
/// # Test
///
/// ```
/// use std::collections::HashSet;
/// use rtprelay_core::ports::*;
///
/// let mut pool = PortAllocator::default();
/// let mut seen = HashSet::with_capacity(pool.capacity());
///
/// while let Some((even, odd)) = pool.alloc(None) {
///     assert_eq!(odd, even + 1);
///     seen.insert(even);
/// }
///
/// assert_eq!(pool.capacity(), seen.len());
/// ```
pub struct PortAllocator {
    port_range: PortRange,
    buckets: Vec<u64>,
    allocated: usize,
    bit_len: u32,
    max_offset: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}

impl PortAllocator {
    pub fn new(port_range: PortRange) -> Self {
        let capacity = port_range.pairs();
        let bucket_size = ((capacity as f32) / 64.0).ceil() as usize;
        let bucket_size = bucket_size.max(1);

        let bit_len = capacity - (bucket_size - 1) * 64;

        Self {
            bit_len: bit_len as u32,
            buckets: vec![0; bucket_size],
            max_offset: bucket_size - 1,
            allocated: 0,
            port_range,
        }
    }

    pub fn capacity(&self) -> usize {
        self.port_range.pairs()
    }

    pub fn port_range(&self) -> &PortRange {
        &self.port_range
    }

    pub fn len(&self) -> usize {
        self.allocated
    }

    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    /// Allocate the next free pair. `start` picks a bucket to begin the scan
    /// from (used deterministically by tests); `None` picks a random bucket,
    /// matching the teacher's blind-port-guessing mitigation for the single
    /// allocator this one is adapted from.
    pub fn alloc(&mut self, start: Option<usize>) -> Option<(u16, u16)> {
        if self.max_offset == 0 && self.buckets.is_empty() {
            return None;
        }

        let mut index = None;
        let mut offset = start.unwrap_or_else(|| {
            if self.max_offset == 0 {
                0
            } else {
                rand::rng().random_range(0..self.max_offset)
            }
        });

        let previous = if offset == 0 {
            self.max_offset
        } else {
            offset - 1
        };

        loop {
            if let Some(i) = {
                let bucket = self.buckets[offset];
                if bucket < u64::MAX {
                    let idx = bucket.leading_ones();
                    if offset == self.max_offset && idx >= self.bit_len {
                        None
                    } else {
                        Some(idx)
                    }
                } else {
                    None
                }
            } {
                index = Some(i as usize);
                break;
            }

            if offset == self.max_offset {
                offset = 0;
            } else {
                offset += 1;
            }

            if offset == previous {
                break;
            }
        }

        let index = index?;
        self.set_bit(offset, index, Bit::High);
        self.allocated += 1;

        let pair_num = (offset * 64 + index) as u16;
        let even = self.port_range.start() + pair_num * 2;
        Some((even, even + 1))
    }

    fn set_bit(&mut self, bucket: usize, index: usize, bit: Bit) {
        let high_mask = 1u64 << (63 - index);
        let value = self.buckets[bucket];
        self.buckets[bucket] = match bit {
            Bit::High => value | high_mask,
            Bit::Low => value & !high_mask,
        };
    }

    /// Return a previously allocated pair to the pool. `even_port` must be
    /// the RTP (even) half of the pair; a no-op if the pair isn't currently
    /// allocated.
    pub fn restore(&mut self, even_port: u16) {
        assert!(self.port_range.contains_pair(even_port));

        let pair_num = (even_port - self.port_range.start()) / 2;
        let bucket = pair_num as usize / 64;
        let index = pair_num as usize - bucket * 64;

        let currently_set = (self.buckets[bucket] & (1u64 << (63 - index))) != 0;
        if !currently_set {
            return;
        }

        self.set_bit(bucket, index, Bit::Low);
        self.allocated -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_adjacent_even_odd_pairs() {
        let mut pool = PortAllocator::new(PortRange::new(50000, 50010));

        assert_eq!(pool.alloc(Some(0)), Some((50000, 50001)));
        assert_eq!(pool.alloc(Some(0)), Some((50002, 50003)));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn restore_makes_a_pair_available_again() {
        let mut pool = PortAllocator::new(PortRange::new(50000, 50010));

        let (even, _odd) = pool.alloc(Some(0)).unwrap();
        pool.restore(even);

        assert_eq!(pool.len(), 0);
        assert_eq!(pool.alloc(Some(0)), Some((even, even + 1)));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = PortAllocator::new(PortRange::new(50000, 50002));

        assert!(pool.alloc(Some(0)).is_some());
        assert!(pool.alloc(Some(0)).is_some());
        assert_eq!(pool.alloc(Some(0)), None);
    }

    #[test]
    fn parses_and_renders_range_syntax() {
        let range: PortRange = "50000..50010".parse().unwrap();
        assert_eq!(range.start(), 50000);
        assert_eq!(range.to_string(), "50000..50010");
    }
}
