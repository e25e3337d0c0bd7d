use super::PoolPos;

/// ClockReplacer implements the clock page replacement policy for the buffer pool.
/// Whether a buffer may be evicted at all is decided by the caller, the replacer
/// only keeps the reference bits and the position of the clock hand.
pub(in crate::buffer) struct ClockReplacer {
    pool_size: usize,
    clock_hand: PoolPos,
    ref_bits: Vec<bool>,
}

impl ClockReplacer {
    /// Construct a new ClockReplacer for a buffer pool with a given pool_size
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            clock_hand: 0,
            ref_bits: vec![false; pool_size],
        }
    }

    /// The buffer at the given position in the pool was used
    pub fn touch(&mut self, buffer: PoolPos) {
        self.ref_bits[buffer] = true;
    }

    /// Returns None if no buffer is evictable, else the next evictable buffer
    /// which was not used since the clock hand last passed it.
    pub fn find_victim(&mut self, evictable: impl Fn(PoolPos) -> bool) -> Option<PoolPos> {
        // the first round may only clear reference bits
        for _ in 0..2 * self.pool_size {
            let buffer = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % self.pool_size;
            if !evictable(buffer) {
                continue;
            }
            if !self.ref_bits[buffer] {
                return Some(buffer);
            } else {
                self.ref_bits[buffer] = false;
            }
        }
        None
    }
}
