/// Xorshift generator used inside the training loops.
///
/// Every worker owns one, seeded from the run seed and its worker index, so a
/// single-threaded run is reproducible bit for bit.
#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0xbad5eed } else { seed },
        }
    }

    /// Seed for worker `worker` of a run seeded with `seed`.
    pub fn for_worker(seed: u64, worker: usize) -> Self {
        Self::new(
            seed.wrapping_mul(0x9e37_79b9_7f4a_7c15)
                .wrapping_add(worker as u64 * 100 + 1),
        )
    }

    #[inline(always)]
    pub fn next(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in `[0, 1)` with 53 bits of precision.
    #[inline(always)]
    pub fn next_f64(&mut self) -> f64 {
        (self.next() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform index in `[0, n)`. `n` must be non-zero.
    #[inline(always)]
    pub fn next_index(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}
