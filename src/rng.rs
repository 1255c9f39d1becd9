use ndarray_rand::rand::{SeedableRng, rngs::StdRng};

/// Independent random streams drawn from one run seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Split = 0,
    Init = 1,
    Shuffle = 2,
}

/// Create the generator for `stream`. The same seed and stream always give
/// the same sequence, and different streams never share a seed.
pub fn seeded(seed: u64, stream: Stream) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_mul(3).wrapping_add(stream as u64))
}
