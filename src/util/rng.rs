use rand::{SeedableRng, rngs::StdRng};

/// Derives an independent, reproducible stream from the run seed.
pub(crate) fn stream(seed: u64, stream_id: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ stream_id.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}
