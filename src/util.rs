pub mod error;
pub(crate) mod rng;
