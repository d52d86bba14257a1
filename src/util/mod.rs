//! Small support utilities.

pub mod rng;

pub use rng::SplitMix64;
