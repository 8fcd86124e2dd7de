//! Core deterministic primitives.
//!
//! Randomness that feeds matchmaking decisions lives here so it can be
//! seeded and replayed under test; everything else in the server is free to
//! be wall-clock driven.

pub mod rng;

// Re-export core types
pub use rng::{derive_session_seed, DeterministicRng, Draw};
