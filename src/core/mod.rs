//! Core primitives shared by the network layer.

pub mod rng;

pub use rng::TokenRng;
