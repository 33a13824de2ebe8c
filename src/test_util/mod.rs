//! Utilities for running streaming sessions deterministically in tests: an in-memory datagram
//!  network with programmable faults, synthetic frame sources and a collecting frame sink.
//!
//! They are part of the regular (non-#[cfg(test)]) code so that applications can use them for
//!  their own tests.

pub mod frames;
pub mod memory_network;
