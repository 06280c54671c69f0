//! Integration test crate for SampleDeck.
//!
//! This crate exists solely to hold cross-crate integration tests.
//! It depends on every sampledeck crate to verify they work together.

#[cfg(test)]
mod downsampling;

#[cfg(test)]
mod memory;

#[cfg(test)]
mod pool;

#[cfg(test)]
mod engine;
