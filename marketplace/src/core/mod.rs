//! Deterministic, pure logic for the marketplace engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod fingerprint;
pub mod invariants;
pub mod outcome;
pub mod projector;
pub mod requirements;
pub mod scoring;
pub mod types;
pub mod weights;
