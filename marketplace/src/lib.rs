//! Competitive planning marketplace with an event-sourced reputation ledger.
//!
//! Competitors submit proposals for an issue, proposals are scored blind,
//! the top-ranked one is implemented and verified, and every outcome is
//! appended to an immutable event log. Competitor weights and budgets are a
//! pure projection of that log. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (scoring, allocation, weight
//!   updates, projection). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (event files, cache, spawned
//!   competitor and implementer processes). Behind traits to enable mocking
//!   in tests.
//!
//! Orchestration modules ([`round`], [`looping`], [`setup`], [`status`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod round;
pub mod setup;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
