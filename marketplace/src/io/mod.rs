//! Side-effecting adapters: filesystem records, child processes, and the
//! external actor boundaries.

pub mod attention;
pub mod competitor;
pub mod config;
pub mod event_store;
pub mod implementer;
pub mod paths;
pub mod process;
pub mod projection_cache;
pub mod round_log;
pub mod spec_doc;
