//! Stable exit codes for marketplace CLI commands.

/// Command succeeded, or `loop` reached `complete`.
pub const OK: i32 = 0;
/// Invalid layout/config/input or an internal error.
pub const INVALID: i32 = 1;
/// `loop` escalated to `needs_attention`.
pub const NEEDS_ATTENTION: i32 = 3;
/// `loop` was interrupted by the operator (128 + SIGINT).
pub const ABORTED: i32 = 130;
