//! Stable exit codes for the interpreter CLI.

/// The task finished: the model stopped proposing code or the user declined.
pub const OK: i32 = 0;
/// Invalid settings, endpoint failures, oversized input or other errors.
pub const FAILED: i32 = 1;
/// `interpreter run` hit the configured `max_turns`.
pub const TURN_LIMIT: i32 = 3;
/// The task was cancelled with Ctrl-C.
pub const CANCELLED: i32 = 130;
