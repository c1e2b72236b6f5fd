//! Stable exit codes for planloop CLI commands.

/// Strict pass, round cap reached, or a non-loop command succeeded.
pub const OK: i32 = 0;
/// Fatal error, including configuration errors before the first round.
pub const ERROR: i32 = 1;
/// The run was stopped through `stop_requested`.
pub const STOPPED: i32 = 2;
/// The run was interrupted with Ctrl-C.
pub const INTERRUPTED: i32 = 130;
