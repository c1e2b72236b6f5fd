//! Plan judge/rewrite loop.
//!
//! An external agent alternately judges a planning document against a rubric
//! and rewrites it until the judgment is a strict pass, a round cap is hit, or
//! the run is cancelled. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (schema validation, result
//!   extraction, objective snapshot, fix history). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem layout, persisted
//!   state, agent processes, manual handoff, prompt assembly).
//!
//! Orchestration modules ([`lane`], [`round`], [`report`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod lane;
pub mod logging;
pub mod report;
pub mod round;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
