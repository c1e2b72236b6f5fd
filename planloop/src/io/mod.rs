//! Side-effecting helpers: filesystem layout, persisted state, agent processes,
//! manual handoff and prompt assembly.

pub mod agent;
pub mod assets;
pub mod cancel;
pub mod config;
pub mod layout;
pub mod manual;
pub mod process;
pub mod prompt;
pub mod round_log;
pub mod run_state;
