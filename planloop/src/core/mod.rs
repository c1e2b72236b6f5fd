//! Deterministic, pure logic shared by the plan loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (agent text, decoded JSON, plan markdown) and return deterministic
//! outputs suitable for tests.

pub mod extract;
pub mod history;
pub mod objective;
pub mod schema;
pub mod types;
