//! Shared database test infrastructure.
//!
//! Tests run against in-memory SQLite databases carrying a reduced copy of
//! the scheduler's metadata schema.

pub mod harness;
