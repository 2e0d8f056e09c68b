//! Program storage.
//!
//! - [`program_store`]: the [`ProgramStore`](program_store::ProgramStore) trait with
//!   directory-backed and in-memory implementations

pub mod program_store;
