//! Core value types shared across the crate.

pub mod encoding;
pub mod hash;
