//! Command implementations

pub mod info;
pub mod simulate;
