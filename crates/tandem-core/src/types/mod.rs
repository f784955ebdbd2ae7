//! Core types for Tandem

mod row;
mod table;

pub use row::*;
pub use table::*;
