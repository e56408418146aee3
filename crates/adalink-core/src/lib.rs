//! Core identifiers, command codes and the error taxonomy shared by the
//! adalink crates.

pub mod error;
pub mod types;
