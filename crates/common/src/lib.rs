//! Shared helpers for the persistence workspace.

pub mod utils;
