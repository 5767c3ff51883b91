//! Core type definitions used across the batchq workspace.

pub mod id;

pub use id::*;
