//! # ferry Files
//!
//! Storage collaborators for the ferry transfer core.
//!
//! This crate provides:
//! - A local-filesystem source with sparse range discovery on Linux
//! - A positional-write file sink tracking received chunks
//! - In-memory sparse objects with injectable faults

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod local;
pub mod memory;
pub mod sink;

pub use local::LocalFileSource;
pub use memory::{FaultPlan, MemorySinks, MemorySource};
pub use sink::{FileSink, FileSinkFactory};
