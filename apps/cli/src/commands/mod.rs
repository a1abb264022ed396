//! Command implementations for the Tracetune CLI.

pub mod checkpoints;
pub mod preview;
pub mod train;
pub mod types;
