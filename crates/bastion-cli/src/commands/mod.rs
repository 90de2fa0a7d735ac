//! CLI subcommand implementations.

pub mod agents;
pub mod playback;
pub mod policy;
