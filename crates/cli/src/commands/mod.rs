//! Subcommand implementations

pub mod scale;
pub mod status;
pub mod version;
