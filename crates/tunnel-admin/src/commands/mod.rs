//! CLI subcommand implementations.

pub mod lb;
pub mod user;
