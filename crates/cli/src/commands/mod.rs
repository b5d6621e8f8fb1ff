//! CLI subcommands

pub mod analyze;
pub mod lint;
pub mod overlays;
