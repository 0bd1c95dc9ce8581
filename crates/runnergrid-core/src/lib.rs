//! runnergrid-core — configuration shared by every runnergrid crate.
//!
//! `runnergrid.toml` is parsed into [`GridConfig`]. Every section is
//! optional; missing values fall back to the defaults documented on each
//! field. Durations are written as strings (`"30s"`, `"5m"`, `"500ms"`)
//! and parsed with [`parse_duration`].

pub mod config;
pub mod duration;

pub use config::*;
pub use duration::parse_duration;
