//! runnergridd — assembles routing, assignment, autoscaling and status
//! reporting over a single state store.

pub mod grid;

pub use grid::{Dispatch, Grid};
