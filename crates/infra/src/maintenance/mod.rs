//! Background housekeeping against the prediction repository.

pub mod sweeper;

pub use sweeper::{MaintenanceSweeper, SweepError, SweeperHandle};
