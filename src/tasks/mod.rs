//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a cache is open.
//!
//! # Tasks
//! - Expiry Sweep: Removes expired records at the configured interval

mod sweeper;

pub use sweeper::{sweep_expired, ExpirySweeper, SweeperState};
