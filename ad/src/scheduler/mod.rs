//! Periodic scheduling
//!
//! The tick loop and the cron next-occurrence computation.

pub mod cron;

mod core;

pub use core::{SOURCE_SCHEDULER, Scheduler, compute_next_run};
