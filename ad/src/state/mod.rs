//! Persistent state access
//!
//! The StateManager actor owns the ledger; everything else talks to it
//! through a cloneable handle.

mod manager;
mod messages;

pub use manager::{StateEvent, StateManager};
pub use messages::{StateCommand, StateError, StateResponse};
