//! Controller side of the protocol
//!
//! The controller computes a placement, rolls out assignments, starts the run
//! and collects termination reports. It never sits on the data path: results
//! flow directly between workers.

pub mod client;
pub mod controller;
pub mod placement;
pub mod service;
pub mod types;

pub use client::{ControllerClient, SubmitStatus};
pub use controller::{Controller, RunEvent, RunReport};
pub use placement::{Placement, PlacementPolicy, RoundRobin};
pub use service::{ControllerService, RunOutcome};
pub use types::*;
