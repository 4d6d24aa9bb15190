//! Tessera Scheduler
//!
//! Watches flow triggers and asks the engine to run flows.
//!
//! This crate provides:
//! - Per-flow trigger state with missed-instant coalescing
//! - Engine clients over HTTP or an embedded engine
//! - The polling loop tying both together

pub mod client;
pub mod clock;
pub mod config;
pub mod scheduler;
pub mod trigger;

pub use client::{HttpRequester, LocalRequester, RequestError, RunRequester, RunResponse};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use scheduler::{Scheduler, TickReport};
pub use trigger::{FlowTrigger, Phase};
