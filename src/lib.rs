//! Core library for the daq_engine experiment runner.
//!
//! An experiment is a set of [`variable`]s (instrument knobs and meters, expressions,
//! parameters and variables proxied from other engines), [`routine`]s that drive knobs
//! along trajectories, and [`alarm`]s that watch conditions and steer the run lifecycle.
//! The [`scheduler`] owns all of them and publishes one immutable
//! [`State`](scheduler::State) per iteration.
//!
//! Instrument I/O goes through [`adapters`]: each endpoint is served by a single queue
//! task that serializes operations and applies the retry and reconnect policy from
//! [`error_recovery`].

pub mod adapters;
pub mod alarm;
pub mod config;
pub mod core;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod logging;
pub mod routine;
pub mod scheduler;
pub mod server;
pub mod variable;
