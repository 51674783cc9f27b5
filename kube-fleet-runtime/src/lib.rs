//! Crate with the runtime components of a multi-cluster controller
//!
//! This crate contains the building blocks that keep objects reconciled across a fleet of
//! clusters whose membership changes over time: discovering members, funnelling their change
//! streams into one deduplicating work queue, draining that queue with a pool of workers, and
//! gating all of it behind leader election.
//!
//! Newcomers should generally get started with the [`Controller`] builder, which wires all of
//! these together for you.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
// Every module names its own `Error`
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod controller;
pub mod coordination;
pub mod fanin;
pub mod health;
pub mod membership;
pub mod memory;
pub mod queue;
pub mod utils;
pub mod watcher;

pub use config::ControllerConfig;
pub use controller::{Controller, Reconciler};
pub use coordination::LeaderElector;
pub use fanin::fan_in;
pub use health::Health;
pub use queue::WorkQueue;
pub use watcher::watcher;
