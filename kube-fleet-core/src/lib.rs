//! Crate with the types and traits shared by every part of a multi-cluster controller
//!
//! This crate carries no runtime: it describes what a member cluster looks like from the
//! outside ([`ClusterClient`], [`ClusterHandle`]), how objects inside it are addressed
//! ([`ObjectRef`], [`ResourceKey`]) and what a change notification carries ([`ChangeEvent`]).
//! The same information is re-exported from `kube-fleet` under `kube_fleet::core`.
#![deny(unsafe_code)]

pub mod cluster;
pub use cluster::{ClusterClient, ClusterHandle, ClusterId, ConnectionState};

pub mod event;
pub use event::{ChangeEvent, EventKind};

pub mod object;
pub use object::{Condition, DynamicObject, ObjectMeta};

pub mod object_ref;
pub use object_ref::{ObjectRef, ResourceKey};

pub mod watch;
pub use watch::{ObjectList, Position, WatchEvent};

mod error;
pub use error::ClusterError;

/// Convient alias for `Result<T, ClusterError>`
pub type Result<T, E = ClusterError> = std::result::Result<T, E>;
