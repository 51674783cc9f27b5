//! In-process backends
//!
//! Every external collaborator of the engine has an in-memory implementation here: a member
//! cluster ([`MemoryCluster`]), a membership source ([`MemoryMembership`]) and a lease store
//! ([`MemoryLeaseStore`]). They back the tests and demos, and are good enough for single-process
//! setups where the fleet is simulated.

mod cluster;
mod lease;
mod membership;

pub use cluster::MemoryCluster;
pub use lease::MemoryLeaseStore;
pub use membership::MemoryMembership;
