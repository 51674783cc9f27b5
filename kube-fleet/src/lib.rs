//! Keep objects reconciled across a changing fleet of clusters
//!
//! This crate is a facade over the two crates that make up kube-fleet:
//!
//! - [`core`] holds the shared types: how a member cluster is reached ([`ClusterClient`],
//!   [`ClusterHandle`]), how objects are addressed ([`ObjectRef`], [`ResourceKey`]) and what a
//!   change looks like ([`ChangeEvent`](crate::core::ChangeEvent)).
//! - [`runtime`] holds the engine: membership discovery, the watch fan-in, the work queue,
//!   the reconcile worker pool and leader election.
//!
//! # Example
//!
//! ```no_run
//! use kube_fleet::prelude::*;
//! use std::{sync::Arc, time::Duration};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn reconcile(req: Request, _ctx: Context<()>) -> Result<Action, ReconcileError<std::io::Error>> {
//!     let Some(widget) = req.object else {
//!         return Ok(Action::await_change());
//!     };
//!     let mut observed = widget.clone();
//!     observed.status = serde_json::json!({ "observedSize": widget.spec["size"] });
//!     if observed.status != widget.status {
//!         req.cluster
//!             .client()
//!             .update_status(observed)
//!             .await
//!             .map_err(|err| std::io::Error::other(err.to_string()))?;
//!     }
//!     Ok(Action::requeue(Duration::from_secs(300)))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let east = ClusterHandle::new("east", Arc::new(MemoryCluster::new()));
//!     Controller::new(StaticProvider::new(vec![east]), reconciler_fn(reconcile, Context::new(())))
//!         .watches("Widget")
//!         .run(CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

macro_rules! cfg_runtime {
    ($($item:item)*) => {
        $(
            #[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
            #[cfg(feature = "runtime")]
            $item
        )*
    }
}

/// Re-exports from [`kube_fleet_core`]
#[doc(inline)]
pub use kube_fleet_core as core;
pub use kube_fleet_core::{ClusterClient, ClusterHandle, ClusterId, DynamicObject, ObjectRef, ResourceKey};

cfg_runtime! {
    /// Re-exports from [`kube_fleet_runtime`]
    #[doc(inline)]
    pub use kube_fleet_runtime as runtime;
    #[doc(inline)]
    pub use runtime::{Controller, ControllerConfig};
}

/// Everything needed to write a controller, in one import
pub mod prelude {
    pub use kube_fleet_core::{
        ClusterClient, ClusterHandle, ClusterId, Condition, DynamicObject, ObjectRef, ResourceKey,
    };

    #[cfg(feature = "runtime")]
    pub use kube_fleet_runtime::{
        controller::{reconciler_fn, Action, Context, Controller, ReconcileError, Reconciler, Request},
        membership::{DiscoveryProvider, MembershipSource, StaticProvider},
        memory::{MemoryCluster, MemoryLeaseStore, MemoryMembership},
        ControllerConfig, Health, LeaderElector,
    };
}
