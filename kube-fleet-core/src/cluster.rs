//! Member clusters and the resource API they expose
use crate::{
    object::DynamicObject,
    object_ref::ObjectRef,
    watch::{ObjectList, Position, WatchEvent},
    Result,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, Display},
    sync::Arc,
};

/// Opaque identifier of a member cluster, stable for the cluster's lifetime
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// The raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClusterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClusterId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The resource API of a single member cluster
///
/// Objects are addressed by kind, namespace and name. Watches resume from a [`Position`]
/// handed out by [`ClusterClient::list`] or by a previous watch event, and must fail with
/// [`ClusterError::PositionExpired`](crate::ClusterError::PositionExpired) when the cluster no
/// longer retains that part of its history.
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Fetch one object, `None` if it does not exist
    async fn get(&self, obj: &ObjectRef) -> Result<Option<DynamicObject>>;

    /// List every object of a kind
    async fn list(&self, kind: &str) -> Result<ObjectList>;

    /// Stream changes to a kind that happened after `from`
    async fn watch(&self, kind: &str, from: &Position) -> Result<BoxStream<'static, Result<WatchEvent>>>;

    /// Create a new object
    async fn create(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace an object's metadata and spec
    ///
    /// If `obj` carries a resource version the write only succeeds when it matches the
    /// stored one, otherwise [`ClusterError::Conflict`](crate::ClusterError::Conflict) is returned.
    async fn update(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace an object's status, with the same concurrency rules as [`ClusterClient::update`]
    async fn update_status(&self, obj: DynamicObject) -> Result<DynamicObject>;

    /// Delete an object
    async fn delete(&self, obj: &ObjectRef) -> Result<()>;
}

/// Health of the connection to a member cluster, as last observed by its watches
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Discovered, no watch has succeeded yet
    Pending,
    /// All watches are streaming
    Connected,
    /// At least one watch is failing and retrying
    Degraded,
    /// The cluster was removed from the fleet
    Disconnected,
}

/// A cluster identifier bound to a client for that cluster
///
/// Handles are cheap to clone and share the same connection state.
#[derive(Clone)]
pub struct ClusterHandle {
    id: ClusterId,
    client: Arc<dyn ClusterClient>,
    state: Arc<RwLock<ConnectionState>>,
}

impl ClusterHandle {
    /// Bind `client` to `id`
    pub fn new(id: impl Into<ClusterId>, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            id: id.into(),
            client,
            state: Arc::new(RwLock::new(ConnectionState::Pending)),
        }
    }

    /// The cluster this handle addresses
    #[must_use]
    pub fn id(&self) -> &ClusterId {
        &self.id
    }

    /// The cluster's resource API
    #[must_use]
    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    /// The last observed connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Record a new connection state, returning the previous one
    pub fn set_state(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.write(), state)
    }
}

impl Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
