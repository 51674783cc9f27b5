use super::{LeaseRecord, VersionedLease};
use async_trait::async_trait;
use kube_fleet_core::{ClusterClient, ClusterError, DynamicObject, ObjectRef};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by a [`LeaseStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record was written by someone else since it was read
    #[error("lease was modified concurrently")]
    Conflict,
    /// The store could not be reached
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
    /// The stored record could not be understood
    #[error("malformed lease record: {0}")]
    Malformed(String),
}

/// Shared storage for lease records with compare-and-swap writes
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Read the current record, if any
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, StoreError>;

    /// Create the record, failing with [`StoreError::Conflict`] if it already exists
    async fn create(&self, name: &str, record: LeaseRecord) -> Result<VersionedLease, StoreError>;

    /// Replace the record, failing with [`StoreError::Conflict`] unless it is still at `version`
    async fn update(&self, name: &str, record: LeaseRecord, version: &str) -> Result<VersionedLease, StoreError>;
}

/// Kind of the objects [`ClusterLeaseStore`] keeps leases in
const LEASE_KIND: &str = "Lease";

/// Keeps lease records as objects inside one cluster
///
/// The record is stored as the object's spec, and the object's resource version doubles as the
/// lease version, so the cluster's own optimistic concurrency arbitrates between candidates.
#[derive(Clone)]
pub struct ClusterLeaseStore {
    client: Arc<dyn ClusterClient>,
    namespace: Option<String>,
}

impl ClusterLeaseStore {
    /// Store leases in `client`, outside of any namespace
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client, namespace: None }
    }

    /// Store leases inside `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    fn object(&self, name: &str) -> DynamicObject {
        let obj = DynamicObject::new(LEASE_KIND, name);
        match &self.namespace {
            Some(ns) => obj.within(ns),
            None => obj,
        }
    }

    fn encode(&self, name: &str, record: &LeaseRecord) -> Result<DynamicObject, StoreError> {
        let spec = serde_json::to_value(record).map_err(|err| StoreError::Malformed(err.to_string()))?;
        Ok(self.object(name).spec(spec))
    }
}

fn decode(obj: DynamicObject) -> Result<VersionedLease, StoreError> {
    let version = obj
        .metadata
        .resource_version
        .ok_or_else(|| StoreError::Malformed("lease has no resource version".into()))?;
    let record = serde_json::from_value(obj.spec).map_err(|err| StoreError::Malformed(err.to_string()))?;
    Ok(VersionedLease { record, version })
}

impl From<ClusterError> for StoreError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Conflict(_) => StoreError::Conflict,
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
impl LeaseStore for ClusterLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, StoreError> {
        let obj_ref = ObjectRef::from_obj(&self.object(name));
        self.client.get(&obj_ref).await?.map(decode).transpose()
    }

    async fn create(&self, name: &str, record: LeaseRecord) -> Result<VersionedLease, StoreError> {
        let obj = self.encode(name, &record)?;
        decode(self.client.create(obj).await?)
    }

    async fn update(&self, name: &str, record: LeaseRecord, version: &str) -> Result<VersionedLease, StoreError> {
        let mut obj = self.encode(name, &record)?;
        obj.metadata.resource_version = Some(version.to_string());
        decode(self.client.update(obj).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::{ClusterLeaseStore, LeaseStore, StoreError};
    use crate::{coordination::LeaseRecord, memory::MemoryCluster};
    use std::sync::Arc;

    #[tokio::test]
    async fn writes_are_conditional_on_the_version_read() {
        let store = ClusterLeaseStore::new(Arc::new(MemoryCluster::new())).within("kube-system");
        assert_eq!(store.get("leader").await, Ok(None));

        let record = LeaseRecord {
            holder_identity: Some("a".into()),
            lease_duration_seconds: 15,
            fencing_token: 1,
            ..LeaseRecord::default()
        };
        let created = store.create("leader", record.clone()).await.unwrap();
        assert_eq!(store.create("leader", record.clone()).await, Err(StoreError::Conflict));
        assert_eq!(store.get("leader").await.unwrap(), Some(created.clone()));

        let mut renewed = record.clone();
        renewed.lease_transitions = 1;
        let updated = store.update("leader", renewed, &created.version).await.unwrap();
        assert_ne!(updated.version, created.version);
        assert_eq!(
            store.update("leader", record, &created.version).await,
            Err(StoreError::Conflict)
        );
    }
}
