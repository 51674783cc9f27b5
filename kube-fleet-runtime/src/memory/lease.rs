use crate::coordination::{LeaseRecord, LeaseStore, StoreError, VersionedLease};
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;

#[derive(Default)]
struct State {
    leases: HashMap<String, VersionedLease>,
    version: u64,
    unavailable: bool,
}

/// An in-process [`LeaseStore`], shared by every elector that should compete for the same leases
#[derive(Default)]
pub struct MemoryLeaseStore {
    state: Mutex<State>,
}

impl MemoryLeaseStore {
    /// A store without any leases
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with [`StoreError::Unavailable`] while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    fn write(&self, name: &str, record: LeaseRecord, expected: Option<&str>) -> Result<VersionedLease, StoreError> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable("memory lease store is offline".into()));
        }
        let current = state.leases.get(name).map(|lease| lease.version.as_str());
        if current != expected {
            return Err(StoreError::Conflict);
        }
        state.version += 1;
        let lease = VersionedLease {
            record,
            version: state.version.to_string(),
        };
        state.leases.insert(name.to_string(), lease.clone());
        Ok(lease)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, StoreError> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable("memory lease store is offline".into()));
        }
        Ok(state.leases.get(name).cloned())
    }

    async fn create(&self, name: &str, record: LeaseRecord) -> Result<VersionedLease, StoreError> {
        self.write(name, record, None)
    }

    async fn update(&self, name: &str, record: LeaseRecord, version: &str) -> Result<VersionedLease, StoreError> {
        self.write(name, record, Some(version))
    }
}
