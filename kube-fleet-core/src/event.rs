//! Change notifications funnelled from every member cluster
use crate::{cluster::ClusterId, object::DynamicObject, object_ref::ResourceKey};
use serde::{Deserialize, Serialize};

/// What happened to an object
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The object was created, or re-discovered by a full re-list
    Added,
    /// The object was changed
    Updated,
    /// The object was removed
    Deleted,
}

/// A change to one object in one cluster
///
/// Events only name what changed. Consumers are expected to re-read the current state
/// rather than act on a payload that may already be superseded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The object that changed
    pub key: ResourceKey,
    /// How it changed
    pub kind: EventKind,
    /// The generation of the object as observed by the watch
    pub observed_generation: Option<i64>,
}

impl ChangeEvent {
    /// Describe a change to `obj` inside `cluster`
    #[must_use]
    pub fn new(cluster: &ClusterId, kind: EventKind, obj: &DynamicObject) -> Self {
        Self {
            key: ResourceKey::new(cluster.clone(), obj.object_ref()),
            kind,
            observed_generation: obj.metadata.generation,
        }
    }

    /// The cluster the event originated from
    #[must_use]
    pub fn cluster(&self) -> &ClusterId {
        &self.key.cluster
    }
}
