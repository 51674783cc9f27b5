use crate::{cluster::ClusterId, object::DynamicObject};
use educe::Educe;
use std::fmt::{Debug, Display};

/// A typed and namespaced (if relevant) reference to an object inside one cluster
///
/// ```
/// use kube_fleet_core::ObjectRef;
/// assert_ne!(ObjectRef::new("Widget", "a"), ObjectRef::new("Gadget", "a"));
/// ```
#[derive(Educe, Clone)]
#[educe(Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct ObjectRef {
    /// The kind of the object
    pub kind: String,
    /// The name of the object
    pub name: String,
    /// The namespace of the object
    ///
    /// May only be `None` if the kind is cluster-scoped (not located in a namespace).
    /// A reference with a namespace is never equal to one without:
    ///
    /// ```
    /// # use kube_fleet_core::ObjectRef;
    /// assert_ne!(ObjectRef::new("Widget", "foo"), ObjectRef::new("Widget", "foo").within("bar"));
    /// ```
    pub namespace: Option<String>,
    /// Extra information about the object being referred to
    ///
    /// This is *not* considered when comparing or hashing references.
    #[educe(Hash(ignore), PartialEq(ignore))]
    pub extra: Extra,
}

/// Non-vital information about an object being referred to
///
/// See [`ObjectRef::extra`].
#[derive(Default, Debug, Clone)]
#[non_exhaustive]
pub struct Extra {
    /// The version of the object at the time of reference
    pub resource_version: Option<String>,
    /// The uid of the object
    pub uid: Option<String>,
}

impl ObjectRef {
    /// Reference a cluster-scoped object (or one whose namespace is added with [`ObjectRef::within`])
    #[must_use]
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: None,
            extra: Extra::default(),
        }
    }

    /// Place the reference inside a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates an `ObjectRef` from the object
    #[must_use]
    pub fn from_obj(obj: &DynamicObject) -> Self {
        Self {
            kind: obj.kind.clone(),
            name: obj.metadata.name.clone(),
            namespace: obj.metadata.namespace.clone(),
            extra: Extra {
                resource_version: obj.metadata.resource_version.clone(),
                uid: obj.metadata.uid.clone(),
            },
        }
    }

    /// Scope this reference to a cluster
    #[must_use]
    pub fn in_cluster(self, cluster: ClusterId) -> ResourceKey {
        ResourceKey { cluster, object: self }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}

/// Uniquely identifies one reconcilable object across the whole fleet
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// The cluster the object lives in
    pub cluster: ClusterId,
    /// The object inside that cluster
    pub object: ObjectRef,
}

impl ResourceKey {
    /// Build a key for an object in a cluster
    #[must_use]
    pub fn new(cluster: impl Into<ClusterId>, object: ObjectRef) -> Self {
        Self {
            cluster: cluster.into(),
            object,
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.cluster, self.object)
    }
}

#[cfg(test)]
mod tests {
    use super::{ObjectRef, ResourceKey};
    use crate::object::DynamicObject;
    use std::collections::HashSet;

    #[test]
    fn renders_kind_name_and_namespace() {
        let namespaced = ObjectRef::new("Widget", "blue").within("shop");
        assert_eq!(namespaced.to_string(), "Widget/blue.shop");
        assert_eq!(ObjectRef::new("Zone", "eu-1").to_string(), "Zone/eu-1");
        assert_eq!(namespaced.in_cluster("east".into()).to_string(), "east:Widget/blue.shop");
    }

    #[test]
    fn versions_of_one_object_share_a_key() {
        let mut obj = DynamicObject::new("Widget", "blue").within("shop");
        obj.metadata.resource_version = Some("7".into());
        let first = ObjectRef::from_obj(&obj);
        obj.metadata.resource_version = Some("8".into());
        let second = ObjectRef::from_obj(&obj);
        assert_eq!(second.extra.resource_version.as_deref(), Some("8"));

        let keys: HashSet<ResourceKey> = [first, second]
            .into_iter()
            .map(|obj_ref| ResourceKey::new("east", obj_ref))
            .collect();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn same_object_in_different_clusters_is_a_different_key() {
        let obj = ObjectRef::new("Widget", "a").within("default");
        assert_ne!(obj.clone().in_cluster("east".into()), obj.in_cluster("west".into()));
    }
}
