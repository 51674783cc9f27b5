//! A dynamic representation of the objects a member cluster stores
use crate::object_ref::ObjectRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Standard metadata carried by every object
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Name, unique within a namespace (or within the cluster for cluster-scoped kinds)
    pub name: String,
    /// Namespace, `None` for cluster-scoped kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Opaque version that changes on every write, used for optimistic concurrency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Sequence number of the desired state, bumped only when `spec` changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    /// Unique id for the lifetime of the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Free-form labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A named, typed and versioned object with a desired `spec` and an observed `status`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DynamicObject {
    /// The resource kind
    pub kind: String,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub spec: Value,
    /// Observed state
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub status: Value,
}

impl DynamicObject {
    /// Create a `DynamicObject` with only kind and name set
    #[must_use]
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                ..ObjectMeta::default()
            },
            ..Self::default()
        }
    }

    /// Attach a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.metadata.namespace = Some(namespace.to_string());
        self
    }

    /// Attach a desired state
    #[must_use]
    pub fn spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }

    /// A reference to this object, carrying its current version as extra information
    #[must_use]
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::from_obj(self)
    }

    /// Every condition recorded under `status.conditions`
    ///
    /// Entries that do not parse as a [`Condition`] are skipped.
    #[must_use]
    pub fn conditions(&self) -> Vec<Condition> {
        self.status
            .get("conditions")
            .and_then(Value::as_array)
            .map(|conds| {
                conds
                    .iter()
                    .filter_map(|c| serde_json::from_value(c.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The condition of the given type, if recorded
    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<Condition> {
        self.conditions().into_iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace the condition with the same type
    ///
    /// Returns `false` without touching the object if an identical condition is already present,
    /// so callers can skip writing an unchanged status.
    pub fn set_condition(&mut self, condition: Condition) -> bool {
        let mut conditions = self.conditions();
        match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) if *existing == condition => return false,
            Some(existing) => *existing = condition,
            None => conditions.push(condition),
        }
        if !self.status.is_object() {
            self.status = Value::Object(serde_json::Map::new());
        }
        if let Some(status) = self.status.as_object_mut() {
            status.insert(
                "conditions".to_string(),
                serde_json::to_value(conditions).unwrap_or(Value::Null),
            );
        }
        true
    }
}

/// One entry of `status.conditions`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Reconciled`
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    /// Machine readable reason
    #[serde(default)]
    pub reason: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// The generation that was observed when the condition was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::{Condition, DynamicObject};
    use serde_json::json;

    fn stalled(generation: i64) -> Condition {
        Condition {
            type_: "Reconciled".into(),
            status: "False".into(),
            reason: "InvalidSpec".into(),
            message: "replicas must be positive".into(),
            observed_generation: Some(generation),
        }
    }

    #[test]
    fn set_condition_inserts_then_replaces() {
        let mut obj = DynamicObject::new("Widget", "a").within("default");
        assert!(obj.conditions().is_empty());
        assert!(obj.set_condition(stalled(1)));
        assert_eq!(obj.condition("Reconciled"), Some(stalled(1)));
        assert!(obj.set_condition(stalled(2)));
        assert_eq!(obj.conditions().len(), 1);
        assert_eq!(obj.condition("Reconciled").unwrap().observed_generation, Some(2));
    }

    #[test]
    fn set_condition_reports_unchanged() {
        let mut obj = DynamicObject::new("Widget", "a");
        obj.set_condition(stalled(3));
        assert!(!obj.set_condition(stalled(3)));
    }

    #[test]
    fn set_condition_keeps_other_status_fields() {
        let mut obj = DynamicObject::new("Widget", "a");
        obj.status = json!({ "replicas": 2 });
        obj.set_condition(stalled(1));
        assert_eq!(obj.status["replicas"], 2);
        assert_eq!(obj.status["conditions"][0]["type"], "Reconciled");
        assert_eq!(obj.status["conditions"][0]["observedGeneration"], 1);
    }

    #[test]
    fn parses_from_yaml() {
        let obj: DynamicObject = serde_yaml::from_str(
            r#"
kind: Widget
metadata:
  name: a
  namespace: prod
  generation: 4
spec:
  size: 3
"#,
        )
        .unwrap();
        assert_eq!(obj.metadata.generation, Some(4));
        assert_eq!(obj.object_ref().to_string(), "Widget/a.prod");
    }
}
