//! Types for the per-cluster list and watch api
use crate::object::DynamicObject;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// An opaque position in a cluster's change history
///
/// Positions are handed out by [`ObjectList`] and by every [`WatchEvent`], and are passed back to
/// resume a watch where it left off. They are only meaningful to the cluster that issued them.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    /// The raw representation handed out by the cluster
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Position {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Position {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The result of listing one kind in one cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ObjectList {
    /// Every object of the kind that currently exists
    pub items: Vec<DynamicObject>,
    /// Position to resume watching from, so that nothing between the list and the watch is lost
    pub position: Position,
}

/// A raw event returned from a watch
#[derive(Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    /// Object was added
    Added(DynamicObject),
    /// Object was modified
    Modified(DynamicObject),
    /// Object was deleted
    Deleted(DynamicObject),
    /// Progress notification, carries no object but advances the resume position
    Bookmark(Position),
}

impl WatchEvent {
    /// The position this event moves the watch to, if any
    #[must_use]
    pub fn position(&self) -> Option<Position> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                obj.metadata.resource_version.clone().map(Position::from)
            }
            WatchEvent::Bookmark(pos) => Some(pos.clone()),
        }
    }
}

impl Debug for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            WatchEvent::Added(_) => write!(f, "Added event"),
            WatchEvent::Modified(_) => write!(f, "Modified event"),
            WatchEvent::Deleted(_) => write!(f, "Deleted event"),
            WatchEvent::Bookmark(pos) => write!(f, "Bookmark event at {pos}"),
        }
    }
}
