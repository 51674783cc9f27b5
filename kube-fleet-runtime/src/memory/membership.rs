use crate::membership::{MembershipSource, SourceError, SourceEvent};
use async_trait::async_trait;
use futures::{stream, stream::BoxStream, StreamExt};
use kube_fleet_core::{ClusterHandle, ClusterId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Clone, Debug)]
enum Signal {
    Change(SourceEvent),
    Disconnect,
}

#[derive(Default)]
struct State {
    clusters: BTreeMap<ClusterId, ClusterHandle>,
    failure: Option<SourceError>,
}

/// An in-process [`MembershipSource`] that tests and demos can mutate at will
///
/// Changes made through [`add`](Self::add) and [`remove`](Self::remove) are pushed to
/// subscribers, the `*_silently` variants only show up in the next list, as if the notification
/// had been lost.
pub struct MemoryMembership {
    state: Mutex<State>,
    signals: broadcast::Sender<Signal>,
}

impl Default for MemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMembership {
    /// A source with no clusters
    #[must_use]
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            signals,
        }
    }

    /// Add a cluster and notify subscribers
    pub fn add(&self, handle: ClusterHandle) {
        self.add_silently(handle.clone());
        let _ = self.signals.send(Signal::Change(SourceEvent::Added(handle)));
    }

    /// Remove a cluster and notify subscribers
    pub fn remove(&self, id: &ClusterId) {
        if self.remove_silently(id) {
            let _ = self.signals.send(Signal::Change(SourceEvent::Removed(id.clone())));
        }
    }

    /// Add a cluster without notifying subscribers
    pub fn add_silently(&self, handle: ClusterHandle) {
        self.state.lock().clusters.insert(handle.id().clone(), handle);
    }

    /// Remove a cluster without notifying subscribers, returning whether it existed
    #[must_use]
    pub fn remove_silently(&self, id: &ClusterId) -> bool {
        self.state.lock().clusters.remove(id).is_some()
    }

    /// Fail every call with `err` until [`recover`](Self::recover) is called
    ///
    /// Open subscriptions end.
    pub fn fail_with(&self, err: SourceError) {
        self.state.lock().failure = Some(err);
        let _ = self.signals.send(Signal::Disconnect);
    }

    /// Stop failing
    pub fn recover(&self) {
        self.state.lock().failure = None;
    }

    fn check(&self) -> Result<(), SourceError> {
        match &self.state.lock().failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MembershipSource for MemoryMembership {
    async fn list_clusters(&self) -> Result<Vec<ClusterHandle>, SourceError> {
        self.check()?;
        Ok(self.state.lock().clusters.values().cloned().collect())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Result<SourceEvent, SourceError>>, SourceError> {
        self.check()?;
        let signals = self.signals.subscribe();
        let changes = stream::unfold(Some(signals), |signals| async move {
            let mut signals = signals?;
            match signals.recv().await {
                Ok(Signal::Change(event)) => Some((Ok(event), Some(signals))),
                Ok(Signal::Disconnect) | Err(RecvError::Closed) => None,
                Err(RecvError::Lagged(_)) => {
                    let err = SourceError::Unavailable("subscription fell behind".into());
                    Some((Err(err), None))
                }
            }
        });
        Ok(changes.boxed())
    }
}
