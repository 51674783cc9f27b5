//! Watches one resource kind in one cluster for changes, with error recovery

use futures::{stream::BoxStream, Stream, StreamExt};
use kube_fleet_core::{ClusterClient, ClusterError, DynamicObject, Position, WatchEvent};
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Errors returned by the [`watcher`]
///
/// None of them are fatal, the watcher recovers on the next poll.
#[derive(Error, Debug)]
pub enum Error {
    /// Listing the current objects failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] ClusterError),
    /// Opening the change subscription failed
    #[error("failed to start watching objects: {0}")]
    WatchStartFailed(#[source] ClusterError),
    /// The change subscription broke while running
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] ClusterError),
    /// The cluster no longer retains history from the resume position, a re-list follows
    #[error("watch position {0} has expired")]
    PositionExpired(Position),
}

impl Error {
    /// Whether the watcher will recover by re-listing rather than by resuming
    #[must_use]
    pub fn is_position_expired(&self) -> bool {
        matches!(self, Error::PositionExpired(_))
    }
}

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
/// Watch events returned from the [`watcher`]
pub enum Event {
    /// An object was added or modified
    Applied(DynamicObject),
    /// An object was deleted
    ///
    /// NOTE: Deletions may be missed while the watcher is recovering, `Restarted` is the only
    /// reliable signal for them.
    Deleted(DynamicObject),
    /// The watch was restarted from a fresh list, so `Deleted` events may have been missed
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<DynamicObject>),
}

/// The internal finite state machine driving the [`watcher`]
enum State {
    /// The next poll will start a full LIST to get all existing objects
    Empty,
    /// The LIST was successful, so we should move on to starting the actual watch
    InitListed { position: Position },
    /// The watch is in progress, from this point we just return events from the cluster
    ///
    /// If the connection is disrupted we resume from the last seen position by returning to
    /// `InitListed`. If the position has expired we propagate the error and re-list with `Empty`.
    Watching {
        position: Position,
        stream: BoxStream<'static, kube_fleet_core::Result<WatchEvent>>,
    },
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Empty => f.write_str("Empty"),
            State::InitListed { position } => f.debug_struct("InitListed").field("position", position).finish(),
            State::Watching { position, .. } => f.debug_struct("Watching").field("position", position).finish(),
        }
    }
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined(client: &dyn ClusterClient, kind: &str, state: State) -> (Option<Result<Event>>, State) {
    match state {
        State::Empty => match client.list(kind).await {
            Ok(list) => (Some(Ok(Event::Restarted(list.items))), State::InitListed {
                position: list.position,
            }),
            Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
        },
        State::InitListed { position } => match client.watch(kind, &position).await {
            Ok(stream) => (None, State::Watching { position, stream }),
            Err(ClusterError::PositionExpired(_)) => (Some(Err(Error::PositionExpired(position))), State::Empty),
            Err(err) => (Some(Err(Error::WatchStartFailed(err))), State::InitListed { position }),
        },
        State::Watching { position, mut stream } => match stream.next().await {
            Some(Ok(event)) => {
                let position = event.position().unwrap_or(position);
                let event = match event {
                    WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Some(Ok(Event::Applied(obj))),
                    WatchEvent::Deleted(obj) => Some(Ok(Event::Deleted(obj))),
                    WatchEvent::Bookmark(_) => None,
                };
                (event, State::Watching { position, stream })
            }
            // we have fallen out of the cluster's history and need to start over
            Some(Err(ClusterError::PositionExpired(_))) => {
                (Some(Err(Error::PositionExpired(position))), State::Empty)
            }
            Some(Err(err)) => (Some(Err(Error::WatchFailed(err))), State::InitListed { position }),
            None => (None, State::InitListed { position }),
        },
    }
}

/// Trampoline helper for `step_trampolined`
async fn step(client: &dyn ClusterClient, kind: &str, mut state: State) -> (Result<Event>, State) {
    loop {
        match step_trampolined(client, kind, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches one resource kind in one cluster continuously
///
/// Compared to [`ClusterClient::watch`], this automatically tries to recover the stream upon errors.
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery
/// mode on the next poll. Apply your own backoff by not polling the stream for a duration after
/// errors, for example with [`WatchRetry`](crate::utils::WatchRetry).
///
/// # Recovery
///
/// If the watch connection is interrupted then we restart the watch from the last position seen on
/// the stream, and the stream is simply resumed from where it left off. If that fails because the
/// position is no longer retained by the cluster then an [`Error::PositionExpired`] is emitted and
/// the watcher starts over with a full list, emitted as an [`Event::Restarted`].
#[must_use]
pub fn watcher(client: Arc<dyn ClusterClient>, kind: impl Into<String>) -> impl Stream<Item = Result<Event>> + Send {
    futures::stream::unfold(
        (client, kind.into(), State::Empty),
        |(client, kind, state)| async move {
            let (event, state) = step(client.as_ref(), &kind, state).await;
            tracing::trace!(%kind, ?state, "watcher stepped");
            Some((event, (client, kind, state)))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::{watcher, Error, Event};
    use crate::memory::MemoryCluster;
    use futures::{pin_mut, poll, StreamExt};
    use kube_fleet_core::{ClusterClient, DynamicObject};
    use std::sync::Arc;

    fn names(objs: &[DynamicObject]) -> Vec<&str> {
        objs.iter().map(|obj| obj.metadata.name.as_str()).collect()
    }

    #[tokio::test]
    async fn lists_then_follows_changes() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.create(DynamicObject::new("Widget", "a")).await.unwrap();
        let stream = watcher(cluster.clone(), "Widget");
        pin_mut!(stream);

        match stream.next().await.unwrap().unwrap() {
            Event::Restarted(objs) => assert_eq!(names(&objs), ["a"]),
            other => panic!("expected a restart, got {other:?}"),
        }
        assert!(poll!(stream.next()).is_pending());

        cluster.create(DynamicObject::new("Widget", "b")).await.unwrap();
        cluster.create(DynamicObject::new("Gadget", "ignored")).await.unwrap();
        match stream.next().await.unwrap().unwrap() {
            Event::Applied(obj) => assert_eq!(obj.metadata.name, "b"),
            other => panic!("expected an apply, got {other:?}"),
        }
        cluster.delete(&DynamicObject::new("Widget", "a").object_ref()).await.unwrap();
        match stream.next().await.unwrap().unwrap() {
            Event::Deleted(obj) => assert_eq!(obj.metadata.name, "a"),
            other => panic!("expected a delete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resumes_without_relisting_after_a_disconnect() {
        let cluster = Arc::new(MemoryCluster::new());
        let stream = watcher(cluster.clone(), "Widget");
        pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(Ok(Event::Restarted(_)))));
        assert!(poll!(stream.next()).is_pending());

        cluster.disconnect_watches();
        cluster.create(DynamicObject::new("Widget", "a")).await.unwrap();
        match stream.next().await.unwrap().unwrap() {
            Event::Applied(obj) => assert_eq!(obj.metadata.name, "a"),
            other => panic!("expected the missed apply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relists_when_the_position_expired() {
        let cluster = Arc::new(MemoryCluster::new());
        let stream = watcher(cluster.clone(), "Widget");
        pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(Ok(Event::Restarted(_)))));
        assert!(poll!(stream.next()).is_pending());

        cluster.disconnect_watches();
        cluster.create(DynamicObject::new("Widget", "a")).await.unwrap();
        cluster.compact();
        assert!(matches!(stream.next().await, Some(Err(Error::PositionExpired(_)))));
        match stream.next().await.unwrap().unwrap() {
            Event::Restarted(objs) => assert_eq!(names(&objs), ["a"]),
            other => panic!("expected a restart, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_failures_are_retried_on_the_next_poll() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_unreachable(true);
        let stream = watcher(cluster.clone(), "Widget");
        pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(Err(Error::InitialListFailed(_)))));
        cluster.set_unreachable(false);
        assert!(matches!(stream.next().await, Some(Ok(Event::Restarted(_)))));
    }
}
