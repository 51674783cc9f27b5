use async_trait::async_trait;
use kube_fleet_core::{ClusterHandle, DynamicObject, ResourceKey};
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;

/// Results of the reconciliation attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    /// Whether (and when) to next trigger the reconciliation if no watch event triggers it first
    ///
    /// Use this to poll external systems for updates or to expire time-limited resources.
    /// Requeueing is not a failure and does not count towards the retry backoff.
    pub requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Do nothing until the object changes
    #[must_use]
    pub fn await_change() -> Self {
        Self::default()
    }
}

/// How a reconciliation failed
#[derive(Error, Debug)]
pub enum ReconcileError<E: std::error::Error + 'static> {
    /// Retried with exponential backoff until it succeeds
    #[error("reconcile failed: {0}")]
    Retryable(#[source] E),
    /// Not retried until the object's spec changes
    ///
    /// Recorded on the object as a `Reconciled=False` status condition.
    #[error("reconcile failed permanently ({reason}): {message}")]
    Terminal {
        /// A short CamelCase reason, recorded as the condition's reason
        reason: String,
        /// Human readable details
        message: String,
    },
}

impl<E: std::error::Error + 'static> ReconcileError<E> {
    /// A failure that retrying cannot fix
    #[must_use]
    pub fn terminal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Terminal {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Whether the failure will be retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl<E: std::error::Error + 'static> From<E> for ReconcileError<E> {
    fn from(err: E) -> Self {
        Self::Retryable(err)
    }
}

/// Everything a [`Reconciler`] gets to work with
///
/// The object is read from its cluster right before the reconciler is called, so it reflects the
/// current state rather than whatever event triggered the reconciliation.
#[derive(Clone, Debug)]
pub struct Request {
    /// The object to reconcile
    pub key: ResourceKey,
    /// The current state of the object, `None` if it no longer exists
    pub object: Option<DynamicObject>,
    /// The cluster the object lives in, to read and write through
    pub cluster: ClusterHandle,
    /// How many consecutive attempts failed before this one
    pub attempts: u32,
}

impl Request {
    /// The status last written to the object, if any
    #[must_use]
    pub fn previous_status(&self) -> Option<&Value> {
        self.object.as_ref().map(|obj| &obj.status).filter(|status| !status.is_null())
    }
}

/// The pluggable business logic of a controller
///
/// Must be idempotent: reconciling an object whose observed state did not change must not cause
/// further external changes. It is called concurrently for distinct keys, but never concurrently
/// for the same key.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Errors the reconciler can fail with
    type Error: std::error::Error + Send + Sync + 'static;

    /// Move the object towards its desired state
    async fn reconcile(&self, request: Request) -> Result<Action, ReconcileError<Self::Error>>;
}

/// A context data type that's passed through to reconciliations of a [`reconciler_fn`]
///
/// More or less the same as Actix's [`Data`](https://docs.rs/actix-web/3.x/actix_web/web/struct.Data.html).
#[derive(Debug)]
pub struct Context<T>(Arc<T>);

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Context<T> {
    /// Create new `Context` instance.
    #[must_use]
    pub fn new(state: T) -> Context<T> {
        Context(Arc::new(state))
    }

    /// Get reference to inner controller data.
    #[must_use]
    pub fn get_ref(&self) -> &T {
        self.0.as_ref()
    }

    /// Convert to the internal `Arc<T>`.
    #[must_use]
    pub fn into_inner(self) -> Arc<T> {
        self.0
    }
}

/// A [`Reconciler`] made from an async function, see [`reconciler_fn`]
pub struct ReconcilerFn<F, T> {
    f: F,
    context: Context<T>,
}

/// Use an async function taking a [`Request`] and a [`Context`] as the [`Reconciler`]
///
/// ```
/// use kube_fleet_runtime::controller::{reconciler_fn, Action, Context, ReconcileError, Request};
/// use std::time::Duration;
///
/// async fn reconcile(req: Request, _ctx: Context<()>) -> Result<Action, ReconcileError<std::io::Error>> {
///     match req.object {
///         Some(_) => Ok(Action::requeue(Duration::from_secs(300))),
///         None => Ok(Action::await_change()),
///     }
/// }
/// let reconciler = reconciler_fn(reconcile, Context::new(()));
/// ```
#[must_use]
pub fn reconciler_fn<F, Fut, T, E>(f: F, context: Context<T>) -> ReconcilerFn<F, T>
where
    F: Fn(Request, Context<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, ReconcileError<E>>> + Send,
    T: Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    ReconcilerFn { f, context }
}

#[async_trait]
impl<F, Fut, T, E> Reconciler for ReconcilerFn<F, T>
where
    F: Fn(Request, Context<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, ReconcileError<E>>> + Send,
    T: Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn reconcile(&self, request: Request) -> Result<Action, ReconcileError<E>> {
        (self.f)(request, self.context.clone()).await
    }
}
