use super::{
    reconciler::{ReconcileError, Reconciler, Request},
    Clusters,
};
use crate::queue::{Claim, Outcome, WorkQueue};
use kube_fleet_core::{ClusterHandle, Condition, DynamicObject, ObjectRef};
use std::sync::Arc;

/// The condition terminal failures are recorded under
pub(crate) const RECONCILED: &str = "Reconciled";

/// One member of the worker pool
///
/// Workers share nothing but the queue, the cluster registry and the reconciler.
pub(super) struct Worker<R> {
    pub(super) id: usize,
    pub(super) queue: WorkQueue,
    pub(super) clusters: Clusters,
    pub(super) reconciler: Arc<R>,
}

impl<R: Reconciler> Worker<R> {
    /// Process keys until the queue shuts down
    pub(super) async fn run(self) {
        tracing::debug!(worker = self.id, "worker started");
        while let Some(claim) = self.queue.get().await {
            let outcome = tokio::select! {
                biased;
                () = claim.cancelled() => None,
                outcome = self.process(&claim) => Some(outcome),
            };
            match outcome {
                Some(outcome) => self.queue.done(claim, &outcome),
                None => {
                    tracing::debug!(worker = self.id, key = %claim.key(), "reconcile cancelled");
                    self.queue.done(claim, &Outcome::Failure);
                }
            }
        }
        tracing::debug!(worker = self.id, "worker stopped");
    }

    #[tracing::instrument(skip_all, fields(worker = self.id, key = %claim.key(), attempt = claim.attempts()))]
    async fn process(&self, claim: &Claim) -> Outcome {
        let key = claim.key();
        let Some(cluster) = self.clusters.get(&key.cluster) else {
            tracing::debug!("cluster is no longer part of the fleet, dropping key");
            return Outcome::Terminal;
        };
        let object = match cluster.client().get(&key.object).await {
            Ok(object) => object,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read current state");
                return Outcome::Failure;
            }
        };
        if object.as_ref().is_some_and(failed_at_current_generation) {
            tracing::debug!("terminal failure already recorded for this generation, skipping");
            return Outcome::Success;
        }

        let request = Request {
            key: key.clone(),
            object,
            cluster: cluster.clone(),
            attempts: claim.attempts(),
        };
        match self.reconciler.reconcile(request).await {
            Ok(action) => {
                clear_terminal(&cluster, &key.object).await;
                tracing::debug!(requeue_after = ?action.requeue_after, "reconciled");
                match action.requeue_after {
                    Some(delay) => Outcome::Requeue(delay),
                    None => Outcome::Success,
                }
            }
            Err(ReconcileError::Retryable(err)) => {
                tracing::warn!(error = %err, "reconcile failed, retrying with backoff");
                Outcome::Failure
            }
            Err(ReconcileError::Terminal { reason, message }) => {
                tracing::warn!(%reason, %message, "reconcile failed permanently");
                record_terminal(&cluster, &key.object, reason, message).await
            }
        }
    }
}

/// Whether a terminal failure was recorded against the object's current spec
fn failed_at_current_generation(obj: &DynamicObject) -> bool {
    obj.condition(RECONCILED).is_some_and(|cond| {
        cond.status == "False" && cond.observed_generation.is_some() && cond.observed_generation == obj.metadata.generation
    })
}

/// Write a `Reconciled=False` condition
///
/// If the write fails the key is retried, otherwise it is dropped until the next change.
async fn record_terminal(cluster: &ClusterHandle, obj_ref: &ObjectRef, reason: String, message: String) -> Outcome {
    let mut obj = match cluster.client().get(obj_ref).await {
        Ok(Some(obj)) => obj,
        // nothing left to record the failure on
        Ok(None) => return Outcome::Terminal,
        Err(err) => {
            tracing::warn!(error = %err, "failed to read object to record terminal failure");
            return Outcome::Failure;
        }
    };
    let condition = Condition {
        type_: RECONCILED.to_string(),
        status: "False".to_string(),
        reason,
        message,
        observed_generation: obj.metadata.generation,
    };
    if !obj.set_condition(condition) {
        return Outcome::Terminal;
    }
    match cluster.client().update_status(obj).await {
        Ok(_) => Outcome::Terminal,
        Err(err) => {
            tracing::warn!(error = %err, "failed to record terminal failure");
            Outcome::Failure
        }
    }
}

/// Flip a recorded terminal failure back to `Reconciled=True` after a successful reconcile
async fn clear_terminal(cluster: &ClusterHandle, obj_ref: &ObjectRef) {
    let mut obj = match cluster.client().get(obj_ref).await {
        Ok(Some(obj)) => obj,
        Ok(None) => return,
        Err(err) => {
            tracing::debug!(error = %err, "failed to read object to clear terminal failure");
            return;
        }
    };
    if obj.condition(RECONCILED).is_none_or(|cond| cond.status != "False") {
        return;
    }
    let generation = obj.metadata.generation;
    obj.set_condition(Condition {
        type_: RECONCILED.to_string(),
        status: "True".to_string(),
        reason: "Reconciled".to_string(),
        message: String::new(),
        observed_generation: generation,
    });
    if let Err(err) = cluster.client().update_status(obj).await {
        tracing::warn!(error = %err, "failed to clear terminal failure");
    }
}
