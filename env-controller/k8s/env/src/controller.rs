use crate::{backoff::Backoff, metrics::Metrics, ControllerMetrics, Error};
use ephemerator_controller_k8s_api::{Action, Api, Client, Object, ResourceExt, ResourceId};
use futures::prelude::*;
use kube::runtime::{
    finalizer::{self, finalizer},
    Controller,
};
use std::{sync::Arc, time::Duration};
use tracing::{info_span, Instrument};

/// One convergence step for a single object, identified by the namespace and
/// name of the object that triggered it.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Names the controller in logs and metrics.
    const NAME: &'static str;

    /// When set, every watched object carries this finalizer and is only
    /// released once [`Reconcile::cleanup`] succeeds for it.
    const FINALIZER: Option<&'static str> = None;

    async fn reconcile(&self, id: &ResourceId) -> Result<Outcome, Error>;

    /// Releases what was derived from an object that is being deleted.
    async fn cleanup(&self, _id: &ResourceId) -> Result<Outcome, Error> {
        Ok(Outcome::done())
    }
}

/// The result of a successful pass: when, if ever, the object must be
/// revisited even if nothing about it changes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

struct Context<R> {
    client: Client,
    reconciler: R,
    backoff: Backoff,
    metrics: Metrics,
}

// === impl Outcome ===

impl Outcome {
    pub fn done() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Combines follow-ups, keeping the earliest.
    pub fn or_sooner(self, delay: Option<Duration>) -> Self {
        let requeue_after = match (self.requeue_after, delay) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self { requeue_after }
    }

    fn into_action(self) -> Action {
        match self.requeue_after {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        }
    }
}

/// Drives `controller` with `reconciler` until the watch streams end.
///
/// The controller runs at most one pass per object at a time and coalesces
/// events that arrive while a pass is in flight. Failed passes are retried
/// with a per-object exponential backoff; conflicts are not retried until the
/// object changes.
pub async fn run<K, R>(
    controller: Controller<K>,
    client: Client,
    reconciler: R,
    metrics: ControllerMetrics,
) where
    K: Object,
    R: Reconcile,
{
    let ctx = Arc::new(Context {
        client,
        reconciler,
        backoff: Backoff::default(),
        metrics: metrics.controller(R::NAME),
    });

    controller
        .run(reconcile::<K, R>, error_policy::<K, R>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => tracing::trace!(%obj, "Reconciled"),
                Err(error) => tracing::debug!(%error, "Controller error"),
            }
        })
        .await;
}

async fn reconcile<K, R>(obj: Arc<K>, ctx: Arc<Context<R>>) -> Result<Action, Error>
where
    K: Object,
    R: Reconcile,
{
    let id = resource_id(&*obj);
    ctx.metrics.reconciles.inc();

    let span = info_span!("reconcile", namespace = %id.namespace, name = %id.name);
    match pass(obj, &id, &ctx).instrument(span).await {
        Ok(action) => {
            ctx.backoff.reset(&id);
            Ok(action)
        }
        Err(error) if !error.is_retryable() => {
            tracing::warn!(%id, %error, "Not reconciling until the object changes");
            ctx.metrics.conflicts.inc();
            ctx.backoff.reset(&id);
            Ok(Action::await_change())
        }
        Err(error) => Err(error),
    }
}

async fn pass<K, R>(obj: Arc<K>, id: &ResourceId, ctx: &Context<R>) -> Result<Action, Error>
where
    K: Object,
    R: Reconcile,
{
    let Some(name) = R::FINALIZER else {
        return ctx.reconciler.reconcile(id).await.map(Outcome::into_action);
    };

    // Adds the finalizer to new objects and removes it once cleanup has
    // succeeded for a deleted one.
    let api = Api::<K>::namespaced(ctx.client.clone(), &id.namespace);
    finalizer(&api, name, obj, |event| dispatch(&ctx.reconciler, id, event))
        .await
        .map_err(Error::from)
}

/// Runs the pass that a finalizer event calls for.
pub(crate) async fn dispatch<K, R>(
    reconciler: &R,
    id: &ResourceId,
    event: finalizer::Event<K>,
) -> Result<Action, Error>
where
    R: Reconcile,
{
    let outcome = match event {
        finalizer::Event::Apply(_) => reconciler.reconcile(id).await?,
        finalizer::Event::Cleanup(_) => {
            tracing::info!("Cleaning up deleted object");
            reconciler.cleanup(id).await?
        }
    };
    Ok(outcome.into_action())
}

fn error_policy<K, R>(obj: Arc<K>, error: &Error, ctx: Arc<Context<R>>) -> Action
where
    K: Object,
    R: Reconcile,
{
    let id = resource_id(&*obj);
    ctx.metrics.errors.inc();
    let delay = ctx.backoff.next(&id);
    tracing::warn!(%id, %error, ?delay, "Reconcile failed");
    Action::requeue(delay)
}

fn resource_id<K: kube::Resource>(obj: &K) -> ResourceId {
    ResourceId::new(obj.namespace().unwrap_or_default(), obj.name_any())
}
