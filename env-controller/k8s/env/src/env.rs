//! Converges each environment request toward exactly one workload and one
//! service, and deletes requests whose lease has run out.

use crate::{Error, Outcome, Reconcile};
use chrono::{DateTime, Utc};
use ephemerator_controller_core::{
    lease::{self, DEFAULT_LEASE},
    lifecycle::DeleteReason,
    ownership::FINALIZER,
    ports::{self, ResourceList},
    spec::EXPIRATION_KEY,
    Allowlist, EnvSpec, Fingerprint, Kind, Lease, Ownership, ServicePort, WorkloadAction,
};
use ephemerator_controller_k8s_api::{
    self as k8s, labels, service, watcher, workload, Api, Client, Cluster, ConfigMap, ExecOutput,
    ExecTarget, Object, Pod, ResourceId, Service,
};
use futures::future;
use kube::runtime::Controller;
use std::{collections::BTreeMap, time::Duration};
use tokio::time;

/// How soon to look again at a workload whose ports are not yet known.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct EnvConfig {
    pub allowlist: Allowlist,
    pub images: workload::Images,

    /// The lease stamped on requests that carry no expiration.
    pub lease: Duration,

    /// Bounds each command run inside a workload.
    pub exec_timeout: Duration,
}

pub struct EnvReconciler<C> {
    cluster: C,
    config: EnvConfig,
}

/// The service an environment should have, as far as this pass can tell.
#[derive(Debug)]
enum Desired {
    Absent,
    Present(Vec<ServicePort>),

    /// Discovery failed; leave the live service alone.
    Unknown,
}

/// Watches requests and the objects derived from them.
pub fn controller(client: Client) -> Controller<ConfigMap> {
    let selector = Kind::Runner.selector();
    let config = || watcher::Config::default().labels(&selector);
    Controller::new(Api::<ConfigMap>::all(client.clone()), config())
        .owns(Api::<Pod>::all(client.clone()), config())
        .owns(Api::<Service>::all(client), config())
}

// === impl EnvConfig ===

impl EnvConfig {
    pub fn new(allowlist: Allowlist, images: workload::Images) -> Self {
        Self {
            allowlist,
            images,
            lease: DEFAULT_LEASE,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }
}

// === impl EnvReconciler ===

#[async_trait::async_trait]
impl<C: Cluster> Reconcile for EnvReconciler<C> {
    const NAME: &'static str = "env";
    const FINALIZER: Option<&'static str> = Some(FINALIZER);

    async fn reconcile(&self, id: &ResourceId) -> Result<Outcome, Error> {
        self.reconcile_at(id, Utc::now()).await
    }

    /// Tears down the workload and removes the service of a request that is
    /// being deleted. Objects we did not create are skipped so that they
    /// cannot hold the request forever.
    async fn cleanup(&self, id: &ResourceId) -> Result<Outcome, Error> {
        let (pod, service) = future::try_join(
            self.cluster.get::<Pod>(&id.namespace, &id.name),
            self.cluster.get::<Service>(&id.namespace, &id.name),
        )
        .await?;

        let pod = pod.filter(is_owned);
        let service = service.filter(is_owned);
        self.reconcile_workload(id, None, pod).await?;
        self.reconcile_service(id, None, service, Desired::Absent)
            .await?;
        Ok(Outcome::done())
    }
}

impl<C: Cluster> EnvReconciler<C> {
    pub fn new(cluster: C, config: EnvConfig) -> Self {
        Self { cluster, config }
    }

    /// Runs one pass for the request named by `id`, as of `now`.
    ///
    /// The request, workload and service are read once up front; each later
    /// step acts on what this pass has observed or written itself. Returns
    /// the earliest time the request must be revisited.
    pub async fn reconcile_at(
        &self,
        id: &ResourceId,
        now: DateTime<Utc>,
    ) -> Result<Outcome, Error> {
        let (request, pod, service) = future::try_join3(
            self.cluster.get::<ConfigMap>(&id.namespace, &id.name),
            self.cluster.get::<Pod>(&id.namespace, &id.name),
            self.cluster.get::<Service>(&id.namespace, &id.name),
        )
        .await?;

        // Objects that share a name with the request but that we did not
        // create are never touched.
        check_owned(id, pod.as_ref())?;
        check_owned(id, service.as_ref())?;

        // A request that is being deleted is already gone as far as its
        // workload is concerned.
        let request = request
            .filter(|cm| is_owned(cm) && cm.metadata.deletion_timestamp.is_none());

        let (request, lease) = match request {
            Some(request) => self.reconcile_lease(id, request, now).await?,
            None => (None, None),
        };

        let ready = self.reconcile_workload(id, request.as_ref(), pod).await?;

        let (desired, discovery) = match (request.as_ref(), ready) {
            (Some(_), Some(pod)) => self.discover(&pod).await,
            _ => (Desired::Absent, None),
        };
        self.reconcile_service(id, request.as_ref(), service, desired)
            .await?;

        let outcome = Outcome {
            requeue_after: lease,
        };
        Ok(outcome.or_sooner(discovery))
    }

    /// Stamps an expiration on a fresh request or deletes an expired one.
    /// Returns the request if it is still live, and how long until its lease
    /// must be checked again.
    async fn reconcile_lease(
        &self,
        id: &ResourceId,
        mut request: ConfigMap,
        now: DateTime<Utc>,
    ) -> Result<(Option<ConfigMap>, Option<Duration>), Error> {
        let expiration = request
            .data
            .as_ref()
            .and_then(|data| data.get(EXPIRATION_KEY))
            .map(String::as_str);

        match Lease::observe(expiration, now) {
            lease @ Lease::Active { .. } => {
                let remaining = lease.remaining(now);
                Ok((Some(request), remaining))
            }

            Lease::Unset => {
                let (expires_at, encoded) = lease::stamp(now, self.config.lease);
                tracing::info!(expiration = %encoded, "Setting expiration");
                request
                    .data
                    .get_or_insert_with(Default::default)
                    .insert(EXPIRATION_KEY.to_string(), encoded);
                let request = self.cluster.replace(&id.namespace, &request).await?;
                Ok((Some(request), (expires_at - now).to_std().ok()))
            }

            Lease::Expired(reason) => {
                tracing::info!(%reason, "Deleting expired request");
                self.cluster
                    .delete::<ConfigMap>(&id.namespace, &id.name)
                    .await?;
                Ok((None, None))
            }
        }
    }

    /// Moves the workload one step toward the request. Returns the workload
    /// only when it matches the request and is ready to serve.
    async fn reconcile_workload(
        &self,
        id: &ResourceId,
        request: Option<&ConfigMap>,
        pod: Option<Pod>,
    ) -> Result<Option<Pod>, Error> {
        let empty = BTreeMap::new();
        let desired = request
            .map(|cm| Fingerprint::of(cm.data.as_ref().unwrap_or(&empty)))
            .transpose()?;

        match workload::state(pod.as_ref()).plan(desired.as_ref()) {
            WorkloadAction::Idle => Ok(None),

            WorkloadAction::Keep { ready } => Ok(pod.filter(|_| ready)),

            WorkloadAction::AwaitTermination => {
                tracing::debug!("Waiting for workload to terminate");
                Ok(None)
            }

            WorkloadAction::Delete { reason, teardown } => {
                if let Some(pod) = pod {
                    self.delete_workload(id, &pod, reason, teardown).await?;
                }
                Ok(None)
            }

            WorkloadAction::Create => {
                if let (Some(request), Some(fingerprint)) = (request, desired.as_ref()) {
                    self.create_workload(id, request, fingerprint).await?;
                }
                Ok(None)
            }
        }
    }

    async fn create_workload(
        &self,
        id: &ResourceId,
        request: &ConfigMap,
        fingerprint: &Fingerprint,
    ) -> Result<(), Error> {
        let spec = request
            .data
            .as_ref()
            .map(EnvSpec::from_data)
            .unwrap_or_default();
        if let Err(error) = self.config.allowlist.is_allowed(&spec) {
            tracing::info!(%error, repo = %spec.repo, branch = %spec.branch, "Ignoring request");
            return Ok(());
        }

        let pod = workload::build(request, &spec, fingerprint, &self.config.images)?;
        tracing::info!(repo = %spec.repo, branch = %spec.branch, path = %spec.path, "Creating workload");
        self.cluster.create(&id.namespace, &pod).await?;
        Ok(())
    }

    async fn delete_workload(
        &self,
        id: &ResourceId,
        pod: &Pod,
        reason: DeleteReason,
        teardown: bool,
    ) -> Result<(), Error> {
        tracing::info!(%reason, "Deleting workload");

        // A nested cluster that cannot be torn down must not keep its pod
        // alive, so failures here are only logged.
        if teardown {
            let target = workload::exec_target(pod);
            if let Err(error) = self.exec(&target, workload::teardown_command()).await {
                tracing::warn!(%error, "Failed to tear down nested cluster");
            }
        }

        self.cluster.delete::<Pod>(&id.namespace, &id.name).await?;
        Ok(())
    }

    /// Asks a ready workload which ports it serves. Returns the desired
    /// service along with a follow-up when the answer may still change.
    async fn discover(&self, pod: &Pod) -> (Desired, Option<Duration>) {
        let target = workload::exec_target(pod);
        let output = match self.exec(&target, ports::introspection_command()).await {
            Ok(output) => output,
            Err(error) => {
                tracing::warn!(%error, "Failed to list workload resources");
                return (Desired::Unknown, Some(DISCOVERY_INTERVAL));
            }
        };

        let resources = match ResourceList::parse(&output.stdout) {
            Ok(resources) => resources,
            Err(error) => {
                tracing::warn!(%error, "Failed to parse workload resources");
                return (Desired::Unknown, Some(DISCOVERY_INTERVAL));
            }
        };

        let follow_up = resources.has_pending().then_some(DISCOVERY_INTERVAL);
        (Desired::Present(resources.service_ports()), follow_up)
    }

    async fn reconcile_service(
        &self,
        id: &ResourceId,
        request: Option<&ConfigMap>,
        live: Option<Service>,
        desired: Desired,
    ) -> Result<(), Error> {
        match (live, desired, request) {
            (_, Desired::Unknown, _) | (None, Desired::Absent, _) => Ok(()),

            (Some(_), Desired::Absent, _) => {
                tracing::info!("Deleting service");
                self.cluster
                    .delete::<Service>(&id.namespace, &id.name)
                    .await?;
                Ok(())
            }

            (None, Desired::Present(ports), Some(request)) => {
                let svc = service::build(request, &ports)?;
                tracing::info!(ports = ports.len(), "Creating service");
                self.cluster.create(&id.namespace, &svc).await?;
                Ok(())
            }

            (Some(live), Desired::Present(ports), _) => {
                if ports::same_ports(&service::ports(&live), &ports) {
                    return Ok(());
                }
                tracing::info!(ports = ports.len(), "Updating service");
                self.cluster
                    .replace(&id.namespace, &service::with_ports(&live, &ports))
                    .await?;
                Ok(())
            }

            // Discovery only runs for live requests.
            (None, Desired::Present(_), None) => Ok(()),
        }
    }

    async fn exec(
        &self,
        target: &ExecTarget,
        command: Vec<String>,
    ) -> Result<ExecOutput, k8s::Error> {
        let exec = self.cluster.exec(target, command);
        match time::timeout(self.config.exec_timeout, exec).await {
            Ok(res) => res,
            Err(_) => Err(k8s::Error::ExecFailed {
                pod: target.pod.clone(),
                container: target.container.clone(),
                message: format!("timed out after {:?}", self.config.exec_timeout),
            }),
        }
    }
}

fn is_owned<K: Object>(obj: &K) -> bool {
    Ownership::check(Kind::Runner, labels(obj)).is_ok()
}

fn check_owned<K: Object>(id: &ResourceId, obj: Option<&K>) -> Result<(), Error> {
    let Some(obj) = obj else {
        return Ok(());
    };
    Ownership::check(Kind::Runner, labels(obj)).map_err(|conflict| Error::Conflict {
        kind: K::kind(&()).to_string(),
        id: id.clone(),
        conflict,
    })?;
    Ok(())
}
