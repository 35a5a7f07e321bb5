//! Keeps each gateway ingress routing to every port of every environment's
//! service.

use crate::{Error, Outcome, Reconcile};
use ahash::AHashSet as HashSet;
use ephemerator_controller_core::{routes, Kind, Ownership};
use ephemerator_controller_k8s_api::{
    ingress, labels, service, watcher, Api, Client, Cluster, Ingress, ObjectRef, Resource,
    ResourceExt, ResourceId, Service,
};
use kube::runtime::Controller;
use parking_lot::Mutex;
use std::sync::Arc;

/// The gateways seen by the most recent passes. Any change to a derived
/// service triggers a pass for each of them.
#[derive(Clone, Debug, Default)]
pub struct TrackedGateways(Arc<Mutex<HashSet<ResourceId>>>);

pub struct GatewayReconciler<C> {
    cluster: C,
    base_domain: String,
    tracked: TrackedGateways,
}

/// Watches gateways, and derived services on their behalf.
///
/// A service change maps to every tracked gateway that is still in the
/// controller's cache. Gateways that have left the cache were deleted or
/// relabelled and will never be reconciled again, so they are forgotten.
pub fn controller(client: Client, tracked: TrackedGateways) -> Controller<Ingress> {
    let gateways = watcher::Config::default().labels(&Kind::Gateway.selector());
    let services = watcher::Config::default().labels(&Kind::Runner.selector());
    let controller = Controller::new(Api::<Ingress>::all(client.clone()), gateways);
    let store = controller.store();
    controller.watches(Api::<Service>::all(client), services, move |_: Service| {
        tracked.live_refs(|gateway| store.get(gateway).is_some())
    })
}

// === impl TrackedGateways ===

impl TrackedGateways {
    pub fn track(&self, id: ResourceId) {
        self.0.lock().insert(id);
    }

    pub fn forget(&self, id: &ResourceId) {
        self.0.lock().remove(id);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &ResourceId) -> bool {
        self.0.lock().contains(id)
    }

    /// References to every tracked gateway for which `is_live` holds, in a
    /// stable order. The rest are forgotten.
    pub fn live_refs(
        &self,
        is_live: impl Fn(&ObjectRef<Ingress>) -> bool,
    ) -> Vec<ObjectRef<Ingress>> {
        let mut ids = {
            let mut tracked = self.0.lock();
            tracked.retain(|id| {
                let live = is_live(&gateway_ref(id));
                if !live {
                    tracing::debug!(%id, "Forgetting gateway");
                }
                live
            });
            tracked.iter().cloned().collect::<Vec<_>>()
        };
        ids.sort();
        ids.iter().map(gateway_ref).collect()
    }
}

fn gateway_ref(id: &ResourceId) -> ObjectRef<Ingress> {
    ObjectRef::new(&id.name).within(&id.namespace)
}

// === impl GatewayReconciler ===

#[async_trait::async_trait]
impl<C: Cluster> Reconcile for GatewayReconciler<C> {
    const NAME: &'static str = "gateway";

    async fn reconcile(&self, id: &ResourceId) -> Result<Outcome, Error> {
        let gateway = match self.cluster.get::<Ingress>(&id.namespace, &id.name).await? {
            Some(gateway) => gateway,
            None => {
                self.tracked.forget(id);
                return Ok(Outcome::done());
            }
        };

        if let Err(conflict) = Ownership::check(Kind::Gateway, labels(&gateway)) {
            self.tracked.forget(id);
            return Err(Error::Conflict {
                kind: Ingress::kind(&()).to_string(),
                id: id.clone(),
                conflict,
            });
        }
        self.tracked.track(id.clone());

        let services = self.services().await?;
        let synthesized = routes::synthesize(
            &self.base_domain,
            services.iter().map(|svc| routes::ServicePorts {
                service: svc.name_any(),
                ports: service::ports(svc).into_iter().map(|p| p.port).collect(),
            }),
        );

        let desired = ingress::desired_rules(&gateway, &self.base_domain, &synthesized);
        if ingress::rules(&gateway) == desired.as_slice() {
            return Ok(Outcome::done());
        }

        tracing::info!(
            services = services.len(),
            rules = desired.len(),
            "Updating gateway rules"
        );
        self.cluster
            .replace(&id.namespace, &ingress::with_rules(&gateway, desired))
            .await?;
        Ok(Outcome::done())
    }
}

impl<C: Cluster> GatewayReconciler<C> {
    pub fn new(cluster: C, base_domain: impl ToString, tracked: TrackedGateways) -> Self {
        Self {
            cluster,
            base_domain: base_domain.to_string(),
            tracked,
        }
    }

    /// Lists derived services in every namespace, ordered by name.
    async fn services(&self) -> Result<Vec<Service>, Error> {
        let mut services = self
            .cluster
            .list::<Service>(&Kind::Runner.selector())
            .await?;
        services.retain(|svc| {
            labels(svc)
                .and_then(Ownership::from_labels)
                .is_some_and(|o| o.owner.is_some())
        });
        services.sort_by_key(|svc| svc.name_any());
        Ok(services)
    }
}
