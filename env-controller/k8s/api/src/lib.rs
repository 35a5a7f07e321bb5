#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod ingress;
mod resource_id;
pub mod service;
pub mod workload;

pub use self::{
    cluster::{Cluster, Error, ExecOutput, ExecTarget, KubeCluster, Object},
    resource_id::ResourceId,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{ConfigMap, Pod, PodSpec, PodStatus, Service, ServicePort, ServiceSpec},
        networking::v1::{Ingress, IngressRule, IngressSpec},
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
pub use kube::{
    api::ObjectMeta,
    runtime::{controller::Action, reflector::ObjectRef, watcher},
    Api, Client, Resource, ResourceExt,
};

use ephemerator_controller_core::ownership::Labels;

/// Returns an object's labels, if it has any.
pub fn labels<K: Resource>(obj: &K) -> Option<&Labels> {
    obj.meta().labels.as_ref()
}
