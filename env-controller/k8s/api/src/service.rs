use crate::{cluster::Error, workload, ConfigMap, ObjectMeta, ResourceExt, Service, ServiceSpec};
use ephemerator_controller_core::{ports::PROTOCOL_TCP, Ownership, ServicePort};

/// Builds the service that exposes a workload's discovered ports, selecting
/// the workload's pod by its owner label.
pub fn build(request: &ConfigMap, ports: &[ServicePort]) -> Result<Service, Error> {
    let name = request.name_any();
    let labels = Ownership::derived(&name).labels();
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: request.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![workload::owner_ref(request)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(ports.iter().map(to_k8s).collect()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Reads the ports a live service exposes. Ports that could never have been
/// written by this controller are skipped.
pub fn ports(svc: &Service) -> Vec<ServicePort> {
    svc.spec
        .iter()
        .flat_map(|spec| spec.ports.iter().flatten())
        .filter_map(|p| {
            Some(ServicePort {
                name: p.name.clone().unwrap_or_default(),
                protocol: p
                    .protocol
                    .clone()
                    .unwrap_or_else(|| PROTOCOL_TCP.to_string()),
                port: u16::try_from(p.port).ok()?,
            })
        })
        .collect()
}

/// Returns a copy of `svc` exposing exactly `ports`.
pub fn with_ports(svc: &Service, ports: &[ServicePort]) -> Service {
    let mut svc = svc.clone();
    svc.spec.get_or_insert_with(Default::default).ports =
        Some(ports.iter().map(to_k8s).collect());
    svc
}

fn to_k8s(port: &ServicePort) -> crate::ServicePort {
    crate::ServicePort {
        name: Some(port.name.clone()),
        protocol: Some(port.protocol.clone()),
        port: port.port.into(),
        ..Default::default()
    }
}
