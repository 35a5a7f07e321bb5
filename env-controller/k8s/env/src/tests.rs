
use self::fake::FakeCluster;
use chrono::{DateTime, TimeZone, Utc};
use ephemerator_controller_core::{ownership::Labels, spec, Allowlist, EnvSpec, Kind, Ownership};
use ephemerator_controller_k8s_api::{
    api::core::v1::{ContainerState, ContainerStateRunning, ContainerStatus},
    workload::Images,
    ConfigMap, ObjectMeta, Pod, PodStatus, ResourceId,
};
use std::collections::BTreeMap;

const NS: &str = "ns-0";

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
}

fn id(name: &str) -> ResourceId {
    ResourceId::new(NS, name)
}

fn allowlist() -> Allowlist {
    Allowlist {
        repo_base: "tilt-dev".to_string(),
        repo_names: vec!["tilt-example-html".to_string()],
    }
}

fn images() -> Images {
    Images {
        runtime: "docker:dind".to_string(),
        primary: "ephemerator/tilt-upper:latest".to_string(),
    }
}

fn env_spec(path: &str) -> EnvSpec {
    EnvSpec {
        repo: "tilt-dev/tilt-example-html".to_string(),
        branch: "main".to_string(),
        path: path.to_string(),
    }
}

fn request_labels() -> Labels {
    Ownership {
        kind: Kind::Runner,
        owner: None,
    }
    .labels()
}

fn gateway_labels() -> Labels {
    Ownership {
        kind: Kind::Gateway,
        owner: None,
    }
    .labels()
}

fn mk_request(name: &str, spec: &EnvSpec) -> ConfigMap {
    let data = [
        (spec::REPO_KEY, &spec.repo),
        (spec::BRANCH_KEY, &spec.branch),
        (spec::PATH_KEY, &spec.path),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.clone()))
    .collect();
    ConfigMap {
        metadata: ObjectMeta {
            namespace: Some(NS.to_string()),
            name: Some(name.to_string()),
            labels: Some(request_labels()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

fn with_expiration(mut request: ConfigMap, expiration: &str) -> ConfigMap {
    request
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(spec::EXPIRATION_KEY.to_string(), expiration.to_string());
    request
}

fn expiration(request: &ConfigMap) -> Option<&str> {
    request
        .data
        .as_ref()?
        .get(spec::EXPIRATION_KEY)
        .map(String::as_str)
}

/// Marks a workload as running with every container ready.
fn set_ready(cluster: &FakeCluster, name: &str) {
    cluster.update::<Pod>(NS, name, |pod| {
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(
                ["dind", "tilt-upper"]
                    .into_iter()
                    .map(|name| ContainerStatus {
                        name: name.to_string(),
                        ready: true,
                        state: Some(ContainerState {
                            running: Some(ContainerStateRunning::default()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });
    });
}
