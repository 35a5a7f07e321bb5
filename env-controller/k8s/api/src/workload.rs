//! The pod that runs a user's environment.
//!
//! Each pod runs two containers: a privileged docker-in-docker runtime, and
//! the primary container that checks out the requested repo and runs it
//! against that runtime. The pair share the runtime's socket through an
//! `emptyDir` mounted at `/run`.

use crate::{
    api::core::v1::{
        Container, EmptyDirVolumeSource, EnvVar, ExecAction, HostPathVolumeSource, PodDNSConfig,
        Probe, SecurityContext, Volume, VolumeMount,
    },
    cluster::{Error, ExecTarget},
    ConfigMap, ObjectMeta, OwnerReference, Pod, PodSpec, Resource, ResourceExt,
};
use ephemerator_controller_core::{EnvSpec, Fingerprint, Ownership, Phase, WorkloadState};

pub const PRIMARY_CONTAINER: &str = "tilt-upper";
pub const RUNTIME_CONTAINER: &str = "dind";

/// Annotation holding the fingerprint of the request a pod was created from.
pub const FINGERPRINT_ANNOTATION: &str = "ephemerator.tilt.dev/configmap";

const SERVICE_ACCOUNT: &str = "ephrunner-service-account";
const NAMESERVERS: [&str; 2] = ["1.1.1.1", "1.0.0.1"];
const HEALTHCHECK: [&str; 2] = ["python3", "tilt-healthcheck.py"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Images {
    pub runtime: String,
    pub primary: String,
}

/// Builds an owner reference that lets the cluster collect objects derived
/// from `request` once it is gone.
pub fn owner_ref(request: &ConfigMap) -> Result<OwnerReference, Error> {
    request
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingUid {
            kind: ConfigMap::kind(&()).to_string(),
            name: request.name_any(),
        })
}

pub fn build(
    request: &ConfigMap,
    spec: &EnvSpec,
    fingerprint: &Fingerprint,
    images: &Images,
) -> Result<Pod, Error> {
    let name = request.name_any();
    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: request.namespace(),
            labels: Some(Ownership::derived(&name).labels()),
            annotations: Some(
                [(
                    FINGERPRINT_ANNOTATION.to_string(),
                    fingerprint.as_str().to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            owner_references: Some(vec![owner_ref(request)?]),
            ..Default::default()
        },
        spec: Some(pod_spec(spec, images)),
        ..Default::default()
    })
}

fn pod_spec(spec: &EnvSpec, images: &Images) -> PodSpec {
    let mount = |name: &str, path: &str| VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    };
    let host_dir = |name: &str, path: &str| Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    };
    let empty_dir = |name: &str| Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };
    let env = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    };

    let runtime = Container {
        name: RUNTIME_CONTAINER.to_string(),
        image: Some(images.runtime.clone()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                read_only: Some(true),
                ..mount("modules", "/lib/modules")
            },
            mount("cgroup", "/sys/fs/cgroup"),
            mount("dind-storage", "/var/lib/docker"),
            mount("dind-socket", "/run"),
        ]),
        ..Default::default()
    };

    let primary = Container {
        name: PRIMARY_CONTAINER.to_string(),
        image: Some(images.primary.clone()),
        env: Some(vec![
            env("TILT_UPPER_REPO", &spec.repo),
            env("TILT_UPPER_PATH", &spec.path),
            env("TILT_UPPER_BRANCH", &spec.branch),
        ]),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(HEALTHCHECK.iter().map(|s| s.to_string()).collect()),
            }),
            timeout_seconds: Some(2),
            period_seconds: Some(5),
            ..Default::default()
        }),
        volume_mounts: Some(vec![mount("dind-socket", "/run")]),
        ..Default::default()
    };

    PodSpec {
        automount_service_account_token: Some(false),
        service_account_name: Some(SERVICE_ACCOUNT.to_string()),
        dns_policy: Some("None".to_string()),
        dns_config: Some(PodDNSConfig {
            nameservers: Some(NAMESERVERS.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }),
        volumes: Some(vec![
            host_dir("modules", "/lib/modules"),
            host_dir("cgroup", "/sys/fs/cgroup"),
            empty_dir("dind-storage"),
            empty_dir("dind-socket"),
        ]),
        containers: vec![runtime, primary],
        ..Default::default()
    }
}

/// Observes the lifecycle state of a workload pod.
pub fn state(pod: Option<&Pod>) -> WorkloadState {
    let pod = match pod {
        Some(pod) => pod,
        None => return WorkloadState::Absent,
    };

    WorkloadState::Present {
        fingerprint: fingerprint(pod),
        phase: phase(pod),
    }
}

pub fn fingerprint(pod: &Pod) -> Option<Fingerprint> {
    pod.annotations()
        .get(FINGERPRINT_ANNOTATION)
        .cloned()
        .map(Fingerprint::from)
}

fn phase(pod: &Pod) -> Phase {
    if pod.metadata.deletion_timestamp.is_some() {
        return Phase::Terminating;
    }

    let status = match pod.status.as_ref() {
        Some(status) if status.phase.as_deref() == Some("Running") => status,
        _ => return Phase::Creating,
    };

    let containers = status.container_statuses.as_deref().unwrap_or_default();
    if !containers.is_empty() && containers.iter().all(|c| c.ready) {
        return Phase::Ready;
    }

    let containers_running = !containers.is_empty()
        && containers
            .iter()
            .all(|c| c.state.as_ref().is_some_and(|s| s.running.is_some()));
    Phase::Running { containers_running }
}

/// Where commands run inside a workload.
pub fn exec_target(pod: &Pod) -> ExecTarget {
    ExecTarget {
        namespace: pod.namespace().unwrap_or_default(),
        pod: pod.name_any(),
        container: PRIMARY_CONTAINER.to_string(),
    }
}

/// Tears down the nested cluster, which does not shut down cleanly when its
/// pod is deleted.
pub fn teardown_command() -> Vec<String> {
    ["ctlptl", "delete", "cluster", "kind-kind", "--ignore-not-found"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::core::v1::{ContainerState, ContainerStateRunning, ContainerStatus},
        PodStatus,
    };
    use ephemerator_controller_core::Kind;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use pretty_assertions::assert_eq;

    fn request() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("alice".to_string()),
                uid: Some("uid-0".to_string()),
                labels: Some(
                    Ownership {
                        kind: Kind::Runner,
                        owner: None,
                    }
                    .labels(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn spec() -> EnvSpec {
        EnvSpec {
            repo: "tilt-dev/tilt-avatars".to_string(),
            branch: "main".to_string(),
            path: "Tiltfile".to_string(),
        }
    }

    fn images() -> Images {
        Images {
            runtime: "docker:dind".to_string(),
            primary: "tilt-upper:latest".to_string(),
        }
    }

    fn status(phase: &str, containers: &[(bool, bool)]) -> PodStatus {
        PodStatus {
            phase: Some(phase.to_string()),
            container_statuses: Some(
                containers
                    .iter()
                    .map(|&(running, ready)| ContainerStatus {
                        ready,
                        state: Some(ContainerState {
                            running: running.then(ContainerStateRunning::default),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn builds_owned_pod() {
        let fp = Fingerprint::from("fp".to_string());
        let pod = build(&request(), &spec(), &fp, &images()).expect("pod must build");

        assert_eq!(pod.name_any(), "alice");
        assert_eq!(pod.namespace().as_deref(), Some("ns-0"));
        assert_eq!(
            Ownership::from_labels(pod.labels()),
            Some(Ownership::derived("alice"))
        );
        assert_eq!(fingerprint(&pod), Some(fp));

        let owner = &pod.owner_references()[0];
        assert_eq!(owner.uid, "uid-0");
        assert_eq!(owner.kind, "ConfigMap");
        assert_eq!(owner.controller, Some(true));

        let spec = pod.spec.expect("pod must have a spec");
        let names = spec.containers.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["dind", "tilt-upper"]);
        let env = spec.containers[1]
            .env
            .iter()
            .flatten()
            .map(|e| (e.name.as_str(), e.value.as_deref().unwrap_or_default()))
            .collect::<Vec<_>>();
        assert_eq!(
            env,
            vec![
                ("TILT_UPPER_REPO", "tilt-dev/tilt-avatars"),
                ("TILT_UPPER_PATH", "Tiltfile"),
                ("TILT_UPPER_BRANCH", "main"),
            ]
        );
        assert_eq!(
            spec.containers[0]
                .security_context
                .as_ref()
                .and_then(|s| s.privileged),
            Some(true)
        );
    }

    #[test]
    fn requires_request_uid() {
        let mut request = request();
        request.metadata.uid = None;
        let fp = Fingerprint::from("fp".to_string());
        assert!(matches!(
            build(&request, &spec(), &fp, &images()),
            Err(Error::MissingUid { .. })
        ));
    }

    #[test]
    fn observes_phases() {
        let fp = Fingerprint::from("fp".to_string());
        let mut pod = build(&request(), &spec(), &fp, &images()).unwrap();
        assert_eq!(
            state(Some(&pod)),
            WorkloadState::Present {
                fingerprint: Some(fp.clone()),
                phase: Phase::Creating,
            }
        );

        pod.status = Some(status("Running", &[(true, true), (true, false)]));
        assert_eq!(
            phase(&pod),
            Phase::Running {
                containers_running: true
            }
        );

        pod.status = Some(status("Running", &[(true, true), (false, false)]));
        assert_eq!(
            phase(&pod),
            Phase::Running {
                containers_running: false
            }
        );

        pod.status = Some(status("Running", &[(true, true), (true, true)]));
        assert_eq!(phase(&pod), Phase::Ready);

        pod.metadata.deletion_timestamp =
            Some(serde_json::from_value::<Time>(serde_json::json!("2026-10-19T12:00:00Z")).unwrap());
        assert_eq!(phase(&pod), Phase::Terminating);

        assert_eq!(state(None), WorkloadState::Absent);
    }
}
