use crate::spec::Fingerprint;

/// What the controller knows about the workload that backs a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadState {
    Absent,
    Present {
        /// The request fields the workload was created from. A workload
        /// without one was not created from any request we can match.
        fingerprint: Option<Fingerprint>,
        phase: Phase,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Accepted by the cluster but not yet running.
    Creating,

    /// Running, but at least one container is not ready.
    Running { containers_running: bool },

    /// Running with every container ready.
    Ready,

    /// Deletion has been requested and is in progress.
    Terminating,
}

/// The single step that moves a workload toward its request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadAction {
    /// Nothing exists and nothing is wanted.
    Idle,

    Create,

    /// The workload matches its request.
    Keep { ready: bool },

    /// The workload must be replaced or removed. Running workloads host a
    /// nested cluster that has to be torn down before the pod goes away.
    Delete {
        reason: DeleteReason,
        teardown: bool,
    },

    /// A previous deletion has not finished; wait for it to be observed.
    AwaitTermination,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeleteReason {
    RequestDeleted,
    RequestChanged,
}

// === impl WorkloadState ===

impl WorkloadState {
    /// Decides the next action given the fingerprint of the live request, or
    /// `None` when the request no longer exists.
    ///
    /// Workloads are never modified in place: any mismatch results in
    /// deletion, and a replacement is created only once the deletion has
    /// been observed.
    pub fn plan(&self, desired: Option<&Fingerprint>) -> WorkloadAction {
        match (self, desired) {
            (Self::Absent, None) => WorkloadAction::Idle,
            (Self::Absent, Some(_)) => WorkloadAction::Create,
            (
                Self::Present {
                    phase: Phase::Terminating,
                    ..
                },
                _,
            ) => WorkloadAction::AwaitTermination,
            (Self::Present { phase, .. }, None) => WorkloadAction::Delete {
                reason: DeleteReason::RequestDeleted,
                teardown: phase.hosts_cluster(),
            },
            (Self::Present { fingerprint, phase }, Some(desired)) => {
                if fingerprint.as_ref() != Some(desired) {
                    return WorkloadAction::Delete {
                        reason: DeleteReason::RequestChanged,
                        teardown: phase.hosts_cluster(),
                    };
                }
                WorkloadAction::Keep {
                    ready: *phase == Phase::Ready,
                }
            }
        }
    }
}

// === impl Phase ===

impl Phase {
    /// Whether the nested cluster may be up, which is the case only when
    /// every container is running.
    fn hosts_cluster(&self) -> bool {
        matches!(
            self,
            Self::Ready
                | Self::Running {
                    containers_running: true
                }
        )
    }
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestDeleted => "request was deleted".fmt(f),
            Self::RequestChanged => "request changed".fmt(f),
        }
    }
}
