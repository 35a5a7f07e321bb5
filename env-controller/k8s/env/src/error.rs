use ephemerator_controller_core::Conflict;
use ephemerator_controller_k8s_api::{self as k8s, ResourceId};
use kube::runtime::finalizer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cluster(#[from] k8s::Error),

    #[error("{kind} {id}: {conflict}")]
    Conflict {
        kind: String,
        id: ResourceId,
        #[source]
        conflict: Conflict,
    },

    #[error("failed to fingerprint request: {0}")]
    Fingerprint(#[from] serde_json::Error),

    #[error("failed to manage finalizer: {0}")]
    Finalizer(String),
}

impl Error {
    /// Conflicts persist until someone else removes the conflicting object,
    /// so retrying them only spins.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Conflict { .. })
    }
}

impl From<finalizer::Error<Self>> for Error {
    fn from(error: finalizer::Error<Self>) -> Self {
        match error {
            finalizer::Error::ApplyFailed(error) | finalizer::Error::CleanupFailed(error) => error,
            finalizer::Error::AddFinalizer(error) | finalizer::Error::RemoveFinalizer(error) => {
                Self::Cluster(error.into())
            }
            error => Self::Finalizer(error.to_string()),
        }
    }
}
