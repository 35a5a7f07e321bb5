use ahash::AHashMap as HashMap;
use ephemerator_controller_k8s_api::ResourceId;
use parking_lot::Mutex;
use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Tracks consecutive failures per object, doubling the retry delay on each.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    failures: Mutex<HashMap<ResourceId, u32>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_DELAY, MAX_DELAY)
    }
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: Default::default(),
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub(crate) fn next(&self, id: &ResourceId) -> Duration {
        let mut failures = self.failures.lock();
        let n = failures.entry(id.clone()).or_default();
        let delay = self
            .initial
            .saturating_mul(1u32 << (*n).min(16))
            .min(self.max);
        *n = n.saturating_add(1);
        delay
    }

    pub(crate) fn reset(&self, id: &ResourceId) {
        self.failures.lock().remove(id);
    }
}
