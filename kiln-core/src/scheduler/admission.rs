//! Degraded-mode admission control.
//!
//! When a model's dedicated lane cannot serve a request, the request falls
//! back to the shared worker, which runs one pipeline at a time.  Admission
//! into that fallback is bounded two ways:
//!
//! - **depth**: at most `max_depth` requests may be queued (admitted but not
//!   yet executing) at once; request 26 against a full queue is rejected
//!   immediately;
//! - **wait**: an admitted request that cannot begin execution within
//!   `max_wait` is converted into the same deterministic overload outcome.
//!
//! Both bounds are enforced with owned-semaphore permits, so depth
//! accounting and the admit/reject decision are a single atomic operation
//! and every rejection path releases its slot via `Drop`; no orphaned
//! queue entries.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admission limits for degraded-shared routing.
#[derive(Debug, Clone, Copy)]
pub struct DegradedQueuePolicy {
    pub max_depth: usize,
    pub max_wait: Duration,
}

impl Default for DegradedQueuePolicy {
    fn default() -> Self {
        Self {
            max_depth: 25,
            max_wait: Duration::from_secs(30),
        }
    }
}

/// Why admission was refused.  Both variants surface to callers as the
/// `queue_overloaded` outcome.
#[derive(Debug, Clone, Copy, Error)]
pub enum AdmissionRejection {
    #[error("degraded queue is full ({max_depth} requests already waiting)")]
    DepthExceeded { max_depth: usize },

    #[error("no shared worker slot became free within {max_wait:?}")]
    WaitExpired { max_wait: Duration },
}

/// Held by a request for as long as it occupies the shared worker.
/// Dropping it frees the single-active-pipeline slot.
pub struct DegradedSlot {
    _active: OwnedSemaphorePermit,
}

impl std::fmt::Debug for DegradedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradedSlot").finish()
    }
}

/// Bounded-queue gatekeeper for degraded-shared mode.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    policy: DegradedQueuePolicy,
    /// One permit per queue position.
    depth: Arc<Semaphore>,
    /// The single-active-pipeline slot of the shared worker.
    active: Arc<Semaphore>,
}

impl AdmissionController {
    pub fn new(policy: DegradedQueuePolicy) -> Self {
        Self {
            policy,
            depth: Arc::new(Semaphore::new(policy.max_depth)),
            active: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn policy(&self) -> DegradedQueuePolicy {
        self.policy
    }

    /// Number of requests currently admitted and waiting to execute.
    pub fn queued(&self) -> usize {
        self.policy.max_depth.saturating_sub(self.depth.available_permits())
    }

    /// Admit a request into the degraded queue and wait (bounded,
    /// cancellable) for the shared worker slot.
    ///
    /// Returns the slot on success.  The queue position is released the
    /// moment execution may begin; the slot itself is released when the
    /// returned [`DegradedSlot`] is dropped.
    pub async fn admit(&self) -> Result<DegradedSlot, AdmissionRejection> {
        let queued = match Arc::clone(&self.depth).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(AdmissionRejection::DepthExceeded {
                    max_depth: self.policy.max_depth,
                });
            }
        };

        let acquire = Arc::clone(&self.active).acquire_owned();
        match tokio::time::timeout(self.policy.max_wait, acquire).await {
            Ok(Ok(active)) => {
                // Leaving the queue: the depth slot frees as `queued` drops.
                drop(queued);
                Ok(DegradedSlot { _active: active })
            }
            Ok(Err(_)) | Err(_) => Err(AdmissionRejection::WaitExpired {
                max_wait: self.policy.max_wait,
            }),
        }
    }
}
