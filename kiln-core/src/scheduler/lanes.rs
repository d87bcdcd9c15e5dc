//! Execution lane registry.
//!
//! One lane per catalog model, created at process start and never destroyed,
//! only transitioned.  A lane tracks two independent dimensions:
//!
//! - **availability**: `ready` → `cold` (idle eviction), `ready|cold` →
//!   `unavailable` (capacity/quota denial, or probe failure sustained past
//!   the grace period), `unavailable` → `ready` (capacity recovered and a
//!   probe succeeded);
//! - **routing mode**: `dedicated` ↔ `degraded_shared`, with the fallback
//!   cause recorded on every flip to `degraded_shared`.
//!
//! The request path only ever calls [`LaneRegistry::resolve`], which is
//! read-only.  All mutation funnels through [`LaneRegistry::apply`], called
//! from health-probe and capacity callbacks (and the operator surface),
//! never from request handlers.  Each `apply` is one atomic
//! read-decide-write unit under the registry lock.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::catalog::ModelCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LaneAvailability {
    Ready,
    Cold,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LaneMode {
    Dedicated,
    DegradedShared,
}

/// Why a lane left `dedicated` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FallbackReason {
    Capacity,
    Quota,
    Manual,
}

/// Signals fed into the registry from health probes, capacity callbacks,
/// and the operator surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneEvent {
    ProbeSucceeded,
    ProbeFailed,
    /// The lane's pipeline finished loading on its worker.
    PipelineLoaded,
    /// Autoscale-down evicted the idle pipeline.
    IdleEvicted,
    /// The infrastructure denied a dedicated start for lack of capacity.
    CapacityDenied,
    /// The infrastructure denied a dedicated start on quota grounds.
    QuotaDenied,
    /// A request could not be assigned a lane within the admission grace
    /// period.
    AssignmentTimedOut,
    /// Operator forced degraded routing.
    ManualFallback,
    /// Capacity is back and a probe confirmed readiness.
    CapacityRestored,
}

/// Timing knobs for lane transitions.
#[derive(Debug, Clone, Copy)]
pub struct LanePolicy {
    /// How long probes must keep failing before the lane goes `unavailable`.
    pub probe_grace: Duration,
    /// How long a submitted request may wait for lane assignment before the
    /// registry flips the lane to degraded routing.  Independent of the
    /// degraded queue's max wait.
    pub admission_grace: Duration,
}

impl Default for LanePolicy {
    fn default() -> Self {
        Self {
            probe_grace: Duration::from_secs(60),
            admission_grace: Duration::from_secs(30),
        }
    }
}

/// Public snapshot of one lane, returned by `resolve` and the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct LaneSnapshot {
    pub lane_key: String,
    pub mode: LaneMode,
    pub warm: bool,
    pub availability: LaneAvailability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LaneState {
    mode: LaneMode,
    warm: bool,
    availability: LaneAvailability,
    fallback_reason: Option<FallbackReason>,
    updated_at: DateTime<Utc>,
    /// First probe failure of the current failing streak.
    probe_failing_since: Option<DateTime<Utc>>,
}

impl LaneState {
    fn snapshot(&self, key: &str) -> LaneSnapshot {
        LaneSnapshot {
            lane_key: key.to_owned(),
            mode: self.mode,
            warm: self.warm,
            availability: self.availability,
            fallback_reason: self.fallback_reason,
            updated_at: self.updated_at,
        }
    }

    fn enter_degraded(&mut self, reason: FallbackReason) {
        self.mode = LaneMode::DegradedShared;
        self.fallback_reason = Some(reason);
    }
}

#[derive(Debug, Error)]
pub enum LaneError {
    #[error("no lane registered for model '{0}'")]
    UnknownLane(String),
}

/// Registry of all execution lanes, keyed by model name.
///
/// Lock discipline: a single `RwLock` over the lane map; `resolve` takes the
/// read side, `apply` the write side.  No await points are crossed while
/// holding the lock.
#[derive(Debug)]
pub struct LaneRegistry {
    lanes: RwLock<HashMap<String, LaneState>>,
    policy: LanePolicy,
}

impl LaneRegistry {
    /// Create one lane per catalog model.  Lanes start `ready` (the slot is
    /// provisioned at process start) but not `warm`: the pipeline itself is
    /// loaded on first dispatch.
    pub fn new(catalog: &ModelCatalog, policy: LanePolicy) -> Self {
        let now = Utc::now();
        let lanes = catalog
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    LaneState {
                        mode: LaneMode::Dedicated,
                        warm: false,
                        availability: LaneAvailability::Ready,
                        fallback_reason: None,
                        updated_at: now,
                        probe_failing_since: None,
                    },
                )
            })
            .collect();
        Self {
            lanes: RwLock::new(lanes),
            policy,
        }
    }

    pub fn policy(&self) -> LanePolicy {
        self.policy
    }

    /// Read-only view of one lane.  This is the only registry operation the
    /// request path may use.
    pub fn resolve(&self, model: &str) -> Option<LaneSnapshot> {
        self.lanes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(model)
            .map(|s| s.snapshot(model))
    }

    /// Snapshot every lane, in arbitrary order.
    pub fn snapshot_all(&self) -> Vec<LaneSnapshot> {
        self.lanes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, s)| s.snapshot(k))
            .collect()
    }

    /// Apply one lane event at `now`, atomically, and return the resulting
    /// snapshot.
    pub fn apply(&self, model: &str, event: LaneEvent, now: DateTime<Utc>) -> Result<LaneSnapshot, LaneError> {
        let mut lanes = self.lanes.write().unwrap_or_else(|e| e.into_inner());
        let lane = lanes
            .get_mut(model)
            .ok_or_else(|| LaneError::UnknownLane(model.to_owned()))?;

        match event {
            LaneEvent::ProbeSucceeded => {
                // A bare probe success does not resurrect an unavailable
                // lane; that requires CapacityRestored.
                lane.probe_failing_since = None;
            }
            LaneEvent::ProbeFailed => {
                let since = *lane.probe_failing_since.get_or_insert(now);
                let failing_for = now.signed_duration_since(since);
                if failing_for.to_std().map(|d| d >= self.policy.probe_grace).unwrap_or(false)
                    && lane.availability != LaneAvailability::Unavailable
                {
                    lane.availability = LaneAvailability::Unavailable;
                    lane.warm = false;
                    lane.enter_degraded(FallbackReason::Capacity);
                }
            }
            LaneEvent::PipelineLoaded => {
                lane.warm = true;
                lane.availability = LaneAvailability::Ready;
            }
            LaneEvent::IdleEvicted => {
                if lane.availability == LaneAvailability::Ready {
                    lane.availability = LaneAvailability::Cold;
                }
                lane.warm = false;
            }
            LaneEvent::CapacityDenied => {
                lane.availability = LaneAvailability::Unavailable;
                lane.warm = false;
                lane.enter_degraded(FallbackReason::Capacity);
            }
            LaneEvent::QuotaDenied => {
                lane.availability = LaneAvailability::Unavailable;
                lane.warm = false;
                lane.enter_degraded(FallbackReason::Quota);
            }
            LaneEvent::AssignmentTimedOut => {
                lane.enter_degraded(FallbackReason::Capacity);
            }
            LaneEvent::ManualFallback => {
                lane.enter_degraded(FallbackReason::Manual);
            }
            LaneEvent::CapacityRestored => {
                lane.availability = LaneAvailability::Ready;
                lane.mode = LaneMode::Dedicated;
                lane.fallback_reason = None;
                lane.probe_failing_since = None;
            }
        }

        lane.updated_at = now;
        Ok(lane.snapshot(model))
    }
}
