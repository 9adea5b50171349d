//! Scaling decision engine.
//!
//! [`decide`] is a pure function from an observed [`ClusterSnapshot`] and a
//! [`ScalingPolicy`] to a [`Decision`]. It performs no I/O and holds no state,
//! so every rule is unit-testable and a given snapshot always produces the
//! same answer. The orchestrator owns acting on the decision.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Thresholds, bounds and cooldowns that shape scaling decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    /// Lower bound on worker count; scale-down never goes below this.
    pub min_nodes: usize,
    /// Upper bound on worker count; scale-up never exceeds this.
    pub max_nodes: usize,
    /// CPU percent above which the cluster is considered overloaded.
    pub scale_up_cpu: f64,
    /// CPU percent below which the cluster is considered idle.
    pub scale_down_cpu: f64,
    /// Pending-workload count above which capacity is added regardless of CPU.
    pub pending_threshold: f64,
    /// Minimum time since the last completed action before scaling up again.
    pub scale_up_cooldown: Duration,
    /// Minimum time since the last completed action before scaling down again.
    pub scale_down_cooldown: Duration,
}

/// Everything [`decide`] is allowed to look at.
///
/// `worker_count` comes from live provisioner inventory, not the persisted
/// snapshot. `now` is passed in rather than read from the clock so decisions
/// are reproducible.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub worker_count: usize,
    pub cpu_percent: f64,
    pub pending_work: f64,
    pub scaling_in_progress: bool,
    pub last_scale_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Outcome of a decision pass. `delta` is currently always 1: the loop moves
/// one node per completed action and relies on the next tick for more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    ScaleUp { delta: usize, reason: &'static str },
    ScaleDown { delta: usize, reason: &'static str },
    Hold { reason: &'static str },
}

/// Decide what, if anything, to do about cluster capacity.
///
/// Rules are evaluated in order; the first match wins:
///
/// 1. An action already in flight holds everything else off.
/// 2. Scale up when CPU is above the threshold or work is pending, the
///    up-cooldown has elapsed and there is headroom below `max_nodes`.
/// 3. Scale down when CPU is below the threshold with nothing pending, the
///    down-cooldown has elapsed and the count stays above `min_nodes`.
/// 4. Otherwise hold.
///
/// With overlapping thresholds (misconfiguration) the ordering means
/// scale-up wins over scale-down.
pub fn decide(policy: &ScalingPolicy, snap: &ClusterSnapshot) -> Decision {
    if snap.scaling_in_progress {
        return Decision::Hold { reason: "in progress" };
    }

    let overloaded = snap.cpu_percent > policy.scale_up_cpu;
    let pending = snap.pending_work > policy.pending_threshold;

    if (overloaded || pending)
        && snap.worker_count < policy.max_nodes
        && cooled_down(snap, policy.scale_up_cooldown)
    {
        let reason = if pending { "Pending work" } else { "High CPU" };
        return Decision::ScaleUp { delta: 1, reason };
    }

    if snap.cpu_percent < policy.scale_down_cpu
        && !pending
        && snap.worker_count > policy.min_nodes
        && cooled_down(snap, policy.scale_down_cooldown)
    {
        return Decision::ScaleDown { delta: 1, reason: "Low CPU & idle" };
    }

    Decision::Hold { reason: "stable" }
}

/// A `last_scale_at` in the future (clock skew) reads as not cooled down.
fn cooled_down(snap: &ClusterSnapshot, cooldown: Duration) -> bool {
    snap.now
        .signed_duration_since(snap.last_scale_at)
        .to_std()
        .map(|elapsed| elapsed >= cooldown)
        .unwrap_or(false)
}
