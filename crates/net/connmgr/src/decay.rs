//! Decay and bump policies for decaying tags.

use std::time::{Duration, Instant};

/// Current state of one decaying tag on one peer.
#[derive(Debug, Clone, Copy)]
pub struct DecayingValue {
    /// Current tag value.
    pub value: i64,
    /// Instant of the last bump; expiry policies measure inactivity from here.
    pub last_bump: Instant,
}

/// How a decaying tag's value ages, applied once per elapsed tag interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecayPolicy {
    /// Value is unchanged by ticking.
    None,
    /// Value decreases by `step` per interval, floored at zero.
    Fixed { step: i64 },
    /// Value is multiplied by `1 - fraction` per interval, truncated toward
    /// zero. The tag entry is removed once the value reaches zero.
    Linear { fraction: f64 },
    /// The tag entry is removed once `window` elapses without a bump.
    ExpireWhenInactive { window: Duration },
}

impl DecayPolicy {
    /// Apply one interval's worth of decay. Returns the new value and whether
    /// the tag entry should be removed from the peer.
    pub(crate) fn apply(&self, current: DecayingValue, now: Instant) -> (i64, bool) {
        match *self {
            DecayPolicy::None => (current.value, false),
            DecayPolicy::Fixed { step } => ((current.value - step).max(0), false),
            DecayPolicy::Linear { fraction } => {
                let f = fraction.clamp(0.0, 1.0);
                let next = (current.value as f64 * (1.0 - f)).trunc() as i64;
                (next, next == 0)
            }
            DecayPolicy::ExpireWhenInactive { window } => {
                if now.saturating_duration_since(current.last_bump) >= window {
                    (0, true)
                } else {
                    (current.value, false)
                }
            }
        }
    }
}

/// How a bump delta combines with a tag's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpPolicy {
    /// `new = old + delta`, saturating.
    SumUnbounded,
    /// `new = clamp(old + delta, min, max)`.
    SumBounded { min: i64, max: i64 },
    /// `new = delta`, ignoring the old value.
    Overwrite,
}

impl BumpPolicy {
    pub(crate) fn apply(&self, old: i64, delta: i64) -> i64 {
        match *self {
            BumpPolicy::SumUnbounded => old.saturating_add(delta),
            BumpPolicy::SumBounded { min, max } => old.saturating_add(delta).clamp(min, max),
            BumpPolicy::Overwrite => delta,
        }
    }
}
