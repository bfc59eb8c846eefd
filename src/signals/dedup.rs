//! Deduplication and retrigger state.
//!
//! Every candidate is mapped to its [`AlarmKey`] and checked against the state
//! recorded for that key. The decision and the state update happen under one lock,
//! so two overlapping runs can never both fire the same identity.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::models::{AlarmKey, Candidate, DedupState};

/// Cooldown / delta rule for refreshable families
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetriggerPolicy {
    pub cooldown: ChronoDuration,
    pub min_delta: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// First sighting of this identity
    Fire,
    /// Already fired (or retrigger rule not met)
    Suppress,
    /// Refreshable identity fired again; carries the state it replaces
    Retrigger { previous: DedupState },
}

impl Decision {
    /// Fire and Retrigger are delivered; Suppress is not.
    #[inline]
    pub fn should_notify(&self) -> bool {
        !matches!(self, Decision::Suppress)
    }
}

/// Pure decision for one candidate against the prior state of its key.
///
/// Without a policy the identity fires once. With one, a later candidate
/// retriggers when it is strictly newer, at least `cooldown` after the last firing,
/// and its value beats the stored baseline by `min_delta`.
pub fn decide(
    candidate: &Candidate,
    prior: Option<&DedupState>,
    policy: Option<RetriggerPolicy>,
) -> Decision {
    let Some(prior) = prior else {
        return Decision::Fire;
    };
    let Some(policy) = policy else {
        return Decision::Suppress;
    };

    if candidate.triggered_at <= prior.last_fired_at {
        return Decision::Suppress;
    }
    let elapsed = candidate.triggered_at - prior.last_fired_at;
    if elapsed >= policy.cooldown && candidate.value >= prior.baseline + policy.min_delta {
        Decision::Retrigger { previous: *prior }
    } else {
        Decision::Suppress
    }
}

#[derive(Default)]
struct TrackerInner {
    states: HashMap<AlarmKey, DedupState>,
    /// Keys changed since the last [`DedupTracker::take_dirty`]
    dirty: HashSet<AlarmKey>,
}

/// In-memory dedup state shared by every run of one process
#[derive(Default)]
pub struct DedupTracker {
    inner: Mutex<TrackerInner>,
}

impl DedupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted state; hydrated keys are not marked dirty.
    pub fn hydrate(&self, states: impl IntoIterator<Item = (AlarmKey, DedupState)>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.states.len();
        inner.states.extend(states);
        inner.states.len() - before
    }

    /// Decide and, on Fire / Retrigger, record the new state atomically.
    pub fn decide_and_record(
        &self,
        key: &AlarmKey,
        candidate: &Candidate,
        policy: Option<RetriggerPolicy>,
    ) -> Decision {
        let mut inner = self.inner.lock();
        let decision = decide(candidate, inner.states.get(key), policy);

        if decision.should_notify() {
            inner.states.insert(
                key.clone(),
                DedupState {
                    last_fired_at: candidate.triggered_at,
                    baseline: candidate.value,
                },
            );
            inner.dirty.insert(key.clone());
        } else {
            debug!(key = %key.fingerprint(), "Candidate suppressed");
        }

        decision
    }

    pub fn get(&self, key: &AlarmKey) -> Option<DedupState> {
        self.inner.lock().states.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Changed states to persist. Keys are re-marked via [`Self::mark_dirty`] if the
    /// save fails.
    pub fn take_dirty(&self) -> Vec<(AlarmKey, DedupState)> {
        let mut inner = self.inner.lock();
        let keys: Vec<AlarmKey> = inner.dirty.drain().collect();
        keys.into_iter()
            .filter_map(|k| inner.states.get(&k).copied().map(|s| (k, s)))
            .collect()
    }

    pub fn mark_dirty(&self, keys: impl IntoIterator<Item = AlarmKey>) {
        let mut inner = self.inner.lock();
        inner.dirty.extend(keys);
    }

    /// Drop states whose last firing is older than `cutoff`; returns how many.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.states.len();
        inner.states.retain(|_, s| s.last_fired_at >= cutoff);
        let TrackerInner { states, dirty } = &mut *inner;
        dirty.retain(|k| states.contains_key(k));
        before - states.len()
    }
}
