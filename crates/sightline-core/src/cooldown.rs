//! Per-identity visit cooldown.

use crate::types::IdentityId;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Default minimum time between two logged visits of one identity.
pub const DEFAULT_VISIT_COOLDOWN_SECS: i64 = 60;

/// Tracks when each identity last had a visit logged in this session.
pub struct VisitCooldownTracker {
    cooldown: TimeDelta,
    last_logged: Mutex<HashMap<IdentityId, DateTime<Utc>>>,
}

impl VisitCooldownTracker {
    pub fn new(cooldown: TimeDelta) -> Self {
        Self {
            cooldown,
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> TimeDelta {
        self.cooldown
    }

    /// `true` if `identity` was never logged, or its last log is strictly
    /// more than the cooldown before `now`.
    pub fn should_log(&self, identity: IdentityId, now: DateTime<Utc>) -> bool {
        let map = self.last_logged.lock();
        Self::elapsed(&map, identity, now, self.cooldown)
    }

    /// Overwrite the last-logged timestamp of `identity`.
    pub fn record_logged(&self, identity: IdentityId, now: DateTime<Utc>) {
        self.last_logged.lock().insert(identity, now);
    }

    /// [`should_log`](Self::should_log) and, if it passes,
    /// [`record_logged`](Self::record_logged) under one lock acquisition.
    ///
    /// Two sightings of the same identity racing through here cannot both
    /// win.
    pub fn try_claim(&self, identity: IdentityId, now: DateTime<Utc>) -> bool {
        let mut map = self.last_logged.lock();
        if !Self::elapsed(&map, identity, now, self.cooldown) {
            return false;
        }
        map.insert(identity, now);
        true
    }

    /// Undo a [`try_claim`](Self::try_claim) made at `claimed_at` whose
    /// visit could not be logged. A later claim by another caller is kept.
    ///
    /// A claim only succeeds when the previous entry had expired, so
    /// dropping the entry restores the pre-claim decision.
    pub fn release(&self, identity: IdentityId, claimed_at: DateTime<Utc>) {
        let mut map = self.last_logged.lock();
        if map.get(&identity) == Some(&claimed_at) {
            map.remove(&identity);
        }
    }

    /// Forget every tracked identity.
    pub fn clear(&self) {
        self.last_logged.lock().clear();
    }

    pub fn tracked(&self) -> usize {
        self.last_logged.lock().len()
    }

    fn elapsed(
        map: &HashMap<IdentityId, DateTime<Utc>>,
        identity: IdentityId,
        now: DateTime<Utc>,
        cooldown: TimeDelta,
    ) -> bool {
        match map.get(&identity) {
            None => true,
            Some(&last) => now - last > cooldown,
        }
    }
}

impl Default for VisitCooldownTracker {
    fn default() -> Self {
        Self::new(TimeDelta::seconds(DEFAULT_VISIT_COOLDOWN_SECS))
    }
}
