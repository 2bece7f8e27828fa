//! Timer and listener registry for deferred presence work
//!
//! Every deferred callback is keyed by what it is for ([`TimerKey`]), and at
//! most one timer per key is outstanding: scheduling a key that is already
//! pending cancels the old timer first. Firing hands back the key and handle
//! so the owner can check the handle still matches what it stored before
//! acting on it.
//!
//! Listeners wait on a state change of the scan resource instead of a
//! deadline; at most one is registered per [`ScanKind`].

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use crate::types::ScanKind;

/// Purpose and scope of a scheduled callback
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Commit a user to Not Home if their readings stayed low.
    NotHome { user_id: String },
    /// Send (or retry) a Depart scan request.
    DepartScan,
    /// Re-check whether every household member is home.
    EveryoneHomeCheck,
    /// Re-check whether every household member is away.
    EveryoneNotHomeCheck,
    /// Publish the first value of a freshly announced confidence sensor.
    SensorState { sensor_id: String },
}

/// Opaque handle identifying one scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct Scheduled {
    handle: TimerHandle,
    due: Instant,
}

/// Registry of pending timers, at most one per [`TimerKey`]
#[derive(Debug, Default)]
pub struct TimerRegistry {
    next_handle: u64,
    timers: HashMap<TimerKey, Scheduled>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` to fire at `due`, cancelling any timer already pending for it.
    pub fn schedule(&mut self, key: TimerKey, due: Instant) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        if let Some(previous) = self.timers.insert(key.clone(), Scheduled { handle, due }) {
            log::debug!("Replaced pending timer {:?} ({:?})", key, previous.handle);
        }
        handle
    }

    /// Cancel the timer for `key`. Returns whether one was pending.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.timers.remove(key).is_some()
    }

    /// Cancel a timer by handle, leaving a newer timer under the same key alone.
    pub fn cancel_handle(&mut self, handle: TimerHandle) -> bool {
        let key = self
            .timers
            .iter()
            .find(|(_, scheduled)| scheduled.handle == handle)
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => self.timers.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn is_pending(&self, key: &TimerKey) -> bool {
        self.timers.contains_key(key)
    }

    /// Earliest deadline among pending timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|s| s.due).min()
    }

    /// Remove and return the earliest timer due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerKey, TimerHandle)> {
        let key = self
            .timers
            .iter()
            .filter(|(_, scheduled)| scheduled.due <= now)
            .min_by_key(|(_, scheduled)| (scheduled.due, scheduled.handle.0))
            .map(|(key, _)| key.clone())?;
        self.timers
            .remove(&key)
            .map(|scheduled| (key, scheduled.handle))
    }
}

/// Pending "wait until the scan resource is idle" listeners, one per scan kind
#[derive(Debug, Default)]
pub struct IdleListeners {
    pending: HashSet<ScanKind>,
}

impl IdleListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `kind`. Returns `false` if one is already waiting.
    pub fn register(&mut self, kind: ScanKind) -> bool {
        self.pending.insert(kind)
    }

    pub fn is_registered(&self, kind: ScanKind) -> bool {
        self.pending.contains(&kind)
    }

    /// Deregister and return every waiting listener, in a stable order.
    pub fn drain(&mut self) -> Vec<ScanKind> {
        let mut kinds: Vec<ScanKind> = self.pending.drain().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn user(id: &str) -> TimerKey {
        TimerKey::NotHome {
            user_id: id.to_string(),
        }
    }

    #[test]
    fn test_schedule_replaces_same_key() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        let first = timers.schedule(TimerKey::DepartScan, now + Duration::from_secs(30));
        let second = timers.schedule(TimerKey::DepartScan, now + Duration::from_secs(60));
        assert_ne!(first, second);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(60)));
        let at = now + Duration::from_secs(90);
        assert_eq!(timers.pop_due(at), Some((TimerKey::DepartScan, second)));
        assert_eq!(timers.pop_due(at), None);
    }

    #[test]
    fn test_keys_are_scoped() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        timers.schedule(user("alice"), now);
        timers.schedule(user("bob"), now);
        assert!(timers.is_pending(&user("alice")));
        assert!(timers.cancel(&user("alice")));
        assert!(!timers.cancel(&user("alice")));
        assert!(timers.is_pending(&user("bob")));
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        timers.schedule(user("late"), now + Duration::from_secs(10));
        timers.schedule(user("early"), now + Duration::from_secs(5));
        timers.schedule(user("future"), now + Duration::from_secs(100));

        let at = now + Duration::from_secs(20);
        assert_eq!(timers.pop_due(at).map(|(k, _)| k), Some(user("early")));
        assert_eq!(timers.pop_due(at).map(|(k, _)| k), Some(user("late")));
        assert_eq!(timers.pop_due(at), None);
        assert!(timers.is_pending(&user("future")));
    }

    #[test]
    fn test_cancel_stale_handle_keeps_newer_timer() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        let stale = timers.schedule(TimerKey::DepartScan, now);
        timers.schedule(TimerKey::DepartScan, now);
        assert!(!timers.cancel_handle(stale));
        assert!(timers.is_pending(&TimerKey::DepartScan));
    }

    #[test]
    fn test_idle_listener_registered_once() {
        let mut listeners = IdleListeners::new();
        assert!(listeners.register(ScanKind::Arrive));
        assert!(!listeners.register(ScanKind::Arrive));
        assert!(listeners.is_registered(ScanKind::Arrive));
        assert!(!listeners.is_registered(ScanKind::Depart));
        assert_eq!(listeners.drain(), vec![ScanKind::Arrive]);
        assert!(listeners.drain().is_empty());
        assert!(!listeners.is_registered(ScanKind::Arrive));
    }
}
