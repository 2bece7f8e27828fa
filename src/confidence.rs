//! Per-user confidence tracking and the Home / Not Home decision.
//!
//! Each user has one confidence value per location. A single reading at or
//! above the minimum confidence makes the user Home immediately. Low readings
//! only arm a Not Home timer; the user is declared Not Home when that timer
//! expires and every known reading is still below the threshold.
//!
//! Unknown readings (no value since a restart) are left out of every decision.
//! A user whose readings are all unknown is indeterminate and never changes
//! state.

use std::collections::{BTreeMap, HashMap};

use crate::scheduler::TimerHandle;
use crate::types::{ConfidenceReading, HomeState};

/// Presence record for a single user
#[derive(Debug, Clone)]
pub struct UserPresence {
    pub user_id: String,
    pub display_name: String,
    /// location id → last confidence, `None` while unknown
    readings: BTreeMap<String, Option<u8>>,
    state: HomeState,
    not_home_timer: Option<TimerHandle>,
}

impl UserPresence {
    fn new(user_id: &str, display_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            readings: BTreeMap::new(),
            state: HomeState::Initializing,
            not_home_timer: None,
        }
    }

    pub fn state(&self) -> HomeState {
        self.state
    }

    pub fn not_home_timer(&self) -> Option<TimerHandle> {
        self.not_home_timer
    }

    pub fn reading(&self, location_id: &str) -> Option<u8> {
        self.readings.get(location_id).copied().flatten()
    }

    pub fn locations(&self) -> impl Iterator<Item = &str> {
        self.readings.keys().map(String::as_str)
    }

    /// Known readings across all locations.
    fn known_readings(&self) -> impl Iterator<Item = u8> + '_ {
        self.readings.values().filter_map(|r| *r)
    }

    /// Highest known reading, `None` if every reading is unknown.
    pub fn max_confidence(&self) -> Option<u8> {
        self.known_readings().max()
    }
}

/// What storing a reading changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// First reading ever stored for this (user, location)
    pub new_location: bool,
    /// Value differs from the previous reading for this location
    pub value_changed: bool,
}

/// Decision after a user's readings changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// User is Home. `changed` is false when they already were; any pending
    /// Not Home timer has been detached from the record and must be cancelled.
    Home {
        changed: bool,
        cancel_timer: Option<TimerHandle>,
    },
    /// Readings are low and no timer is running: corroborate and start one.
    StartNotHomeTimer,
    /// Nothing to do.
    Unchanged,
}

/// Tracks every user's readings and presence state
#[derive(Debug)]
pub struct ConfidenceAggregator {
    minimum_confidence: u8,
    users: HashMap<String, UserPresence>,
}

impl ConfidenceAggregator {
    pub fn new(minimum_confidence: u8) -> Self {
        Self {
            minimum_confidence,
            users: HashMap::new(),
        }
    }

    pub fn user(&self, user_id: &str) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    pub fn users(&self) -> impl Iterator<Item = &UserPresence> {
        self.users.values()
    }

    pub fn state_of(&self, user_id: &str) -> Option<HomeState> {
        self.users.get(user_id).map(|u| u.state)
    }

    /// Get or create the record for a user. New users start out Initializing.
    pub fn ensure_user(&mut self, user_id: &str, display_name: &str) -> &mut UserPresence {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| UserPresence::new(user_id, display_name))
    }

    /// Register a location known from durable storage, with its last value if
    /// the host still has one.
    pub fn restore_location(
        &mut self,
        user_id: &str,
        display_name: &str,
        location_id: &str,
        confidence: Option<u8>,
    ) {
        let user = self.ensure_user(user_id, display_name);
        user.readings
            .entry(location_id.to_string())
            .or_insert(confidence);
    }

    /// Seed a user's state from what the host last showed for them.
    ///
    /// Only applies while the user is still Initializing; anything decided
    /// since startup takes precedence.
    pub fn restore_state(&mut self, user_id: &str, display_name: &str, state: HomeState) {
        let user = self.ensure_user(user_id, display_name);
        if user.state == HomeState::Initializing {
            user.state = state;
        }
    }

    /// Store a reading for `(user, location)`.
    pub fn record(&mut self, reading: &ConfidenceReading) -> RecordOutcome {
        let user = self.ensure_user(&reading.user_id, &reading.display_name);
        let previous = user
            .readings
            .insert(reading.location_id.clone(), Some(reading.confidence));
        RecordOutcome {
            new_location: previous.is_none(),
            value_changed: previous != Some(Some(reading.confidence)),
        }
    }

    /// Apply the decision rule to a user's current readings.
    pub fn evaluate(&mut self, user_id: &str) -> Evaluation {
        let minimum = self.minimum_confidence;
        let Some(user) = self.users.get_mut(user_id) else {
            return Evaluation::Unchanged;
        };

        let Some(max) = user.max_confidence() else {
            return Evaluation::Unchanged;
        };

        if max >= minimum {
            let changed = user.state != HomeState::Home;
            user.state = HomeState::Home;
            return Evaluation::Home {
                changed,
                cancel_timer: user.not_home_timer.take(),
            };
        }

        if user.state != HomeState::NotHome && user.not_home_timer.is_none() {
            Evaluation::StartNotHomeTimer
        } else {
            Evaluation::Unchanged
        }
    }

    /// Attach the Not Home timer started for a user.
    pub fn set_not_home_timer(&mut self, user_id: &str, handle: TimerHandle) {
        if let Some(user) = self.users.get_mut(user_id) {
            user.not_home_timer = Some(handle);
        }
    }

    /// Handle expiry of a Not Home timer.
    ///
    /// Re-checks the readings at expiry time. Returns true if the user was
    /// moved to Not Home. A timer whose handle no longer matches the record
    /// is stale and ignored.
    pub fn expire_not_home(&mut self, user_id: &str, handle: TimerHandle) -> bool {
        let minimum = self.minimum_confidence;
        let Some(user) = self.users.get_mut(user_id) else {
            return false;
        };
        if user.not_home_timer != Some(handle) {
            log::debug!("Ignoring stale Not Home timer for {}", user_id);
            return false;
        }
        user.not_home_timer = None;

        match user.max_confidence() {
            Some(max) if max < minimum && user.state != HomeState::NotHome => {
                user.state = HomeState::NotHome;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{TimerKey, TimerRegistry};
    use tokio::time::Instant;

    fn reading(user: &str, location: &str, confidence: u8) -> ConfidenceReading {
        ConfidenceReading {
            user_id: user.to_string(),
            display_name: user.to_string(),
            location_id: location.to_string(),
            confidence,
        }
    }

    fn handle() -> TimerHandle {
        TimerRegistry::new().schedule(TimerKey::DepartScan, Instant::now())
    }

    #[test]
    fn test_record_reports_new_location_and_change() {
        let mut agg = ConfidenceAggregator::new(90);
        let first = agg.record(&reading("alice", "lobby", 50));
        assert!(first.new_location && first.value_changed);
        let same = agg.record(&reading("alice", "lobby", 50));
        assert!(!same.new_location && !same.value_changed);
        let other = agg.record(&reading("alice", "kitchen", 50));
        assert!(other.new_location);
    }

    #[test]
    fn test_high_reading_is_home_immediately() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.record(&reading("alice", "lobby", 95));
        assert_eq!(
            agg.evaluate("alice"),
            Evaluation::Home {
                changed: true,
                cancel_timer: None
            }
        );
        assert_eq!(agg.state_of("alice"), Some(HomeState::Home));
        assert_eq!(
            agg.evaluate("alice"),
            Evaluation::Home {
                changed: false,
                cancel_timer: None
            }
        );
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.record(&reading("alice", "lobby", 90));
        assert!(matches!(agg.evaluate("alice"), Evaluation::Home { .. }));
    }

    #[test]
    fn test_any_location_above_threshold_wins() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.record(&reading("alice", "lobby", 10));
        agg.record(&reading("alice", "kitchen", 100));
        assert!(matches!(agg.evaluate("alice"), Evaluation::Home { .. }));
    }

    #[test]
    fn test_low_reading_starts_timer_once() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.record(&reading("alice", "lobby", 20));
        assert_eq!(agg.evaluate("alice"), Evaluation::StartNotHomeTimer);
        agg.set_not_home_timer("alice", handle());
        agg.record(&reading("alice", "lobby", 10));
        assert_eq!(agg.evaluate("alice"), Evaluation::Unchanged);
    }

    #[test]
    fn test_home_detaches_pending_timer() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.record(&reading("alice", "lobby", 20));
        agg.evaluate("alice");
        let h = handle();
        agg.set_not_home_timer("alice", h);
        agg.record(&reading("alice", "lobby", 99));
        assert_eq!(
            agg.evaluate("alice"),
            Evaluation::Home {
                changed: true,
                cancel_timer: Some(h)
            }
        );
        assert_eq!(agg.user("alice").unwrap().not_home_timer(), None);
        // A timer that fires anyway is stale
        assert!(!agg.expire_not_home("alice", h));
        assert_eq!(agg.state_of("alice"), Some(HomeState::Home));
    }

    #[test]
    fn test_expiry_moves_to_not_home_once() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.record(&reading("alice", "lobby", 20));
        agg.evaluate("alice");
        let h = handle();
        agg.set_not_home_timer("alice", h);
        assert!(agg.expire_not_home("alice", h));
        assert_eq!(agg.state_of("alice"), Some(HomeState::NotHome));
        assert!(!agg.expire_not_home("alice", h));

        // Already Not Home: further low readings do nothing
        agg.record(&reading("alice", "lobby", 5));
        assert_eq!(agg.evaluate("alice"), Evaluation::Unchanged);
    }

    #[test]
    fn test_unknown_readings_are_indeterminate() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.restore_location("alice", "Alice", "lobby", None);
        assert_eq!(agg.evaluate("alice"), Evaluation::Unchanged);
        assert_eq!(agg.state_of("alice"), Some(HomeState::Initializing));
    }

    #[test]
    fn test_unknown_readings_excluded_from_max() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.restore_location("alice", "Alice", "kitchen", None);
        agg.record(&reading("alice", "lobby", 30));
        assert_eq!(agg.user("alice").unwrap().max_confidence(), Some(30));
        assert_eq!(agg.evaluate("alice"), Evaluation::StartNotHomeTimer);
    }

    #[test]
    fn test_restored_not_home_skips_timer() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.restore_location("alice", "Alice", "lobby", Some(10));
        agg.restore_state("alice", "Alice", HomeState::NotHome);
        agg.record(&reading("alice", "lobby", 5));
        assert_eq!(agg.evaluate("alice"), Evaluation::Unchanged);
        assert_eq!(agg.state_of("alice"), Some(HomeState::NotHome));

        agg.record(&reading("alice", "lobby", 95));
        assert!(matches!(
            agg.evaluate("alice"),
            Evaluation::Home { changed: true, .. }
        ));
    }

    #[test]
    fn test_restore_state_does_not_override_live_state() {
        let mut agg = ConfidenceAggregator::new(90);
        agg.record(&reading("alice", "lobby", 95));
        agg.evaluate("alice");
        agg.restore_state("alice", "Alice", HomeState::NotHome);
        assert_eq!(agg.state_of("alice"), Some(HomeState::Home));
    }

    #[test]
    fn test_unknown_user_unchanged() {
        let mut agg = ConfidenceAggregator::new(90);
        assert_eq!(agg.evaluate("nobody"), Evaluation::Unchanged);
        assert!(!agg.expire_not_home("nobody", handle()));
    }
}
