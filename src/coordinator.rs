//! Presence coordinator.
//!
//! Owns every piece of in-memory state (user records, household flags, the
//! scan resource, pending timers) and is driven one event at a time by the
//! service loop. Inbound messages go through the classifier; sightings are
//! resolved to a user, recorded, and evaluated; transitions are published and
//! fan out into household checks and scan requests.
//!
//! Time is passed in explicitly so callers (and tests) control it. Deferred
//! work is registered in the [`TimerRegistry`] and run by [`Coordinator::fire_due`].

use std::collections::HashMap;

use serde_json::json;
use tokio::time::Instant;

use crate::beacons::BeaconResolver;
use crate::classifier::{classify, DeviceSighting, InboundEvent};
use crate::confidence::{ConfidenceAggregator, Evaluation};
use crate::db::KeyValueStore;
use crate::error::PresenceError;
use crate::host::{EntityStore, Publisher, APP_NAMESPACE};
use crate::monitor::{ArriveRequest, GatewayPlan, ScanOrchestrator};
use crate::occupancy::{FlagUpdate, OccupancyAggregator};
use crate::persistence::PersistenceGateway;
use crate::scheduler::{TimerHandle, TimerKey, TimerRegistry};
use crate::types::{
    Config, ConfidenceReading, DeviceKind, HomeState, MonitorStatus, ScanKind, ScanPhase,
};
use crate::util::{
    app_entity, binary_sensor_config_topic, binary_sensor_entity, binary_sensor_state_topic,
    confidence_sensor_entity, confidence_sensor_id, normalize_id, on_off, scan_request_topic,
    sensor_config_topic, sensor_state_topic, title_case, user_sensor_entity, user_state_id,
    EVERYONE_HOME_STATE, EVERYONE_NOT_HOME_STATE,
};

/// App state id mirroring the scan resource.
const MONITOR_STATE: &str = "monitor_state";

/// Where a confidence sensor's value comes from
#[derive(Debug, Clone)]
struct SensorOwner {
    user_id: String,
    location_id: String,
}

pub struct Coordinator {
    config: Config,
    resolver: BeaconResolver,
    store: PersistenceGateway,
    confidence: ConfidenceAggregator,
    occupancy: OccupancyAggregator,
    monitor: ScanOrchestrator,
    timers: TimerRegistry,
    publisher: Box<dyn Publisher>,
    entities: Box<dyn EntityStore>,
    /// Confidence sensor id → owning user and location.
    sensors: HashMap<String, SensorOwner>,
    /// Last seen open/closed state per gateway sensor.
    gateway_states: HashMap<String, bool>,
}

impl Coordinator {
    /// Build a coordinator and announce the household flag entities the host
    /// does not have yet.
    pub fn new(
        config: Config,
        store: Box<dyn KeyValueStore>,
        publisher: Box<dyn Publisher>,
        entities: Box<dyn EntityStore>,
    ) -> Result<Self, PresenceError> {
        config.validate()?;

        let store = PersistenceGateway::load(store, &config.presence_topic);
        let mut coordinator = Self {
            resolver: BeaconResolver::new(&config),
            confidence: ConfidenceAggregator::new(config.minimum_confidence),
            occupancy: OccupancyAggregator::new(config.users_sensors.clone()),
            monitor: ScanOrchestrator::new(),
            timers: TimerRegistry::new(),
            sensors: HashMap::new(),
            gateway_states: HashMap::new(),
            config,
            store,
            publisher,
            entities,
        };

        coordinator.announce_household_flag(EVERYONE_NOT_HOME_STATE, "Everyone Not Home State");
        coordinator.announce_household_flag(EVERYONE_HOME_STATE, "Everyone Home State");
        coordinator.mirror_monitor();
        Ok(coordinator)
    }

    /// Rebuild in-memory state after a restart.
    ///
    /// Persisted sensors the host no longer has are dropped from storage; the
    /// rest are re-attached to their users with the value the host still
    /// reports, if any. Users and household flags start from the state the
    /// host last showed for them.
    pub fn restore(&mut self) -> Result<(), PresenceError> {
        let everyone_home = self.host_flag(EVERYONE_HOME_STATE);
        let everyone_not_home = self.host_flag(EVERYONE_NOT_HOME_STATE);
        self.occupancy.restore(everyone_home, everyone_not_home);

        let mut stale = Vec::new();
        let persisted: Vec<(String, String)> = self
            .store
            .sensors()
            .iter()
            .map(|(sensor, state)| (sensor.clone(), state.clone()))
            .collect();

        for (sensor_id, state_id) in persisted {
            let entity = confidence_sensor_entity(&sensor_id);
            if !self.entities.exists(&self.config.hass_namespace, &entity) {
                log::info!("Sensor {} no longer exists, removing it", entity);
                stale.push(sensor_id);
                continue;
            }
            let Some(owner) = split_sensor_id(&sensor_id, &state_id) else {
                log::warn!(
                    "Cannot map sensor {} to user state {}, removing it",
                    sensor_id,
                    state_id
                );
                stale.push(sensor_id);
                continue;
            };
            let value = self
                .entities
                .get_state(&self.config.hass_namespace, &entity)
                .and_then(|s| parse_confidence(&s));
            let display_name = title_case(&owner.user_id);
            self.confidence.restore_location(
                &owner.user_id,
                &display_name,
                &owner.location_id,
                value,
            );
            let host_state = self
                .entities
                .get_state(&self.config.hass_namespace, &user_sensor_entity(&owner.user_id))
                .and_then(|s| HomeState::from_binary_state(&s));
            if let Some(state) = host_state {
                self.confidence
                    .restore_state(&owner.user_id, &display_name, state);
            }
            self.sensors.insert(sensor_id, owner);
        }

        self.store.remove_sensors(&stale)?;
        log::info!(
            "Restored {} confidence sensor(s), removed {}",
            self.sensors.len(),
            stale.len()
        );
        Ok(())
    }

    // =========================================================================
    // Inbound events
    // =========================================================================

    /// Process one message from the presence topic tree.
    pub fn handle_message(
        &mut self,
        topic: &str,
        payload: &str,
        now: Instant,
    ) -> Result<(), PresenceError> {
        let Some(event) = classify(
            &self.config.presence_topic,
            &self.config.unknown_name,
            topic,
            payload,
        ) else {
            log::debug!("Dropped message on {}", topic);
            return Ok(());
        };
        log::debug!("{} event on {}", event.label(), topic);

        match event {
            InboundEvent::ScannerStatus { location, text } => {
                log::info!(
                    "The presence system in the {} is {}",
                    title_case(&location),
                    title_case(&text)
                );
                Ok(())
            }
            InboundEvent::ScanLifecycle {
                location,
                identity,
                phase,
            } => {
                self.handle_lifecycle(&location, identity.as_deref(), phase);
                Ok(())
            }
            InboundEvent::DeviceSeen(sighting) => self.handle_sighting(sighting, now),
        }
    }

    /// A gateway sensor (door, gate) reported `opened`.
    ///
    /// Only edges count: a repeat of the last known state is ignored.
    pub fn handle_gateway(
        &mut self,
        entity_id: &str,
        opened: bool,
        now: Instant,
    ) -> Result<(), PresenceError> {
        if !self.config.home_gateway_sensors.iter().any(|g| g == entity_id) {
            log::debug!("Ignoring state of {}, not a gateway sensor", entity_id);
            return Ok(());
        }
        if self.gateway_states.insert(entity_id.to_string(), opened) == Some(opened) {
            return Ok(());
        }

        if self.timers.cancel(&TimerKey::DepartScan) {
            log::debug!("Cancelled pending Depart scan");
        }

        let plan = GatewayPlan::for_occupancy(
            self.occupancy.everyone_home(),
            self.occupancy.everyone_not_home(),
        );
        log::info!(
            "Gateway {} {}, arrive={} depart={}",
            entity_id,
            if opened { "opened" } else { "closed" },
            plan.arrive,
            plan.depart
        );
        if plan.arrive {
            self.request_arrive();
        }
        if plan.depart {
            self.schedule_depart(now);
        }
        Ok(())
    }

    /// Run every timer due at `now`.
    pub fn fire_due(&mut self, now: Instant) -> Result<(), PresenceError> {
        while let Some((key, handle)) = self.timers.pop_due(now) {
            self.fire(key, handle, now)?;
        }
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn home_state(&self, user_id: &str) -> Option<HomeState> {
        self.confidence.state_of(user_id)
    }

    pub fn confidence(&self) -> &ConfidenceAggregator {
        &self.confidence
    }

    pub fn monitor_status(&self) -> MonitorStatus {
        self.monitor.status()
    }

    pub fn monitor(&self) -> &ScanOrchestrator {
        &self.monitor
    }

    pub fn everyone_home(&self) -> Option<bool> {
        self.occupancy.everyone_home()
    }

    pub fn everyone_not_home(&self) -> Option<bool> {
        self.occupancy.everyone_not_home()
    }

    pub fn is_timer_pending(&self, key: &TimerKey) -> bool {
        self.timers.is_pending(key)
    }

    pub fn persistence(&self) -> &PersistenceGateway {
        &self.store
    }

    // =========================================================================
    // Scan lifecycle
    // =========================================================================

    fn handle_lifecycle(&mut self, location: &str, identity: Option<&str>, phase: ScanPhase) {
        match phase {
            ScanPhase::Start => {
                if self.monitor.start(location) {
                    log::info!("Scanner {} ({:?}) started, monitor scanning", location, identity);
                }
            }
            ScanPhase::End => {
                let released = self.monitor.end(location);
                if self.monitor.is_idle() {
                    log::info!("Scanner {} ({:?}) finished, monitor idle", location, identity);
                }
                for kind in released {
                    self.publish_scan(kind);
                }
            }
        }
        self.mirror_monitor();
    }

    fn request_arrive(&mut self) {
        match self.monitor.request_arrive() {
            ArriveRequest::PublishNow => self.publish_scan(ScanKind::Arrive),
            ArriveRequest::Queued => log::info!("Monitor busy, Arrive scan waits for idle"),
            ArriveRequest::AlreadyPending => log::debug!("Arrive scan already waiting for idle"),
        }
    }

    fn schedule_depart(&mut self, now: Instant) {
        self.timers
            .schedule(TimerKey::DepartScan, now + self.config.depart_check_time());
    }

    fn publish_scan(&mut self, kind: ScanKind) {
        let topic = scan_request_topic(&self.config.presence_topic, kind);
        log::info!("Requesting {} scan", kind.as_str());
        self.publisher.publish(&topic, "");
    }

    // =========================================================================
    // Sightings
    // =========================================================================

    fn handle_sighting(
        &mut self,
        sighting: DeviceSighting,
        now: Instant,
    ) -> Result<(), PresenceError> {
        let is_known = sighting.kind == DeviceKind::Known;
        let Some(display_name) = self.resolver.resolve(
            &mut self.store,
            &sighting.mac,
            sighting.name.as_deref(),
            is_known,
        )?
        else {
            return Ok(());
        };

        let user_id = normalize_id(&display_name);
        if user_id.is_empty() {
            log::debug!("Display name {:?} normalizes to nothing, dropped", display_name);
            return Ok(());
        }

        let reading = ConfidenceReading {
            user_id: user_id.clone(),
            display_name,
            location_id: sighting.location,
            confidence: sighting.confidence,
        };
        let sensor_id = confidence_sensor_id(&reading.user_id, &reading.location_id);
        let outcome = self.confidence.record(&reading);

        if !self.sensors.contains_key(&sensor_id) {
            self.register_sensor(&sensor_id, &reading, now);
        } else if outcome.value_changed {
            let first_value_pending = self.timers.is_pending(&TimerKey::SensorState {
                sensor_id: sensor_id.clone(),
            });
            if !first_value_pending {
                self.publish_confidence(&sensor_id, reading.confidence);
            }
        }

        // A failed write is retried on the next sighting and does not hold
        // back the decision for this one.
        let persisted = self
            .store
            .register_sensor(&sensor_id, &user_state_id(&user_id))
            .map(|_| ());

        self.mirror_user(&user_id);
        self.evaluate_user(&user_id, now);
        persisted
    }

    /// First sighting of a (user, location): announce the sensor and queue its
    /// first value.
    fn register_sensor(&mut self, sensor_id: &str, reading: &ConfidenceReading, now: Instant) {
        let entity = confidence_sensor_entity(sensor_id);
        if !self.entities.exists(&self.config.hass_namespace, &entity) {
            log::info!("Creating sensor {:?} for confidence", entity);
            let payload = json!({
                "name": format!("{} {}", reading.display_name, title_case(&reading.location_id)),
                "state_topic": sensor_state_topic(&self.config.presence_topic, sensor_id),
            });
            self.publisher.publish(
                &sensor_config_topic(&self.config.presence_topic, sensor_id),
                &payload.to_string(),
            );
        }

        let state_id = user_state_id(&reading.user_id);
        let user_sensor = user_sensor_entity(&reading.user_id);
        if !self.entities.exists(&self.config.hass_namespace, &user_sensor) {
            log::info!("Creating sensor {:?} for home state", user_sensor);
            let payload = json!({
                "name": format!("{} Home State", reading.display_name),
                "device_class": "presence",
                "state_topic": binary_sensor_state_topic(&state_id),
            });
            self.publisher
                .publish(&binary_sensor_config_topic(&state_id), &payload.to_string());
        }

        self.sensors.insert(
            sensor_id.to_string(),
            SensorOwner {
                user_id: reading.user_id.clone(),
                location_id: reading.location_id.clone(),
            },
        );

        // The host needs a moment to create the entity before it accepts a value
        self.timers.schedule(
            TimerKey::SensorState {
                sensor_id: sensor_id.to_string(),
            },
            now + self.config.sensor_publish_delay(),
        );
    }

    fn publish_confidence(&mut self, sensor_id: &str, confidence: u8) {
        let topic = sensor_state_topic(&self.config.presence_topic, sensor_id);
        self.publisher.publish(&topic, &confidence.to_string());
    }

    // =========================================================================
    // Decisions and transitions
    // =========================================================================

    fn evaluate_user(&mut self, user_id: &str, now: Instant) {
        match self.confidence.evaluate(user_id) {
            Evaluation::Home {
                changed,
                cancel_timer,
            } => {
                if let Some(handle) = cancel_timer {
                    self.timers.cancel_handle(handle);
                    log::debug!("Cancelled Not Home timer for {}", user_id);
                }
                // Home is re-sent on every qualifying reading; household flags
                // only move on a change.
                if changed {
                    self.transition(user_id, HomeState::Home, now);
                } else {
                    self.publish_state(user_id, HomeState::Home);
                }
            }
            Evaluation::StartNotHomeTimer => {
                log::debug!("Readings for {} are low, starting Not Home timer", user_id);
                self.request_arrive();
                let handle = self.timers.schedule(
                    TimerKey::NotHome {
                        user_id: user_id.to_string(),
                    },
                    now + self.config.not_home_timeout(),
                );
                self.confidence.set_not_home_timer(user_id, handle);
            }
            Evaluation::Unchanged => {}
        }
    }

    /// Publish a user's new state and update the household flags.
    fn transition(&mut self, user_id: &str, state: HomeState, now: Instant) {
        log::info!("{} is now {}", user_id, state.as_str());
        self.publish_state(user_id, state);

        if !self.occupancy.is_member(&user_sensor_entity(user_id)) {
            return;
        }
        let (update, check) = if state == HomeState::Home {
            (self.occupancy.member_arrived(), TimerKey::EveryoneHomeCheck)
        } else {
            (self.occupancy.member_departed(), TimerKey::EveryoneNotHomeCheck)
        };
        if let Some(update) = update {
            self.publish_flag(update);
        }
        self.timers
            .schedule(check, now + self.config.occupancy_check_delay());
    }

    fn publish_state(&mut self, user_id: &str, state: HomeState) {
        let topic = binary_sensor_state_topic(&user_state_id(user_id));
        self.publisher
            .publish(&topic, on_off(state == HomeState::Home));
        self.mirror_user(user_id);
    }

    fn fire(
        &mut self,
        key: TimerKey,
        handle: TimerHandle,
        now: Instant,
    ) -> Result<(), PresenceError> {
        match key {
            TimerKey::NotHome { user_id } => {
                if self.confidence.expire_not_home(&user_id, handle) {
                    self.transition(&user_id, HomeState::NotHome, now);
                }
            }
            TimerKey::DepartScan => {
                if self.monitor.depart_ready() {
                    self.publish_scan(ScanKind::Depart);
                } else {
                    log::debug!("Monitor busy, retrying Depart scan later");
                    self.schedule_depart(now);
                }
            }
            TimerKey::EveryoneHomeCheck => {
                let states = self.member_states();
                if let Some(update) = self.occupancy.check_everyone_home(states) {
                    self.publish_flag(update);
                }
            }
            TimerKey::EveryoneNotHomeCheck => {
                let states = self.member_states();
                if let Some(update) = self.occupancy.check_everyone_not_home(states) {
                    self.publish_flag(update);
                }
            }
            TimerKey::SensorState { sensor_id } => {
                let value = self.sensors.get(&sensor_id).and_then(|owner| {
                    self.confidence
                        .user(&owner.user_id)
                        .and_then(|u| u.reading(&owner.location_id))
                });
                if let Some(value) = value {
                    self.publish_confidence(&sensor_id, value);
                }
            }
        }
        Ok(())
    }

    /// Current state of every household member.
    ///
    /// Members without a settled in-memory record fall back to what the host
    /// reports for their binary sensor.
    fn member_states(&self) -> Vec<Option<HomeState>> {
        self.occupancy
            .members()
            .iter()
            .map(|member| {
                self.confidence
                    .users()
                    .find(|u| user_sensor_entity(&u.user_id) == *member)
                    .map(|u| u.state())
                    .filter(|s| *s != HomeState::Initializing)
                    .or_else(|| {
                        self.entities
                            .get_state(&self.config.hass_namespace, member)
                            .and_then(|s| HomeState::from_binary_state(&s))
                    })
            })
            .collect()
    }

    // =========================================================================
    // Outbound state
    // =========================================================================

    fn publish_flag(&mut self, update: FlagUpdate) {
        let (state_id, value) = match update {
            FlagUpdate::EveryoneHome(value) => (EVERYONE_HOME_STATE, value),
            FlagUpdate::EveryoneNotHome(value) => (EVERYONE_NOT_HOME_STATE, value),
        };
        log::info!("{} is now {}", state_id, on_off(value));
        self.publisher
            .publish(&binary_sensor_state_topic(state_id), on_off(value));
        self.entities.set_state(
            APP_NAMESPACE,
            &app_entity(&self.config.presence_topic, state_id),
            if value { "true" } else { "false" },
            json!({}),
        );
    }

    fn announce_household_flag(&mut self, state_id: &str, name: &str) {
        if self
            .entities
            .exists(&self.config.hass_namespace, &binary_sensor_entity(state_id))
        {
            return;
        }
        log::info!("Creating binary sensor for {}", name);
        let payload = json!({
            "name": name,
            "device_class": "presence",
            "state_topic": binary_sensor_state_topic(state_id),
        });
        self.publisher
            .publish(&binary_sensor_config_topic(state_id), &payload.to_string());
    }

    fn host_flag(&self, state_id: &str) -> Option<bool> {
        let state = self
            .entities
            .get_state(&self.config.hass_namespace, &binary_sensor_entity(state_id))?;
        match state.to_ascii_lowercase().as_str() {
            "on" => Some(true),
            "off" => Some(false),
            _ => None,
        }
    }

    /// Mirror a user's record as an app state for other automations.
    fn mirror_user(&mut self, user_id: &str) {
        let Some(user) = self.confidence.user(user_id) else {
            return;
        };
        let entity = app_entity(&self.config.presence_topic, &user_state_id(user_id));
        let state = user.state().as_str();
        let attributes = json!({ "confidence": user.max_confidence() });
        self.entities
            .set_state(APP_NAMESPACE, &entity, state, attributes);
    }

    fn mirror_monitor(&mut self) {
        let entity = app_entity(&self.config.presence_topic, MONITOR_STATE);
        let locations: Vec<&str> = self.monitor.active_locations().collect();
        let attributes = json!({ "locations": locations });
        self.entities
            .set_state(APP_NAMESPACE, &entity, self.monitor.status().as_str(), attributes);
    }
}

/// `alice_lobby` owned by `alice_home_state` → alice at lobby.
fn split_sensor_id(sensor_id: &str, state_id: &str) -> Option<SensorOwner> {
    let user_id = state_id.strip_suffix("_home_state")?;
    let location_id = sensor_id.strip_prefix(user_id)?.strip_prefix('_')?;
    if user_id.is_empty() || location_id.is_empty() {
        return None;
    }
    Some(SensorOwner {
        user_id: user_id.to_string(),
        location_id: location_id.to_string(),
    })
}

/// Parse a confidence value as stored by the host. "unknown" and friends are `None`.
fn parse_confidence(state: &str) -> Option<u8> {
    let value: f64 = state.trim().parse().ok()?;
    if (0.0..=100.0).contains(&value) {
        Some(value.round() as u8)
    } else {
        None
    }
}
