use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PresenceError;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root topic the scanners publish under and scan requests are sent to.
    #[serde(default = "default_presence_topic")]
    pub presence_topic: String,
    /// Host namespace holding the platform entities (sensors, gateways).
    #[serde(default = "default_hass_namespace")]
    pub hass_namespace: String,
    /// Seconds a user's readings must stay low before declaring Not Home.
    #[serde(default = "default_not_home_timeout")]
    pub not_home_timeout: u64,
    #[serde(default = "default_minimum_confidence")]
    pub minimum_confidence: u8,
    /// Seconds to wait before sending a Depart scan request.
    #[serde(default = "default_depart_check_time")]
    pub depart_check_time: u64,
    /// Household members, as home-state binary sensor entity ids.
    pub users_sensors: Vec<String>,
    /// Door/gateway contact sensors whose transitions trigger scans.
    pub home_gateway_sensors: Vec<String>,
    /// Radio id to display name for beacons with a fixed identity.
    #[serde(default)]
    pub known_beacons: HashMap<String, String>,
    /// Display name aliases applied after identity resolution.
    #[serde(default)]
    pub maps: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub report_only_known_beacons: bool,
    /// Name the scanners report for known devices they cannot name.
    #[serde(default = "default_unknown_name")]
    pub unknown_name: String,
    #[serde(default = "default_occupancy_check_delay")]
    pub occupancy_check_delay: u64,
    #[serde(default = "default_sensor_publish_delay")]
    pub sensor_publish_delay: u64,
}

fn default_presence_topic() -> String {
    "presence".to_string()
}

fn default_hass_namespace() -> String {
    "default".to_string()
}

fn default_not_home_timeout() -> u64 {
    120
}

fn default_minimum_confidence() -> u8 {
    90
}

fn default_depart_check_time() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_unknown_name() -> String {
    "Unknown Name".to_string()
}

fn default_occupancy_check_delay() -> u64 {
    2
}

fn default_sensor_publish_delay() -> u64 {
    1
}

impl Config {
    /// Config with every optional field at its default.
    pub fn new(users_sensors: Vec<String>, home_gateway_sensors: Vec<String>) -> Self {
        Self {
            presence_topic: default_presence_topic(),
            hass_namespace: default_hass_namespace(),
            not_home_timeout: default_not_home_timeout(),
            minimum_confidence: default_minimum_confidence(),
            depart_check_time: default_depart_check_time(),
            users_sensors,
            home_gateway_sensors,
            known_beacons: HashMap::new(),
            maps: HashMap::new(),
            report_only_known_beacons: true,
            unknown_name: default_unknown_name(),
            occupancy_check_delay: default_occupancy_check_delay(),
            sensor_publish_delay: default_sensor_publish_delay(),
        }
    }

    pub fn validate(&self) -> Result<(), PresenceError> {
        if self.presence_topic.trim().is_empty() || self.presence_topic.contains('/') {
            return Err(PresenceError::Configuration(format!(
                "presence_topic must be a single non-empty topic segment, got {:?}",
                self.presence_topic
            )));
        }
        if self.minimum_confidence > 100 {
            return Err(PresenceError::Configuration(format!(
                "minimum_confidence must be within 0-100, got {}",
                self.minimum_confidence
            )));
        }
        if self.not_home_timeout == 0 || self.depart_check_time == 0 {
            return Err(PresenceError::Configuration(
                "not_home_timeout and depart_check_time must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn not_home_timeout(&self) -> Duration {
        Duration::from_secs(self.not_home_timeout)
    }

    pub fn depart_check_time(&self) -> Duration {
        Duration::from_secs(self.depart_check_time)
    }

    pub fn occupancy_check_delay(&self) -> Duration {
        Duration::from_secs(self.occupancy_check_delay)
    }

    pub fn sensor_publish_delay(&self) -> Duration {
        Duration::from_secs(self.sensor_publish_delay)
    }
}

/// Presence state of a single tracked user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomeState {
    Initializing,
    Home,
    NotHome,
}

impl HomeState {
    /// State name mirrored to the host for other automations.
    pub fn as_str(&self) -> &'static str {
        match self {
            HomeState::Initializing => "Initializing",
            HomeState::Home => "Home",
            HomeState::NotHome => "Not Home",
        }
    }

    /// Parse a binary sensor state ("on"/"off") as reported by the host.
    pub fn from_binary_state(state: &str) -> Option<Self> {
        match state.to_ascii_lowercase().as_str() {
            "on" => Some(HomeState::Home),
            "off" => Some(HomeState::NotHome),
            _ => None,
        }
    }
}

/// How a scanner identified a sighted device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// A device the scanner was configured to look for (`KNOWN_MAC`).
    Known,
    /// An anonymous advertising beacon (`GENERIC_BEACON`).
    Beacon,
}

/// Kind of scan that can be requested from the scanners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    Arrive,
    Depart,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Arrive => "Arrive",
            ScanKind::Depart => "Depart",
        }
    }
}

/// Lifecycle phase reported by a scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Start,
    End,
}

/// Busy/idle status of the shared scan resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    Idle,
    Scanning,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Idle => "idle",
            MonitorStatus::Scanning => "scanning",
        }
    }
}

/// One confidence value for a user at a location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfidenceReading {
    pub user_id: String,
    /// Display name the user's sensors are announced with.
    pub display_name: String,
    pub location_id: String,
    pub confidence: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_minimal_json() {
        let config: Config = serde_json::from_str(
            r#"{"users_sensors": ["binary_sensor.alice_home_state"],
                "home_gateway_sensors": ["binary_sensor.front_door"]}"#,
        )
        .unwrap();
        assert_eq!(config.presence_topic, "presence");
        assert_eq!(config.hass_namespace, "default");
        assert_eq!(config.not_home_timeout, 120);
        assert_eq!(config.minimum_confidence, 90);
        assert_eq!(config.depart_check_time, 30);
        assert!(config.report_only_known_beacons);
        assert!(config.known_beacons.is_empty());
        assert_eq!(config.unknown_name, "Unknown Name");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_requires_member_and_gateway_lists() {
        let result: Result<Config, _> = serde_json::from_str(r#"{"presence_topic": "monitor"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_rejects_out_of_range_confidence() {
        let mut config = Config::new(vec![], vec![]);
        config.minimum_confidence = 101;
        assert!(config.validate().unwrap_err().is_fatal());
    }

    #[test]
    fn test_config_rejects_nested_topic() {
        let mut config = Config::new(vec![], vec![]);
        config.presence_topic = "home/presence".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_home_state_from_binary_state() {
        assert_eq!(HomeState::from_binary_state("on"), Some(HomeState::Home));
        assert_eq!(HomeState::from_binary_state("OFF"), Some(HomeState::NotHome));
        assert_eq!(HomeState::from_binary_state("unknown"), None);
    }
}
