//! Deterministic identifier and topic construction.
//!
//! Every entity id, sensor id and topic the service emits is built here so the
//! same display name always maps to the same identifiers.

use crate::types::ScanKind;

/// Discovery prefix the host platform listens on for entity announcements.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// State id of the "everyone home" household flag.
pub const EVERYONE_HOME_STATE: &str = "everyone_home_state";

/// State id of the "everyone not home" household flag.
pub const EVERYONE_NOT_HOME_STATE: &str = "everyone_not_home_state";

/// Normalize a display name into an identifier.
///
/// Lower-cases, turns whitespace into `_` and strips everything that is not
/// alphanumeric or `_`.
///
/// Example: "Alice's Phone" → "alices_phone"
pub fn normalize_id(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('_')
            } else if c.is_alphanumeric() || c == '_' {
                Some(c)
            } else {
                None
            }
        })
        .collect()
}

/// Human-readable form of a location topic segment.
///
/// Example: "living_room" → "Living Room"
pub fn title_case(segment: &str) -> String {
    segment
        .split(|c: char| c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// `alice` → `alice_home_state`
pub fn user_state_id(user_id: &str) -> String {
    format!("{}_home_state", user_id)
}

/// Binary sensor entity holding a user's home state.
pub fn user_sensor_entity(user_id: &str) -> String {
    format!("binary_sensor.{}", user_state_id(user_id))
}

/// `alice` at `living_room` → `alice_living_room`
pub fn confidence_sensor_id(user_id: &str, location_id: &str) -> String {
    format!("{}_{}", user_id, location_id)
}

pub fn confidence_sensor_entity(sensor_id: &str) -> String {
    format!("sensor.{}", sensor_id)
}

pub fn binary_sensor_entity(state_id: &str) -> String {
    format!("binary_sensor.{}", state_id)
}

/// Entity the service mirrors its own state into, e.g. `presence.alice_home_state`.
pub fn app_entity(presence_topic: &str, id: &str) -> String {
    format!("{}.{}", presence_topic, id)
}

pub fn sensor_config_topic(presence_topic: &str, sensor_id: &str) -> String {
    format!("{}/sensor/{}/{}/config", DISCOVERY_PREFIX, presence_topic, sensor_id)
}

pub fn sensor_state_topic(presence_topic: &str, sensor_id: &str) -> String {
    format!("{}/sensor/{}/{}/state", DISCOVERY_PREFIX, presence_topic, sensor_id)
}

pub fn binary_sensor_config_topic(state_id: &str) -> String {
    format!("{}/binary_sensor/{}/config", DISCOVERY_PREFIX, state_id)
}

pub fn binary_sensor_state_topic(state_id: &str) -> String {
    format!("{}/binary_sensor/{}/state", DISCOVERY_PREFIX, state_id)
}

/// `presence` + Arrive → `presence/scan/Arrive`
pub fn scan_request_topic(presence_topic: &str, kind: ScanKind) -> String {
    format!("{}/scan/{}", presence_topic, kind.as_str())
}

/// Payload for a binary sensor state.
pub fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_id_basic() {
        assert_eq!(normalize_id("Alice"), "alice");
    }

    #[test]
    fn test_normalize_id_strips_punctuation() {
        assert_eq!(normalize_id("Alice's Phone"), "alices_phone");
        assert_eq!(normalize_id("John’s iPhone"), "johns_iphone");
        assert_eq!(normalize_id("Bob (work)"), "bob_work");
    }

    #[test]
    fn test_normalize_id_keeps_underscores() {
        assert_eq!(normalize_id("tile_1"), "tile_1");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("living_room"), "Living Room");
        assert_eq!(title_case("LOBBY"), "Lobby");
    }

    #[test]
    fn test_entity_ids() {
        assert_eq!(user_state_id("alice"), "alice_home_state");
        assert_eq!(user_sensor_entity("alice"), "binary_sensor.alice_home_state");
        assert_eq!(confidence_sensor_id("alice", "lobby"), "alice_lobby");
        assert_eq!(confidence_sensor_entity("alice_lobby"), "sensor.alice_lobby");
        assert_eq!(app_entity("presence", "monitor_state"), "presence.monitor_state");
    }

    #[test]
    fn test_topics() {
        assert_eq!(
            sensor_state_topic("presence", "alice_lobby"),
            "homeassistant/sensor/presence/alice_lobby/state"
        );
        assert_eq!(
            binary_sensor_state_topic(EVERYONE_HOME_STATE),
            "homeassistant/binary_sensor/everyone_home_state/state"
        );
        assert_eq!(scan_request_topic("presence", ScanKind::Depart), "presence/scan/Depart");
    }
}
