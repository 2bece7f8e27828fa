//! Persistence gateway for identity and ownership mappings.
//!
//! Two JSON objects are kept in the durable store:
//! - `{presence_topic}_sensors`: confidence sensor id → user state id
//! - `{presence_topic}_beacons`: beacon radio id → assigned display name
//!
//! Both are loaded once at startup and written back synchronously on every
//! mutation. The durable copy is the source of truth after a restart.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::db::KeyValueStore;
use crate::error::PresenceError;

pub struct PersistenceGateway {
    store: Box<dyn KeyValueStore>,
    sensors_key: String,
    beacons_key: String,
    sensors: BTreeMap<String, String>,
    beacons: BTreeMap<String, String>,
}

impl PersistenceGateway {
    /// Load both mappings. Missing or unreadable keys start out empty.
    pub fn load(store: Box<dyn KeyValueStore>, presence_topic: &str) -> Self {
        let sensors_key = format!("{}_sensors", presence_topic);
        let beacons_key = format!("{}_beacons", presence_topic);
        let sensors = read_map(store.as_ref(), &sensors_key);
        let beacons = read_map(store.as_ref(), &beacons_key);
        log::info!(
            "Loaded {} sensor mapping(s) and {} beacon name(s)",
            sensors.len(),
            beacons.len()
        );
        Self {
            store,
            sensors_key,
            beacons_key,
            sensors,
            beacons,
        }
    }

    // =========================================================================
    // Sensors
    // =========================================================================

    pub fn sensors(&self) -> &BTreeMap<String, String> {
        &self.sensors
    }

    /// Record that `sensor_id` belongs to `user_state_id`.
    ///
    /// Returns `false` without touching the store if the mapping already exists.
    pub fn register_sensor(
        &mut self,
        sensor_id: &str,
        user_state_id: &str,
    ) -> Result<bool, PresenceError> {
        if self.sensors.get(sensor_id).map(String::as_str) == Some(user_state_id) {
            return Ok(false);
        }
        let mut updated = self.sensors.clone();
        updated.insert(sensor_id.to_string(), user_state_id.to_string());
        write_map(self.store.as_mut(), &self.sensors_key, &updated)?;
        self.sensors = updated;
        Ok(true)
    }

    /// Drop sensors the host no longer knows about.
    pub fn remove_sensors(&mut self, sensor_ids: &[String]) -> Result<(), PresenceError> {
        if sensor_ids.iter().all(|id| !self.sensors.contains_key(id)) {
            return Ok(());
        }
        let mut updated = self.sensors.clone();
        for id in sensor_ids {
            updated.remove(id);
        }
        write_map(self.store.as_mut(), &self.sensors_key, &updated)?;
        self.sensors = updated;
        Ok(())
    }

    // =========================================================================
    // Beacons
    // =========================================================================

    pub fn beacons(&self) -> &BTreeMap<String, String> {
        &self.beacons
    }

    pub fn beacon_name(&self, mac: &str) -> Option<&str> {
        self.beacons.get(mac).map(String::as_str)
    }

    pub fn beacon_name_in_use(&self, name: &str) -> bool {
        self.beacons.values().any(|n| n == name)
    }

    pub fn assign_beacon(&mut self, mac: &str, name: &str) -> Result<(), PresenceError> {
        let mut updated = self.beacons.clone();
        updated.insert(mac.to_string(), name.to_string());
        write_map(self.store.as_mut(), &self.beacons_key, &updated)?;
        self.beacons = updated;
        Ok(())
    }

    /// Remove a generated beacon name. Returns whether one existed.
    pub fn retire_beacon(&mut self, mac: &str) -> Result<bool, PresenceError> {
        if !self.beacons.contains_key(mac) {
            return Ok(false);
        }
        let mut updated = self.beacons.clone();
        updated.remove(mac);
        write_map(self.store.as_mut(), &self.beacons_key, &updated)?;
        self.beacons = updated;
        Ok(true)
    }
}

fn read_map(store: &dyn KeyValueStore, key: &str) -> BTreeMap<String, String> {
    let value = match store.get(key) {
        Ok(Some(value)) => value,
        Ok(None) => return BTreeMap::new(),
        Err(e) => {
            log::warn!("Failed to read {} from storage, starting empty: {}", key, e);
            return BTreeMap::new();
        }
    };

    // Older stores kept the mapping as a JSON-encoded string
    let value = match value {
        Value::String(text) => match serde_json::from_str(&text) {
            Ok(inner) => inner,
            Err(e) => {
                log::warn!("Stored {} is not valid JSON, starting empty: {}", key, e);
                return BTreeMap::new();
            }
        },
        other => other,
    };

    match value {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect(),
        _ => {
            log::warn!("Stored {} is not an object, starting empty", key);
            BTreeMap::new()
        }
    }
}

fn write_map(
    store: &mut dyn KeyValueStore,
    key: &str,
    map: &BTreeMap<String, String>,
) -> Result<(), PresenceError> {
    let value = serde_json::to_value(map)?;
    store.put(key, &value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use serde_json::json;

    /// Store whose writes always fail.
    struct ReadOnlyStore(MemoryStore);

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Result<Option<Value>, PresenceError> {
            self.0.get(key)
        }

        fn put(&mut self, _key: &str, _value: &Value) -> Result<(), PresenceError> {
            Err(PresenceError::Io("read-only".into()))
        }
    }

    #[test]
    fn test_load_empty_store() {
        let gateway = PersistenceGateway::load(Box::new(MemoryStore::new()), "presence");
        assert!(gateway.sensors().is_empty());
        assert!(gateway.beacons().is_empty());
    }

    #[test]
    fn test_load_legacy_string_encoding() {
        let mut store = MemoryStore::new();
        store
            .put(
                "presence_sensors",
                &json!(r#"{"alice_lobby": "alice_home_state"}"#),
            )
            .unwrap();
        let gateway = PersistenceGateway::load(Box::new(store), "presence");
        assert_eq!(
            gateway.sensors().get("alice_lobby").map(String::as_str),
            Some("alice_home_state")
        );
    }

    #[test]
    fn test_load_garbage_falls_back_to_empty() {
        let mut store = MemoryStore::new();
        store.put("presence_beacons", &json!([1, 2, 3])).unwrap();
        store.put("presence_sensors", &json!("{broken")).unwrap();
        let gateway = PersistenceGateway::load(Box::new(store), "presence");
        assert!(gateway.beacons().is_empty());
        assert!(gateway.sensors().is_empty());
    }

    #[test]
    fn test_register_sensor_idempotent() {
        let mut gateway = PersistenceGateway::load(Box::new(MemoryStore::new()), "presence");
        assert!(gateway.register_sensor("alice_lobby", "alice_home_state").unwrap());
        assert!(!gateway.register_sensor("alice_lobby", "alice_home_state").unwrap());
        assert_eq!(gateway.sensors().len(), 1);
    }

    #[test]
    fn test_failed_write_leaves_mapping_unchanged() {
        let mut gateway =
            PersistenceGateway::load(Box::new(ReadOnlyStore(MemoryStore::new())), "presence");
        assert!(gateway.assign_beacon("0f:12", "Tile").is_err());
        assert!(gateway.beacon_name("0f:12").is_none());
    }

    #[test]
    fn test_beacon_assign_and_retire() {
        let mut gateway = PersistenceGateway::load(Box::new(MemoryStore::new()), "presence");
        gateway.assign_beacon("0f:12", "Tile").unwrap();
        assert_eq!(gateway.beacon_name("0f:12"), Some("Tile"));
        assert!(gateway.beacon_name_in_use("Tile"));
        assert!(gateway.retire_beacon("0f:12").unwrap());
        assert!(!gateway.retire_beacon("0f:12").unwrap());
        assert!(!gateway.beacon_name_in_use("Tile"));
    }

    #[test]
    fn test_remove_sensors() {
        let mut gateway = PersistenceGateway::load(Box::new(MemoryStore::new()), "presence");
        gateway.register_sensor("alice_lobby", "alice_home_state").unwrap();
        gateway.register_sensor("bob_lobby", "bob_home_state").unwrap();
        gateway.remove_sensors(&["alice_lobby".to_string()]).unwrap();
        assert_eq!(gateway.sensors().len(), 1);
        assert!(gateway.sensors().contains_key("bob_lobby"));
    }
}
