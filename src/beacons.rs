//! Beacon identity resolution.
//!
//! Maps radio identifiers to stable display names. Configured names always
//! win; anonymous beacons (when allowed) get the name they broadcast, with a
//! numeric suffix when that name is already taken by another radio id. Generated
//! names are persisted so a beacon keeps its identity across restarts and
//! across sightings that carry no name at all.

use std::collections::HashMap;

use crate::error::PresenceError;
use crate::persistence::PersistenceGateway;
use crate::types::Config;

/// Highest numeric suffix tried when a broadcast name collides.
pub const MAX_NAME_SUFFIX: u32 = 99;

pub struct BeaconResolver {
    /// Lower-cased radio id → configured name.
    known_beacons: HashMap<String, String>,
    aliases: HashMap<String, String>,
    report_only_known: bool,
    unknown_name: String,
}

impl BeaconResolver {
    pub fn new(config: &Config) -> Self {
        Self {
            known_beacons: config
                .known_beacons
                .iter()
                .map(|(mac, name)| (mac.to_lowercase(), name.clone()))
                .collect(),
            aliases: config.maps.clone(),
            report_only_known: config.report_only_known_beacons,
            unknown_name: config.unknown_name.clone(),
        }
    }

    /// Resolve the display name for a sighting of `mac`.
    ///
    /// Returns `Ok(None)` when the sighting should be ignored. New generated
    /// names are persisted before this returns.
    pub fn resolve(
        &self,
        gateway: &mut PersistenceGateway,
        mac: &str,
        reported_name: Option<&str>,
        is_known_device: bool,
    ) -> Result<Option<String>, PresenceError> {
        let mac = mac.to_lowercase();

        if let Some(name) = self.known_beacons.get(&mac) {
            if gateway.retire_beacon(&mac)? {
                log::info!(
                    "Beacon {} now has configured name {:?}, retired generated name",
                    mac,
                    name
                );
            }
            return Ok(Some(self.apply_alias(name)));
        }

        if is_known_device {
            if gateway.retire_beacon(&mac)? {
                log::info!("Beacon {} promoted to known device, retired generated name", mac);
            }
            return Ok(self.usable_name(reported_name).map(|n| self.apply_alias(n)));
        }

        if self.report_only_known {
            log::debug!("Ignoring unknown beacon {}", mac);
            return Ok(None);
        }

        if let Some(name) = gateway.beacon_name(&mac) {
            return Ok(Some(self.apply_alias(name)));
        }

        let Some(base) = self.usable_name(reported_name) else {
            log::debug!("Ignoring unnamed beacon {}", mac);
            return Ok(None);
        };

        let name = self.unused_name(gateway, base)?;
        gateway.assign_beacon(&mac, &name)?;
        log::info!("Assigned name {:?} to beacon {}", name, mac);
        Ok(Some(self.apply_alias(&name)))
    }

    /// Apply the display-name alias table. Matching is exact.
    pub fn apply_alias(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn usable_name<'a>(&self, name: Option<&'a str>) -> Option<&'a str> {
        name.map(str::trim)
            .filter(|n| !n.is_empty() && *n != self.unknown_name)
    }

    fn name_taken(&self, gateway: &PersistenceGateway, name: &str) -> bool {
        gateway.beacon_name_in_use(name) || self.known_beacons.values().any(|n| n == name)
    }

    /// `base`, then `base_1` … `base_99`, first one not assigned to any radio id.
    fn unused_name(
        &self,
        gateway: &PersistenceGateway,
        base: &str,
    ) -> Result<String, PresenceError> {
        if !self.name_taken(gateway, base) {
            return Ok(base.to_string());
        }
        (1..=MAX_NAME_SUFFIX)
            .map(|i| format!("{}_{}", base, i))
            .find(|candidate| !self.name_taken(gateway, candidate))
            .ok_or_else(|| PresenceError::BeaconNamesExhausted {
                name: base.to_string(),
                attempts: MAX_NAME_SUFFIX,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn setup(report_only_known: bool) -> (BeaconResolver, PersistenceGateway) {
        let mut config = Config::new(vec![], vec![]);
        config.report_only_known_beacons = report_only_known;
        config
            .known_beacons
            .insert("AA:AA:AA:AA:AA:AA".into(), "Car Keys".into());
        config.maps.insert("Tile".into(), "Wallet".into());
        let gateway = PersistenceGateway::load(Box::new(MemoryStore::new()), "presence");
        (BeaconResolver::new(&config), gateway)
    }

    #[test]
    fn test_configured_name_always_wins() {
        let (resolver, mut gateway) = setup(true);
        let name = resolver
            .resolve(&mut gateway, "aa:aa:aa:aa:aa:aa", Some("Other"), false)
            .unwrap();
        assert_eq!(name.as_deref(), Some("Car Keys"));
    }

    #[test]
    fn test_configured_name_retires_generated_entry() {
        let (resolver, mut gateway) = setup(false);
        gateway.assign_beacon("aa:aa:aa:aa:aa:aa", "Old Name").unwrap();
        resolver
            .resolve(&mut gateway, "AA:AA:AA:AA:AA:AA", None, false)
            .unwrap();
        assert!(gateway.beacon_name("aa:aa:aa:aa:aa:aa").is_none());
    }

    #[test]
    fn test_unknown_beacon_ignored_when_filtering() {
        let (resolver, mut gateway) = setup(true);
        let name = resolver
            .resolve(&mut gateway, "0f:12", Some("Tracker"), false)
            .unwrap();
        assert_eq!(name, None);
        assert!(gateway.beacons().is_empty());
    }

    #[test]
    fn test_unnamed_beacon_keeps_identity() {
        let (resolver, mut gateway) = setup(false);
        let first = resolver
            .resolve(&mut gateway, "0f:12", Some("Tracker"), false)
            .unwrap();
        let second = resolver.resolve(&mut gateway, "0f:12", None, false).unwrap();
        assert_eq!(first.as_deref(), Some("Tracker"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_colliding_names_get_suffix() {
        let (resolver, mut gateway) = setup(false);
        let a = resolver
            .resolve(&mut gateway, "0f:01", Some("Tracker"), false)
            .unwrap();
        let b = resolver
            .resolve(&mut gateway, "0f:02", Some("Tracker"), false)
            .unwrap();
        let c = resolver
            .resolve(&mut gateway, "0f:03", Some("Tracker"), false)
            .unwrap();
        assert_eq!(a.as_deref(), Some("Tracker"));
        assert_eq!(b.as_deref(), Some("Tracker_1"));
        assert_eq!(c.as_deref(), Some("Tracker_2"));
    }

    #[test]
    fn test_configured_names_count_as_taken() {
        let (resolver, mut gateway) = setup(false);
        let name = resolver
            .resolve(&mut gateway, "0f:01", Some("Car Keys"), false)
            .unwrap();
        assert_eq!(name.as_deref(), Some("Car Keys_1"));
    }

    #[test]
    fn test_suffix_exhaustion_is_fatal() {
        let (resolver, mut gateway) = setup(false);
        gateway.assign_beacon("base", "Tracker").unwrap();
        for i in 1..=MAX_NAME_SUFFIX {
            gateway
                .assign_beacon(&format!("mac{}", i), &format!("Tracker_{}", i))
                .unwrap();
        }
        let err = resolver
            .resolve(&mut gateway, "0f:ff", Some("Tracker"), false)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_nameless_new_beacon_ignored() {
        let (resolver, mut gateway) = setup(false);
        assert_eq!(resolver.resolve(&mut gateway, "0f:12", None, false).unwrap(), None);
        assert_eq!(
            resolver
                .resolve(&mut gateway, "0f:12", Some("Unknown Name"), false)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_known_device_promotion_clears_generated_name() {
        let (resolver, mut gateway) = setup(false);
        resolver
            .resolve(&mut gateway, "0f:12", Some("Tracker"), false)
            .unwrap();
        let name = resolver
            .resolve(&mut gateway, "0f:12", Some("Bob"), true)
            .unwrap();
        assert_eq!(name.as_deref(), Some("Bob"));
        assert!(gateway.beacon_name("0f:12").is_none());
    }

    #[test]
    fn test_alias_applied_after_resolution() {
        let (resolver, mut gateway) = setup(false);
        let name = resolver
            .resolve(&mut gateway, "0f:12", Some("Tile"), false)
            .unwrap();
        assert_eq!(name.as_deref(), Some("Wallet"));
        // The stored identity is the resolved name, not the alias
        assert_eq!(gateway.beacon_name("0f:12"), Some("Tile"));
    }
}
