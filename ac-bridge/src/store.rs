/*!
 * DEVICE STATE STORE - Authoritative in-memory snapshot of every AC unit
 *
 * ROLE: merges cloud status events into per-device state, reports exactly which
 * fields changed, remembers what was last published and accumulates power samples
 * for the current averaging window.
 *
 * CONCURRENCY: one global parking_lot mutex. Device counts are a handful per
 * household, and every operation is a short in-memory critical section.
 */

use crate::models::{FieldMap, PowerSample};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Running sum of power samples for the current window.
#[derive(Debug, Clone, Default)]
pub struct PowerAccumulator {
    sum: f64,
    count: u32,
}

impl PowerAccumulator {
    pub fn record(&mut self, sample: PowerSample) {
        self.sum += sample.watts;
        self.count += 1;
    }

    /// Mean of the window, then starts a fresh one. `None` means no data.
    pub fn drain(&mut self) -> Option<f64> {
        let average = (self.count > 0).then(|| self.sum / f64::from(self.count));
        *self = Self::default();
        average
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceEntry {
    current: FieldMap,
    last_published: FieldMap,
    power: PowerAccumulator,
}

/// Outcome of merging one status event.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedStatus {
    /// Fields whose value differs from the prior one, including new fields.
    pub changed: FieldMap,
    /// True when this event created the device entry.
    pub first_observation: bool,
}

#[derive(Clone, Default)]
pub struct DeviceStore {
    devices: Shared<HashMap<String, DeviceEntry>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_status_event(&self, device_id: &str, fields: FieldMap) -> AppliedStatus {
        let mut devices = self.devices.lock();
        let first_observation = !devices.contains_key(device_id);
        let entry = devices.entry(device_id.to_string()).or_default();

        let mut changed = FieldMap::new();
        for (name, value) in fields {
            if entry.current.get(&name) != Some(&value) {
                entry.current.insert(name.clone(), value.clone());
                changed.insert(name, value);
            }
        }

        AppliedStatus { changed, first_observation }
    }

    pub fn full_snapshot(&self, device_id: &str) -> Option<FieldMap> {
        self.devices.lock().get(device_id).map(|entry| entry.current.clone())
    }

    /// Remembers what went out on the bus. Only values still current are kept, so
    /// the published view never holds a superseded value.
    pub fn mark_published(&self, device_id: &str, fields: &FieldMap) {
        let mut devices = self.devices.lock();
        if let Some(entry) = devices.get_mut(device_id) {
            for (name, value) in fields {
                if entry.current.get(name) == Some(value) {
                    entry.last_published.insert(name.clone(), value.clone());
                }
            }
        }
    }

    pub fn last_published(&self, device_id: &str) -> Option<FieldMap> {
        self.devices.lock().get(device_id).map(|entry| entry.last_published.clone())
    }

    /// Returns false when the device has not been observed yet; the sample is dropped.
    pub fn record_power_sample(&self, device_id: &str, watts: f64, at: OffsetDateTime) -> bool {
        match self.devices.lock().get_mut(device_id) {
            Some(entry) => {
                entry.power.record(PowerSample { watts, at });
                true
            }
            None => false,
        }
    }

    pub fn drain_power_average(&self, device_id: &str) -> Option<f64> {
        self.devices.lock().get_mut(device_id).and_then(|entry| entry.power.drain())
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.lock().contains_key(device_id)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldValue;

    fn fields(pairs: &[(&str, FieldValue)]) -> FieldMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_first_event_reports_all_fields() {
        let store = DeviceStore::new();
        let applied = store.apply_status_event("living-room", fields(&[("power", 500.into())]));

        assert!(applied.first_observation);
        assert_eq!(applied.changed, fields(&[("power", 500.into())]));
    }

    #[test]
    fn test_delta_is_exactly_the_changed_fields() {
        let store = DeviceStore::new();
        store.apply_status_event(
            "den",
            fields(&[("power", 500.into()), ("mode", "heat".into()), ("fan", "auto".into())]),
        );

        let applied = store.apply_status_event(
            "den",
            fields(&[("power", 520.into()), ("mode", "heat".into()), ("swing", "off".into())]),
        );
        assert!(!applied.first_observation);
        assert_eq!(applied.changed, fields(&[("power", 520.into()), ("swing", "off".into())]));

        let repeat = store.apply_status_event("den", fields(&[("power", 520.into())]));
        assert!(repeat.changed.is_empty());
    }

    #[test]
    fn test_full_snapshot_holds_every_known_field() {
        let store = DeviceStore::new();
        store.apply_status_event("den", fields(&[("power", 500.into())]));
        store.apply_status_event("den", fields(&[("mode", "cool".into())]));

        let snapshot = store.full_snapshot("den").unwrap();
        assert_eq!(snapshot, fields(&[("power", 500.into()), ("mode", "cool".into())]));
        assert!(store.full_snapshot("attic").is_none());
    }

    #[test]
    fn test_devices_are_independent() {
        let store = DeviceStore::new();
        store.apply_status_event("a", fields(&[("power", 1.into())]));
        let applied = store.apply_status_event("b", fields(&[("power", 1.into())]));
        assert!(applied.first_observation);
        assert_eq!(store.device_ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_power_average_and_reset() {
        let store = DeviceStore::new();
        store.apply_status_event("den", FieldMap::new());
        let now = OffsetDateTime::now_utc();

        for watts in [400.0, 500.0, 600.0] {
            assert!(store.record_power_sample("den", watts, now));
        }
        assert_eq!(store.drain_power_average("den"), Some(500.0));
        assert_eq!(store.drain_power_average("den"), None);

        store.record_power_sample("den", 0.0, now);
        assert_eq!(store.drain_power_average("den"), Some(0.0));
    }

    #[test]
    fn test_power_sample_for_unknown_device_is_dropped() {
        let store = DeviceStore::new();
        assert!(!store.record_power_sample("ghost", 100.0, OffsetDateTime::now_utc()));
        assert!(!store.contains("ghost"));
        assert_eq!(store.drain_power_average("ghost"), None);
    }

    #[test]
    fn test_published_view_never_holds_superseded_values() {
        let store = DeviceStore::new();
        store.apply_status_event("den", fields(&[("power", 500.into())]));
        let stale = fields(&[("power", 500.into())]);
        store.apply_status_event("den", fields(&[("power", 520.into())]));

        store.mark_published("den", &stale);
        assert!(store.last_published("den").unwrap().is_empty());

        store.mark_published("den", &fields(&[("power", 520.into())]));
        assert_eq!(store.last_published("den").unwrap(), fields(&[("power", 520.into())]));
    }
}
