//! Device registry for routing commands to devices
//!
//! The registry maps device ids to:
//! - the device kind announced at registration
//! - the last status datagram received for it
//! - the command sink wrapping its registration connection
//!
//! One coarse mutex guards the whole map. It is held only for the map
//! operation itself; callers write to sinks after the guard is dropped.
//! Records are never removed: a device whose connection died stays listed
//! until it registers again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use city_protocol::{DeviceKind, DeviceSummary, StatusPayload};

use crate::sink::CommandSink;

// ============================================================================
// Records
// ============================================================================

/// Everything the Gateway knows about one device
pub struct DeviceRecord {
    pub id: String,
    pub kind: DeviceKind,
    /// Most recently processed status payload
    pub last_status: Option<StatusPayload>,
    /// When `last_status` was received by the Gateway
    pub status_received_at: Option<SystemTime>,
    pub sink: Arc<dyn CommandSink>,
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("last_status", &self.last_status)
            .field("status_received_at", &self.status_received_at)
            .field("sink", &self.sink.peer())
            .finish()
    }
}

/// Routing information for one device
#[derive(Clone)]
pub struct Route {
    pub kind: DeviceKind,
    pub sink: Arc<dyn CommandSink>,
}

// ============================================================================
// Registry Structure
// ============================================================================

/// Shared map of registered devices
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        DeviceRegistry {
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    // Every operation leaves the map consistent, so a panic elsewhere
    // while holding the guard does not invalidate the data.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DeviceRecord>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a device, replacing any record with the same id
    ///
    /// Returns the replaced record so the caller can close its sink outside
    /// the lock.
    pub fn insert(
        &self,
        id: impl Into<String>,
        kind: DeviceKind,
        sink: Arc<dyn CommandSink>,
    ) -> Option<DeviceRecord> {
        let id = id.into();
        let record = DeviceRecord {
            id: id.clone(),
            kind,
            last_status: None,
            status_received_at: None,
            sink,
        };
        self.lock().insert(id, record)
    }

    /// Overwrite the last status of a registered device
    ///
    /// Returns false (and changes nothing) when `id` is not registered.
    pub fn update_status(&self, id: &str, payload: StatusPayload) -> bool {
        match self.lock().get_mut(id) {
            Some(record) => {
                record.last_status = Some(payload);
                record.status_received_at = Some(SystemTime::now());
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of all devices, ordered by id
    pub fn snapshot(&self) -> Vec<DeviceSummary> {
        self.lock()
            .values()
            .map(|record| DeviceSummary {
                id: record.id.clone(),
                kind: record.kind,
            })
            .collect()
    }

    /// Sink for routing a command to `id`
    pub fn lookup_connection(&self, id: &str) -> Option<Arc<dyn CommandSink>> {
        self.lookup_route(id).map(|route| route.sink)
    }

    /// Kind and sink of `id`, read under one lock acquisition
    pub fn lookup_route(&self, id: &str) -> Option<Route> {
        self.lock().get(id).map(|record| Route {
            kind: record.kind,
            sink: Arc::clone(&record.sink),
        })
    }

    /// Last status and its receive time
    pub fn status_of(&self, id: &str) -> Option<(StatusPayload, SystemTime)> {
        let devices = self.lock();
        let record = devices.get(id)?;
        match (&record.last_status, record.status_received_at) {
            (Some(status), Some(at)) => Some((status.clone(), at)),
            _ => None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingSink;
    use std::thread;

    fn sink() -> Arc<RecordingSink> {
        Arc::new(RecordingSink::default())
    }

    #[test]
    fn test_insert_and_snapshot() {
        let registry = DeviceRegistry::new();
        registry.insert("lamp_ab12", DeviceKind::LampPost, sink());
        registry.insert("cam_0001", DeviceKind::Camera, sink());

        assert_eq!(
            registry.snapshot(),
            vec![
                DeviceSummary {
                    id: "cam_0001".to_string(),
                    kind: DeviceKind::Camera
                },
                DeviceSummary {
                    id: "lamp_ab12".to_string(),
                    kind: DeviceKind::LampPost
                },
            ]
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_reregistration_replaces_record() {
        let registry = DeviceRegistry::new();
        let first = sink();
        let second = sink();

        assert!(registry.insert("x", DeviceKind::LampPost, first.clone()).is_none());
        registry.update_status("x", StatusPayload::FreeText("on".into()));

        let replaced = registry
            .insert("x", DeviceKind::TrafficLight, second.clone())
            .expect("first record returned");
        assert_eq!(replaced.kind, DeviceKind::LampPost);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, DeviceKind::TrafficLight);

        // Status does not carry over to the new registration
        assert!(registry.status_of("x").is_none());

        // Routing goes to the second sink
        let route = registry.lookup_connection("x").unwrap();
        route.send_frame(b"cmd").unwrap();
        assert!(first.frames().is_empty());
        assert_eq!(second.frames(), vec![b"cmd".to_vec()]);
    }

    #[test]
    fn test_update_status_unknown_is_noop() {
        let registry = DeviceRegistry::new();
        registry.insert("temp_1", DeviceKind::TempSensor, sink());

        assert!(!registry.update_status("ghost", StatusPayload::Temperature(20.0)));
        assert!(!registry.contains("ghost"));
        assert_eq!(registry.len(), 1);
        assert!(registry.status_of("temp_1").is_none());
    }

    #[test]
    fn test_update_status_keeps_latest() {
        let registry = DeviceRegistry::new();
        registry.insert("temp_1", DeviceKind::TempSensor, sink());

        assert!(registry.update_status("temp_1", StatusPayload::Temperature(20.0)));
        assert!(registry.update_status("temp_1", StatusPayload::Temperature(23.5)));

        let (status, at) = registry.status_of("temp_1").unwrap();
        assert_eq!(status, StatusPayload::Temperature(23.5));
        assert!(at <= SystemTime::now());
    }

    #[test]
    fn test_lookup_missing() {
        let registry = DeviceRegistry::new();
        assert!(registry.lookup_connection("nope").is_none());
        assert!(registry.lookup_route("nope").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_route_kind() {
        let registry = DeviceRegistry::new();
        registry.insert("sema_1", DeviceKind::TrafficLight, sink());
        assert_eq!(
            registry.lookup_route("sema_1").unwrap().kind,
            DeviceKind::TrafficLight
        );
    }

    #[test]
    fn test_snapshot_isolated_from_later_inserts() {
        let registry = DeviceRegistry::new();
        registry.insert("a", DeviceKind::Camera, sink());
        let snapshot = registry.snapshot();
        registry.insert("b", DeviceKind::Camera, sink());

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_concurrent_inserts_and_snapshots() {
        let registry = Arc::new(DeviceRegistry::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..200 {
                        // Half the ids collide across writers
                        let id = if i % 2 == 0 {
                            format!("shared_{}", i)
                        } else {
                            format!("w{}_{}", w, i)
                        };
                        registry.insert(id, DeviceKind::AirSensor, sink());
                    }
                })
            })
            .collect();

        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..200 {
                    let snapshot = registry.snapshot();
                    // Ordered and duplicate-free at every point in time
                    assert!(snapshot.windows(2).all(|w| w[0].id < w[1].id));
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        // 100 shared ids + 4 writers * 100 private ids
        assert_eq!(registry.len(), 100 + 4 * 100);
    }
}
