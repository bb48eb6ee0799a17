//! The process-wide, in-memory model of the fleet.
//!
//! One mutex guards the whole model; mutators and snapshot readers both take
//! it, and nothing holds it across a suspension point. Change fan-out goes
//! through two broadcast channels carrying the VIN that just changed, so
//! subscribers are latest-value consumers: a receiver that falls behind skips
//! ahead and only ever misses intermediate states, never the newest one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::connection::{Connection, WeakConnection};
use crate::protocol::{
    Area, ContentType, DecisionRecord, NotificationRecord, VehicleData, VehicleRecord,
};

/// Capacity of the update fan-out channels. A subscriber further behind than
/// this observes a lag and skips to the newest retained VIN.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Cloneable handle to the shared fleet state.
///
/// Expiry of notifications is driven by spawned timer tasks, so a model must
/// live on a Tokio runtime.
#[derive(Clone)]
pub struct DataModel {
    shared: Arc<Shared>,
}

struct Shared {
    area: Area,
    notification_duration: Duration,
    state: Mutex<State>,
    vehicle_updates: broadcast::Sender<String>,
    decision_updates: broadcast::Sender<String>,
}

struct State {
    vehicles: FnvHashMap<String, VehicleRecord>,
    decisions: FnvHashMap<String, DecisionRecord>,
    notifications: FnvHashMap<u32, FnvHashMap<ContentType, StoredNotification>>,
    connections_by_vehicle_id: FnvHashMap<u32, WeakConnection>,
    next_vehicle_id: u32,
    next_notification_id: u32,
}

struct StoredNotification {
    id: u32,
    record: NotificationRecord,
}

impl StoredNotification {
    /// Whether `other` may take this notification's slot.
    ///
    /// An older notification never displaces a newer one. A fresher one wins
    /// on equal or higher level, or, for the collision variants, when it
    /// concerns the same target vehicle (an update about the same threat may
    /// lower its severity).
    fn replaceable_by(&self, other: &NotificationRecord) -> bool {
        if self.record.timestamp > other.timestamp {
            return false;
        }
        if other.level >= self.record.level {
            return true;
        }
        match (
            self.record.content.target_vehicle_id(),
            other.content.target_vehicle_id(),
        ) {
            (Some(existing), Some(new)) => existing == new,
            _ => false,
        }
    }
}

impl DataModel {
    pub fn new(area: Area, notification_duration: Duration) -> DataModel {
        let (vehicle_updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (decision_updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        DataModel {
            shared: Arc::new(Shared {
                area,
                notification_duration,
                state: Mutex::new(State {
                    vehicles: FnvHashMap::default(),
                    decisions: FnvHashMap::default(),
                    notifications: FnvHashMap::default(),
                    connections_by_vehicle_id: FnvHashMap::default(),
                    next_vehicle_id: 1,
                    next_notification_id: 1,
                }),
                vehicle_updates,
                decision_updates,
            }),
        }
    }

    pub fn area(&self) -> Area {
        self.shared.area
    }

    /// Offer a notification to the model.
    ///
    /// Assigns an id, applies the slot replacement rule and, when stored,
    /// schedules the delayed deletion. Returns whether the notification took
    /// its slot.
    pub fn add_notification(&self, record: NotificationRecord) -> bool {
        let (vehicle_id, content_type, id) = {
            let mut state = self.shared.state.lock();
            let id = state.next_notification_id;
            state.next_notification_id += 1;

            let vehicle_id = record.vehicle_id;
            let content_type = record.content.content_type();
            let slots = state.notifications.entry(vehicle_id).or_default();
            if let Some(existing) = slots.get(&content_type) {
                if !existing.replaceable_by(&record) {
                    debug!(
                        "Rejecting {:?} notification for vehicle {}: existing slot wins",
                        content_type, vehicle_id
                    );
                    return false;
                }
            }
            slots.insert(content_type, StoredNotification { id, record });
            (vehicle_id, content_type, id)
        };

        // Expire the slot later, unless a replacement got there first.
        let model = self.clone();
        let lifetime = self.shared.notification_duration;
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            model.delete_notification(vehicle_id, content_type, id);
        });
        true
    }

    /// Delete the `(vehicle_id, content_type)` slot, but only if it still
    /// holds the notification identified by `id`.
    pub fn delete_notification(&self, vehicle_id: u32, content_type: ContentType, id: u32) {
        let mut state = self.shared.state.lock();
        if let Some(slots) = state.notifications.get_mut(&vehicle_id) {
            if slots.get(&content_type).map_or(false, |held| held.id == id) {
                slots.remove(&content_type);
                if slots.is_empty() {
                    state.notifications.remove(&vehicle_id);
                }
            }
        }
    }

    /// Insert or refresh a vehicle and remember the connection it arrived on.
    ///
    /// An update older than the stored record is discarded; an equal timestamp
    /// is accepted. On acceptance the VIN is broadcast to live subscribers.
    pub fn update_vehicle(
        &self,
        connection: &Connection,
        timestamp: DateTime<Utc>,
        vehicle: VehicleData,
    ) -> bool {
        let vin = vehicle.vin;
        {
            let mut state = self.shared.state.lock();
            let id = match state.vehicles.get(&vin) {
                Some(existing) if timestamp < existing.timestamp => {
                    debug!("Discarding stale update for {}", vin);
                    return false;
                }
                Some(existing) => existing.id,
                None => {
                    let id = state.next_vehicle_id;
                    state.next_vehicle_id += 1;
                    id
                }
            };
            state.vehicles.insert(
                vin.clone(),
                VehicleRecord {
                    id,
                    vin: vin.clone(),
                    timestamp,
                    position: vehicle.position,
                    attributes: vehicle.attributes,
                },
            );
            state
                .connections_by_vehicle_id
                .insert(id, connection.downgrade());
        }
        let _ = self.shared.vehicle_updates.send(vin);
        true
    }

    /// Insert or refresh a decision, last-write-wins by timestamp with the
    /// same staleness rule as vehicles. On acceptance the VIN is broadcast to
    /// decision subscribers.
    pub fn update_vehicle_decision(&self, record: DecisionRecord) -> bool {
        let vin = record.vin.clone();
        {
            let mut state = self.shared.state.lock();
            if let Some(existing) = state.decisions.get(&vin) {
                if record.timestamp < existing.timestamp {
                    debug!("Discarding stale decision for {}", vin);
                    return false;
                }
            }
            state.decisions.insert(vin.clone(), record);
        }
        let _ = self.shared.decision_updates.send(vin);
        true
    }

    /// Remove a vehicle. Its connection index entry is left to go stale;
    /// readers treat a failed upgrade as a missing entry.
    pub fn delete_vehicle(&self, vin: &str) {
        if self.shared.state.lock().vehicles.remove(vin).is_some() {
            debug!("Removed vehicle {}", vin);
        } else {
            warn!("Asked to remove unknown vehicle {}", vin);
        }
    }

    pub fn vehicles(&self) -> Vec<VehicleRecord> {
        self.shared.state.lock().vehicles.values().cloned().collect()
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.shared
            .state
            .lock()
            .notifications
            .values()
            .flat_map(|slots| slots.values().map(|held| held.record.clone()))
            .collect()
    }

    pub fn vehicle(&self, vin: &str) -> Option<VehicleRecord> {
        self.shared.state.lock().vehicles.get(vin).cloned()
    }

    pub fn vehicle_decision(&self, vin: &str) -> Option<DecisionRecord> {
        self.shared.state.lock().decisions.get(vin).cloned()
    }

    /// The connection the identified vehicle last reported on, if it is still
    /// alive.
    pub fn vehicle_connection(&self, vehicle_id: u32) -> Option<Connection> {
        self.shared
            .state
            .lock()
            .connections_by_vehicle_id
            .get(&vehicle_id)
            .and_then(WeakConnection::upgrade)
    }

    /// Stream of VINs whose vehicle record just changed.
    pub fn subscribe_vehicle_updates(&self) -> broadcast::Receiver<String> {
        self.shared.vehicle_updates.subscribe()
    }

    /// Stream of VINs whose decision just changed.
    pub fn subscribe_decision_updates(&self) -> broadcast::Receiver<String> {
        self.shared.decision_updates.subscribe()
    }
}
