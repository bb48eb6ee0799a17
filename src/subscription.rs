//! Long-lived delivery tasks bound to a connection.
//!
//! A subscription is one spawned task plus a handle carrying its cancellation
//! token. Stopping is a token flip: it never blocks, so it is safe to call
//! from any context, including while connection locks are held.

use std::str::FromStr;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::protocol::outbound::{
    DecisionPush, NetworkStatisticsUpdate, NotificationsUpdate, VehiclePosition, VehiclesUpdate,
};
use crate::stats::NetworkStats;

/// Delivery mode, selected by the `content` field of a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Content {
    /// Snapshot of a topic every `interval` seconds.
    PeriodicUpdates,
    /// One push per observed vehicle change, coalesced to the latest state.
    LiveUpdates,
    /// Pushes of decisions targeting the subscribed VIN.
    DecisionUpdate,
}

#[derive(Debug, Error)]
#[error("Unknown subscription content `{0}`")]
pub struct UnknownContent(String);

impl FromStr for Content {
    type Err = UnknownContent;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "periodic-updates" => Ok(Content::PeriodicUpdates),
            "live-updates" => Ok(Content::LiveUpdates),
            "decision-update" => Ok(Content::DecisionUpdate),
            other => Err(UnknownContent(other.to_string())),
        }
    }
}

/// Handle to a running subscription task.
pub struct Subscription {
    content: Content,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Start the delivery task for `content` on `connection`.
    ///
    /// The broadcast receivers for the change-driven modes are opened here,
    /// before the task is spawned, so no update published after `spawn`
    /// returns can be missed.
    pub(crate) fn spawn(
        connection: Connection,
        content: Content,
        topic: String,
        interval: f32,
    ) -> Subscription {
        let cancel = CancellationToken::new();
        let task = match content {
            Content::PeriodicUpdates => {
                let interval = Duration::from_secs_f32(interval.max(0.0));
                tokio::spawn(run_periodic(connection, topic, interval, cancel.clone()))
            }
            Content::LiveUpdates => {
                let updates = connection.model().subscribe_vehicle_updates();
                tokio::spawn(run_live(connection, updates, cancel.clone()))
            }
            Content::DecisionUpdate => {
                let updates = connection.model().subscribe_decision_updates();
                tokio::spawn(run_decision(connection, topic, updates, cancel.clone()))
            }
        };
        Subscription {
            content,
            cancel,
            task,
        }
    }

    /// Signal the task to stop. The task observes the token at its next wait
    /// point; periodic tasks also check it between emissions.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn content(&self) -> Content {
        self.content
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_periodic(
    connection: Connection,
    topic: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        match topic.as_str() {
            "vehicles" => connection.write_datagram(&VehiclesUpdate {
                vehicles: connection.model().vehicles(),
            }),
            "notifications" => connection.write_datagram(&NotificationsUpdate {
                notifications: connection.model().notifications(),
            }),
            "network-statistics" => send_network_statistics(&connection),
            other => {
                warn!(
                    "Ending periodic subscription for {}: unsupported topic `{}`",
                    connection.peer_addr(),
                    other
                );
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Assemble the per-vehicle aggregates from the key-value sink. Vehicles
/// without a stats blob are skipped.
fn send_network_statistics(connection: &Connection) {
    let mut records = Vec::new();
    for vehicle in connection.model().vehicles() {
        let blob = match connection.sinks().cache.get(&vehicle.vin) {
            Some(blob) => blob,
            None => continue,
        };
        match serde_json::from_slice::<NetworkStats>(&blob) {
            Ok(stats) => records.push(stats.snapshot()),
            Err(error) => warn!(
                "Discarding unreadable network stats for {}: {}",
                vehicle.vin, error
            ),
        }
    }
    connection.write_datagram(&NetworkStatisticsUpdate {
        network_statistics: records,
    });
}

async fn run_live(
    connection: Connection,
    mut updates: Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let vin = tokio::select! {
            _ = cancel.cancelled() => return,
            received = updates.recv() => match received {
                Ok(vin) => vin,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(
                        "Live subscriber {} lagged, skipping {} updates",
                        connection.peer_addr(),
                        skipped
                    );
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
        };
        // The vehicle may have been deleted between the broadcast and now.
        if let Some(vehicle) = connection.model().vehicle(&vin) {
            connection.write_datagram(&VehiclePosition { vehicle });
        }
    }
}

async fn run_decision(
    connection: Connection,
    vin: String,
    mut updates: Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let updated = tokio::select! {
            _ = cancel.cancelled() => return,
            received = updates.recv() => match received {
                Ok(updated) => updated,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            },
        };
        if updated != vin {
            continue;
        }
        if let Some(decision) = connection.model().vehicle_decision(&vin) {
            connection.write_datagram(&DecisionPush {
                vehicle_decision: decision,
            });
        }
    }
}
