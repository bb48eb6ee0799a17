//! Type definitions for datagrams sent by the broker.
//!
//! Each message is its own struct implementing [`OutboundMessage`]; the
//! connection stamps the shared head fields (`index`, `type`, `timestamp`) at
//! send time via [`encode`], so message values themselves stay immutable.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::types::{
    DecisionRecord, Level, NetworkStatsRecord, NotificationContent, NotificationRecord, Position,
    VehicleRecord,
};

/// A message the broker can place inside an outgoing datagram.
pub trait OutboundMessage: Serialize {
    /// Value of the `type` field stamped onto the wire datagram.
    const TYPE: &'static str;
}

/// Serialize `message` with the stamped head fields flattened alongside it.
pub fn encode<M: OutboundMessage>(
    index: u32,
    timestamp: DateTime<Utc>,
    message: &M,
) -> Result<Vec<u8>, serde_json::Error> {
    #[derive(Serialize)]
    struct Wire<'a, M> {
        index: u32,
        #[serde(rename = "type")]
        kind: &'static str,
        #[serde(with = "crate::protocol::types::timestamp")]
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        message: &'a M,
    }

    serde_json::to_vec(&Wire {
        index,
        kind: M::TYPE,
        timestamp,
        message,
    })
}

/// Echo of a received index, confirming the datagram was handled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledge {
    pub acknowledging_index: u32,
}

impl OutboundMessage for Acknowledge {
    const TYPE: &'static str = "acknowledge";
}

/// The configured bounds, in response to `request_area`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaBounds {
    pub top_left: Position,
    pub bottom_right: Position,
}

impl OutboundMessage for AreaBounds {
    const TYPE: &'static str = "area";
}

/// An advisory forwarded to the vehicle it concerns.
#[derive(Debug, Clone, Serialize)]
pub struct NotifyVehicle {
    pub level: Level,
    #[serde(flatten)]
    pub content: NotificationContent,
}

impl OutboundMessage for NotifyVehicle {
    const TYPE: &'static str = "notify_vehicle";
}

/// Periodic fleet snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct VehiclesUpdate {
    pub vehicles: Vec<VehicleRecord>,
}

impl OutboundMessage for VehiclesUpdate {
    const TYPE: &'static str = "update_vehicles";
}

/// Periodic advisory snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationsUpdate {
    pub notifications: Vec<NotificationRecord>,
}

impl OutboundMessage for NotificationsUpdate {
    const TYPE: &'static str = "update_notifications";
}

/// Live delta for a single vehicle, pushed to `live-updates` subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct VehiclePosition {
    pub vehicle: VehicleRecord,
}

impl OutboundMessage for VehiclePosition {
    const TYPE: &'static str = "update_vehicle_position";
}

/// A decision pushed to the vehicle it targets.
///
/// Goes out with the `update_vehicle_position` type value; the receiving side
/// tells the two apart by the payload key. This mirrors the deployed protocol
/// and cannot change without a coordinated client update.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPush {
    pub vehicle_decision: DecisionRecord,
}

impl OutboundMessage for DecisionPush {
    const TYPE: &'static str = "update_vehicle_position";
}

/// Per-vehicle network quality aggregate for `network-statistics` subscribers.
///
/// Carries the `update_vehicles` type value, as the deployed protocol does.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatisticsUpdate {
    pub network_statistics: Vec<NetworkStatsRecord>,
}

impl OutboundMessage for NetworkStatisticsUpdate {
    const TYPE: &'static str = "update_vehicles";
}

/// Instruction for a vehicle to migrate to another integration endpoint.
/// Wire-level only; `connect_to` is empty until a neighbouring module exists.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectVehicle {
    pub connect_to: String,
}

impl OutboundMessage for DisconnectVehicle {
    const TYPE: &'static str = "disconnect_vehicle";
}
