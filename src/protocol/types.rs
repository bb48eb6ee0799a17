//! Wire types shared between inbound and outbound datagrams.
//!
//! Field names follow the camelCase convention of the JSON API; the structs
//! here double as the records stored in the [`DataModel`](crate::model::DataModel),
//! so a snapshot read can be serialized onto the wire without another mapping
//! layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Serde adapter for the fixed wire timestamp format.
///
/// Apply with `#[serde(with = "timestamp")]`. The format carries millisecond
/// precision only, so [`now`] truncates accordingly to keep a stamped value
/// identical to its wire representation.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, ParseError, SubsecRound, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::protocol::TIMESTAMP_FORMAT;

    /// The current UTC time, truncated to wire precision.
    pub fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }

    /// Parse a wire timestamp.
    pub fn parse(raw: &str) -> Result<DateTime<Utc>, ParseError> {
        NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map(|naive| Utc.from_utc_datetime(&naive))
    }

    /// Format a timestamp the way it appears on the wire.
    pub fn format(value: &DateTime<Utc>) -> String {
        value.format(TIMESTAMP_FORMAT).to_string()
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(de::Error::custom)
    }
}

/// A geographic point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f32,
    pub lon: f32,
}

/// The rectangular region this broker is authoritative for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    pub top_left: Position,
    pub bottom_right: Position,
}

impl Area {
    /// Whether `position` lies inside the bounds, edges included.
    pub fn contains(&self, position: Position) -> bool {
        position.lat <= self.top_left.lat
            && position.lat >= self.bottom_right.lat
            && position.lon >= self.top_left.lon
            && position.lon <= self.bottom_right.lon
    }
}

/// Severity of an advisory. Ordering is significant: a notification can only
/// be displaced by one of equal or higher level (or a fresher update about
/// the same threat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Danger,
}

/// Discriminator of the advisory content variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Generic,
    HeadCollision,
    ChainCollision,
    Crossroad,
}

/// Variant-specific advisory content, adjacently tagged on the wire as
/// `{"contentType": ..., "content": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "contentType", content = "content", rename_all = "snake_case")]
pub enum NotificationContent {
    Generic(GenericContent),
    HeadCollision(HeadCollisionContent),
    ChainCollision(ChainCollisionContent),
    Crossroad(CrossroadContent),
}

impl NotificationContent {
    pub fn content_type(&self) -> ContentType {
        match self {
            NotificationContent::Generic(_) => ContentType::Generic,
            NotificationContent::HeadCollision(_) => ContentType::HeadCollision,
            NotificationContent::ChainCollision(_) => ContentType::ChainCollision,
            NotificationContent::Crossroad(_) => ContentType::Crossroad,
        }
    }

    /// The vehicle a collision warning points at. Only the collision variants
    /// carry a target.
    pub fn target_vehicle_id(&self) -> Option<u32> {
        match self {
            NotificationContent::HeadCollision(content) => Some(content.target_vehicle_id),
            NotificationContent::ChainCollision(content) => Some(content.target_vehicle_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadCollisionContent {
    pub target_vehicle_id: u32,
    pub time_to_collision: f32,
    pub max_speed_exceeded_by: f32,
    pub breaking_distance_diff: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainCollisionContent {
    pub target_vehicle_id: u32,
    pub current_distance: f32,
    pub recommended_distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossroadContent {
    pub text: String,
    pub order: u32,
    pub right_of_way: bool,
}

/// Telemetry as reported by a vehicle: the VIN, an optional typed position,
/// and an attribute bag the broker stores and forwards without inspecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleData {
    pub vin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A vehicle as held by the data model and emitted in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    /// Broker-assigned identity, monotonic from 1, never reused.
    pub id: u32,
    pub vin: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A stored advisory, one per `(vehicle, content type)` slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub vehicle_id: u32,
    pub level: Level,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub content: NotificationContent,
}

/// A processor-issued decision for one vehicle, last-write-wins by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub vin: String,
    pub message: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// The externally visible slice of a connection's network statistics.
/// Latency and jitter are in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatsRecord {
    pub packets_received: u64,
    pub receive_errors: u64,
    pub average_latency: i64,
    pub jitter: i64,
}
