//! Type definitions for datagrams received by the broker.
//!
//! Incoming datagrams are parsed by calling [`InboundMessage::decode`] on a byte
//! slice obtained from the socket. Decoding is a two-stage dispatch: the
//! [`Envelope`] is read first to learn the `type` discriminator, then the same
//! bytes are decoded into the concrete message.
//!
//! # Example
//!
//! ```
//! use fleetlink::protocol::InboundMessage;
//!
//! let packet = br#"{"index":7,"type":"ping","timestamp":"2025-01-01T00:00:00.000Z"}"#;
//! let (envelope, message) = InboundMessage::decode(packet).unwrap();
//!
//! assert_eq!(envelope.index, 7);
//! assert!(matches!(message, Some(InboundMessage::Ping)));
//! ```
//!
//! A datagram whose `type` the broker does not recognize still yields its
//! envelope but no message; the caller drops it without an error, which keeps
//! the receive watermark moving for peers speaking a newer protocol revision.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::protocol::types::{Level, NotificationContent, VehicleData};
use crate::protocol::DecodeError;

/// The fields every datagram carries, regardless of type.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Per-connection sequence number assigned by the sender.
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "crate::protocol::types::timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// A datagram received from a peer, decoded into its concrete form.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Connect,
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    KeepAlive,
    Ping,
    RequestArea,
    Notify(NotifyRequest),
    UpdateVehicle(VehicleUpdate),
    DecisionUpdate(DecisionUpdate),
}

impl InboundMessage {
    /// Decode a datagram from a UDP payload.
    ///
    /// Returns the envelope together with the concrete message, or `None` in
    /// place of the message when the `type` value is not one this side of the
    /// protocol handles.
    pub fn decode(input: &[u8]) -> Result<(Envelope, Option<InboundMessage>), DecodeError> {
        let envelope: Envelope = serde_json::from_slice(input).map_err(DecodeError::Envelope)?;
        let message = match envelope.kind.as_str() {
            "connect" => Some(InboundMessage::Connect),
            "subscribe" => Some(InboundMessage::Subscribe(payload(&envelope, input)?)),
            "unsubscribe" => Some(InboundMessage::Unsubscribe(payload(&envelope, input)?)),
            "keepalive" => Some(InboundMessage::KeepAlive),
            "ping" => Some(InboundMessage::Ping),
            "request_area" => Some(InboundMessage::RequestArea),
            "notify" => Some(InboundMessage::Notify(payload(&envelope, input)?)),
            "update_vehicle" => Some(InboundMessage::UpdateVehicle(payload(&envelope, input)?)),
            "decision_update" => Some(InboundMessage::DecisionUpdate(payload(&envelope, input)?)),
            _ => None,
        };
        Ok((envelope, message))
    }
}

fn payload<'de, T: Deserialize<'de>>(envelope: &Envelope, input: &'de [u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(input).map_err(|source| DecodeError::Payload {
        kind: envelope.kind.clone(),
        source,
    })
}

/// Opens or replaces a subscription on a processor connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscribeRequest {
    /// Delivery mode discriminator (`periodic-updates`, `live-updates`,
    /// `decision-update`).
    pub content: String,
    /// Secondary discriminator: a snapshot topic for periodic mode, a VIN for
    /// decision mode, unused for live mode.
    #[serde(default)]
    pub topic: String,
    /// Emission cadence in seconds; only meaningful in periodic mode.
    #[serde(default)]
    pub interval: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UnsubscribeRequest {
    pub content: String,
}

/// An advisory about one vehicle, submitted by a decision processor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub vehicle_id: u32,
    pub level: Level,
    #[serde(flatten)]
    pub content: NotificationContent,
}

/// Telemetry from a vehicle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VehicleUpdate {
    pub vehicle: VehicleData,
}

/// A decision targeting one VIN, submitted by a decision processor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionUpdate {
    pub vehicle_decision: DecisionData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecisionData {
    pub vin: String,
    pub message: String,
}
