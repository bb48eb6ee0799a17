//! A UDP integration broker for live vehicle telemetry, advisory fan-out and
//! fleet subscriptions.
//!
//! The broker mediates between three kinds of peers over plain UDP datagrams:
//! vehicles reporting telemetry and receiving advisories, decision processors
//! consuming fleet state and producing advisories and per-vehicle decisions,
//! and backend consumers subscribing to aggregated views.
//!
//! A deployment runs one [`ConnectionsManager`] per listening role, all
//! sharing one [`DataModel`]:
//!
//! ```no_run
//! use std::time::Duration;
//! use fleetlink::manager::{ConnectionsManager, ManagerConfig, DEFAULT_VEHICLE_PORT};
//! use fleetlink::protocol::{Area, Position};
//! use fleetlink::{ConnectionKind, DataModel, Sinks};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let area = Area {
//!         top_left: Position { lat: 48.8, lon: 17.0 },
//!         bottom_right: Position { lat: 48.1, lon: 17.4 },
//!     };
//!     let model = DataModel::new(area, Duration::from_secs(5));
//!
//!     let vehicles = ConnectionsManager::bind(
//!         ("0.0.0.0", DEFAULT_VEHICLE_PORT),
//!         ManagerConfig::new(ConnectionKind::Vehicle),
//!         model.clone(),
//!         Sinks::in_process(),
//!     )
//!     .await?;
//!     vehicles.run().await;
//!     Ok(())
//! }
//! ```
//!
//! Datagrams are indexed JSON envelopes; see [`protocol`] for the codec.
//! Transport reliability is out of scope: indices are informational, there is
//! no retransmission, and all state is volatile.

pub mod connection;
pub mod manager;
pub mod model;
pub mod protocol;
pub mod sinks;
pub mod stats;
pub mod subscription;

pub use connection::ConnectionKind;
pub use manager::{ConnectionsManager, ManagerConfig};
pub use model::DataModel;
pub use sinks::Sinks;
