//! Per-peer connection state and datagram handling.
//!
//! One [`Connection`] exists per `(socket, peer address)` pair for the
//! lifetime of its keepalive window. The connection owns the send-index
//! counter and receive watermark; role-specific state lives in a tagged
//! variant so a processor's subscription map and a vehicle's session never
//! coexist on the same peer. The handle is a cheap clone over shared state,
//! which is what subscription tasks hold on to.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::manager::ManagerConfig;
use crate::model::DataModel;
use crate::protocol::outbound::{
    self, Acknowledge, AreaBounds, DisconnectVehicle, NotifyVehicle, OutboundMessage,
};
use crate::protocol::types::timestamp;
use crate::protocol::{
    DecisionRecord, Envelope, InboundMessage, NotificationRecord, NotifyRequest, SubscribeRequest,
};
use crate::sinks::Sinks;
use crate::stats::NetworkStats;
use crate::subscription::{Content, Subscription};

/// Which side of the protocol a listening socket serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Processor,
    Vehicle,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Processor => "processor",
            ConnectionKind::Vehicle => "vehicle",
        }
    }
}

/// Handle to the state of one peer.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

/// Downgraded connection handle held by the data model's vehicle index.
/// Upgrading fails once the manager has discarded the connection.
pub struct WeakConnection(Weak<Shared>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|shared| Connection { shared })
    }
}

struct Shared {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    model: DataModel,
    sinks: Sinks,
    reject_out_of_order: bool,
    enforce_area: bool,
    core: Mutex<Core>,
    role: Role,
}

struct Core {
    next_send_index: u32,
    last_received_index: Option<u32>,
    keepalive: Option<JoinHandle<()>>,
}

enum Role {
    Processor {
        /// At most one subscription per content value.
        subscriptions: Mutex<FnvHashMap<String, Subscription>>,
    },
    Vehicle {
        session: Mutex<VehicleSession>,
    },
}

#[derive(Default)]
struct VehicleSession {
    /// Learned from the first `update_vehicle`.
    vin: Option<String>,
    /// Implicit `decision-update` subscription, created lazily once the VIN
    /// is known.
    decision_subscription: Option<Subscription>,
    stats: NetworkStats,
}

impl Connection {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        config: &ManagerConfig,
        model: DataModel,
        sinks: Sinks,
    ) -> Connection {
        let role = match config.kind {
            ConnectionKind::Processor => Role::Processor {
                subscriptions: Mutex::new(FnvHashMap::default()),
            },
            ConnectionKind::Vehicle => Role::Vehicle {
                session: Mutex::new(VehicleSession::default()),
            },
        };
        Connection {
            shared: Arc::new(Shared {
                socket,
                peer,
                model,
                sinks,
                reject_out_of_order: config.reject_out_of_order,
                enforce_area: config.enforce_area,
                core: Mutex::new(Core {
                    next_send_index: 1,
                    last_received_index: None,
                    keepalive: None,
                }),
                role,
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub(crate) fn model(&self) -> &DataModel {
        &self.shared.model
    }

    pub(crate) fn sinks(&self) -> &Sinks {
        &self.shared.sinks
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.shared))
    }

    /// Stamp, serialize and send one datagram to the peer.
    ///
    /// The send index is consumed even when serialization or the send fails,
    /// so index sequences may have gaps on errors. The core lock is held
    /// across the non-blocking send to keep per-connection sends in index
    /// order.
    pub(crate) fn write_datagram<M: OutboundMessage>(&self, message: &M) {
        let mut core = self.shared.core.lock();
        let index = core.next_send_index;
        core.next_send_index += 1;

        let data = match outbound::encode(index, timestamp::now(), message) {
            Ok(data) => data,
            Err(err) => {
                warn!("Failed to serialize `{}` datagram: {}", M::TYPE, err);
                return;
            }
        };

        match self.shared.socket.try_send_to(&data, self.shared.peer) {
            Ok(_) => trace!(
                "Sent `{}` datagram #{} to {}",
                M::TYPE,
                index,
                self.shared.peer
            ),
            Err(err) => warn!(
                "Failed to send datagram #{} to {}: {}",
                index, self.shared.peer, err
            ),
        }
    }

    /// Decode and handle one received datagram.
    ///
    /// The receive watermark advances after handling, also for datagram types
    /// this role ignores; only undecodable datagrams leave it untouched.
    pub(crate) fn process_datagram(&self, data: &[u8], received_at: DateTime<Utc>) {
        let (envelope, message) = match InboundMessage::decode(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("Dropping malformed datagram from {}: {}", self.shared.peer, err);
                self.shared.sinks.telemetry.capture_error(&err);
                if let Role::Vehicle { session } = &self.shared.role {
                    session.lock().stats.record_receive_error();
                }
                return;
            }
        };

        if self.shared.reject_out_of_order {
            let watermark = self.shared.core.lock().last_received_index;
            if let Some(watermark) = watermark {
                if envelope.index <= watermark {
                    debug!(
                        "Dropping out-of-order datagram #{} from {} (watermark {})",
                        envelope.index, self.shared.peer, watermark
                    );
                    return;
                }
            }
        }

        match message {
            Some(message) => match &self.shared.role {
                Role::Processor { subscriptions } => {
                    self.handle_processor_message(subscriptions, &envelope, message)
                }
                Role::Vehicle { session } => {
                    self.handle_vehicle_message(session, &envelope, message, received_at)
                }
            },
            None => debug!(
                "Ignoring unrecognized datagram type `{}` from {}",
                envelope.kind, self.shared.peer
            ),
        }

        self.shared.core.lock().last_received_index = Some(envelope.index);
    }

    fn handle_processor_message(
        &self,
        subscriptions: &Mutex<FnvHashMap<String, Subscription>>,
        envelope: &Envelope,
        message: InboundMessage,
    ) {
        match message {
            InboundMessage::Connect | InboundMessage::KeepAlive | InboundMessage::Ping => {
                self.acknowledge(envelope);
            }
            InboundMessage::Subscribe(request) => {
                self.subscribe(subscriptions, request);
                self.acknowledge(envelope);
            }
            InboundMessage::Unsubscribe(request) => {
                Self::unsubscribe(subscriptions, &request.content);
                self.acknowledge(envelope);
            }
            InboundMessage::RequestArea => {
                let area = self.shared.model.area();
                self.write_datagram(&AreaBounds {
                    top_left: area.top_left,
                    bottom_right: area.bottom_right,
                });
            }
            InboundMessage::Notify(request) => {
                self.acknowledge(envelope);
                self.handle_notify(envelope, request);
            }
            InboundMessage::DecisionUpdate(update) => {
                self.shared.model.update_vehicle_decision(DecisionRecord {
                    vin: update.vehicle_decision.vin,
                    message: update.vehicle_decision.message,
                    timestamp: envelope.timestamp,
                });
            }
            InboundMessage::UpdateVehicle(_) => debug!(
                "Ignoring vehicle telemetry on processor connection {}",
                self.shared.peer
            ),
        }
    }

    fn subscribe(
        &self,
        subscriptions: &Mutex<FnvHashMap<String, Subscription>>,
        request: SubscribeRequest,
    ) {
        let content = match request.content.parse::<Content>() {
            Ok(content) => content,
            Err(err) => {
                warn!("Rejecting subscription from {}: {}", self.shared.peer, err);
                return;
            }
        };

        let mut subscriptions = subscriptions.lock();
        // Replace, never duplicate. stop() is a token flip and cannot block,
        // so the map lock may stay held.
        if let Some(previous) = subscriptions.remove(&request.content) {
            previous.stop();
        }
        subscriptions.insert(
            request.content,
            Subscription::spawn(self.clone(), content, request.topic, request.interval),
        );
    }

    fn unsubscribe(subscriptions: &Mutex<FnvHashMap<String, Subscription>>, content: &str) {
        if let Some(subscription) = subscriptions.lock().remove(content) {
            subscription.stop();
        }
    }

    fn handle_notify(&self, envelope: &Envelope, request: NotifyRequest) {
        self.shared.model.add_notification(NotificationRecord {
            vehicle_id: request.vehicle_id,
            level: request.level,
            timestamp: envelope.timestamp,
            content: request.content.clone(),
        });

        // Forward to the vehicle itself, if we know a live connection for it.
        if let Some(target) = self.shared.model.vehicle_connection(request.vehicle_id) {
            target.write_datagram(&NotifyVehicle {
                level: request.level,
                content: request.content,
            });
        }
    }

    fn handle_vehicle_message(
        &self,
        session: &Mutex<VehicleSession>,
        envelope: &Envelope,
        message: InboundMessage,
        received_at: DateTime<Utc>,
    ) {
        match message {
            InboundMessage::Ping => self.acknowledge(envelope),
            InboundMessage::UpdateVehicle(update) => {
                let vehicle = update.vehicle;

                let stats_blob = {
                    let mut session = session.lock();
                    session.vin = Some(vehicle.vin.clone());
                    session.stats.record_update(envelope.timestamp, received_at);
                    if session.decision_subscription.is_none() {
                        session.decision_subscription = Some(Subscription::spawn(
                            self.clone(),
                            Content::DecisionUpdate,
                            vehicle.vin.clone(),
                            1.0,
                        ));
                    }
                    serde_json::to_vec(&session.stats)
                };
                match stats_blob {
                    Ok(blob) => self.shared.sinks.cache.set(&vehicle.vin, blob),
                    Err(err) => warn!(
                        "Failed to serialize network stats for {}: {}",
                        vehicle.vin, err
                    ),
                }

                if self.shared.enforce_area {
                    let outside = vehicle
                        .position
                        .map_or(false, |position| !self.shared.model.area().contains(position));
                    if outside {
                        debug!("Vehicle {} left the managed area", vehicle.vin);
                        self.shared.model.delete_vehicle(&vehicle.vin);
                        self.write_datagram(&DisconnectVehicle {
                            connect_to: String::new(),
                        });
                        return;
                    }
                }

                self.shared
                    .model
                    .update_vehicle(self, envelope.timestamp, vehicle);
            }
            _ => debug!(
                "Ignoring `{}` on vehicle connection {}",
                envelope.kind, self.shared.peer
            ),
        }
    }

    fn acknowledge(&self, envelope: &Envelope) {
        self.write_datagram(&Acknowledge {
            acknowledging_index: envelope.index,
        });
    }

    /// Replace the keepalive timer task, cancelling the previous one.
    pub(crate) fn set_keepalive(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.shared.core.lock().keepalive.replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn abort_keepalive(&self) {
        if let Some(handle) = self.shared.core.lock().keepalive.take() {
            handle.abort();
        }
    }

    /// Tear down role state when the manager discards this connection.
    pub(crate) fn on_dead(&self) {
        match &self.shared.role {
            Role::Processor { subscriptions } => {
                for (_, subscription) in subscriptions.lock().drain() {
                    subscription.stop();
                }
            }
            Role::Vehicle { session } => {
                let vin = {
                    let mut session = session.lock();
                    if let Some(subscription) = session.decision_subscription.take() {
                        subscription.stop();
                    }
                    session.vin.take()
                };
                if let Some(vin) = vin {
                    self.shared.model.delete_vehicle(&vin);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        match &self.shared.role {
            Role::Processor { subscriptions } => subscriptions.lock().len(),
            Role::Vehicle { session } => {
                session.lock().decision_subscription.is_some() as usize
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn last_received_index(&self) -> Option<u32> {
        self.shared.core.lock().last_received_index
    }
}
