//! Per-role UDP listeners: socket ownership, the receive loop, the peer
//! registry and keepalive reaping.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::connection::{Connection, ConnectionKind};
use crate::model::DataModel;
use crate::protocol::types::timestamp;
use crate::protocol::MAX_DATAGRAM_SIZE;
use crate::sinks::{InputRecord, Sinks};

/// Default port for the backend subscriber listener.
pub const DEFAULT_BACKEND_PORT: u16 = 5050;
/// Default port for the decision processor listener.
pub const DEFAULT_DECISION_PORT: u16 = 6060;
/// Default port for the vehicle listener.
pub const DEFAULT_VEHICLE_PORT: u16 = 4040;
/// Default port for the unrestricted processor listener.
pub const DEFAULT_FREE_PROCESSOR_PORT: u16 = 4041;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub kind: ConnectionKind,
    /// Discard a connection after this long without a datagram from the
    /// peer. `None` disables reaping.
    pub keepalive_timeout: Option<Duration>,
    /// Drop datagrams whose index is at or below the receive watermark.
    /// The deployed protocol runs with this off and accepts reordered
    /// datagrams.
    pub reject_out_of_order: bool,
    /// Disconnect vehicles that report a position outside the managed area.
    pub enforce_area: bool,
}

impl ManagerConfig {
    pub fn new(kind: ConnectionKind) -> ManagerConfig {
        ManagerConfig {
            kind,
            keepalive_timeout: None,
            reject_out_of_order: false,
            enforce_area: false,
        }
    }
}

/// One listening role bound to one UDP port.
///
/// Cloning yields another handle to the same listener, so the receive loop
/// can run on a spawned task while the caller keeps a handle for
/// introspection.
#[derive(Clone)]
pub struct ConnectionsManager {
    shared: Arc<ManagerShared>,
}

struct ManagerShared {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: ManagerConfig,
    model: DataModel,
    sinks: Sinks,
    connections: Mutex<FnvHashMap<SocketAddr, Connection>>,
}

impl ConnectionsManager {
    /// Bind the listening socket for this role.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        config: ManagerConfig,
        model: DataModel,
        sinks: Sinks,
    ) -> std::io::Result<ConnectionsManager> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("{} listener bound on {}", config.kind.as_str(), local_addr);
        Ok(ConnectionsManager {
            shared: Arc::new(ManagerShared {
                socket: Arc::new(socket),
                local_addr,
                config,
                model,
                sinks,
                connections: Mutex::new(FnvHashMap::default()),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Discard the connection for `peer`, running its death hook. No-op for
    /// unknown peers.
    pub fn remove_connection(&self, peer: SocketAddr) {
        let connection = self.shared.connections.lock().remove(&peer);
        // The map entry is gone before the death hook runs, so the hook runs
        // at most once per connection.
        if let Some(connection) = connection {
            connection.abort_keepalive();
            connection.on_dead();
        }
    }

    /// The receive loop. Never returns; run it on its own task.
    ///
    /// Datagrams larger than [`MAX_DATAGRAM_SIZE`] are truncated by the read
    /// buffer. Read errors are logged and the loop continues.
    pub async fn run(&self) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (length, peer) = match self.shared.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(err) => {
                    error!(
                        "Read error on {} listener {}: {}",
                        self.shared.config.kind.as_str(),
                        self.shared.local_addr,
                        err
                    );
                    continue;
                }
            };
            let received_at = timestamp::now();
            let data = &buffer[..length];

            self.log_input(data, peer);

            let connection = self.get_or_create(peer);
            self.arm_keepalive(peer, &connection);
            connection.process_datagram(data, received_at);
        }
    }

    fn log_input(&self, data: &[u8], peer: SocketAddr) {
        if let Some(input_log) = &self.shared.sinks.input_log {
            let message = String::from_utf8_lossy(data);
            input_log.record(&InputRecord {
                receiving_port: self.shared.local_addr.port(),
                connection_type: self.shared.config.kind.as_str(),
                source_ip: peer.ip(),
                source_port: peer.port(),
                message: &message,
            });
        }
    }

    fn get_or_create(&self, peer: SocketAddr) -> Connection {
        let mut connections = self.shared.connections.lock();
        if let Some(existing) = connections.get(&peer) {
            return existing.clone();
        }
        debug!(
            "New {} connection from {}",
            self.shared.config.kind.as_str(),
            peer
        );
        let connection = Connection::new(
            Arc::clone(&self.shared.socket),
            peer,
            &self.shared.config,
            self.shared.model.clone(),
            self.shared.sinks.clone(),
        );
        connections.insert(peer, connection.clone());
        connection
    }

    fn arm_keepalive(&self, peer: SocketAddr, connection: &Connection) {
        let timeout = match self.shared.config.keepalive_timeout {
            Some(timeout) => timeout,
            None => return,
        };
        let manager = self.clone();
        connection.set_keepalive(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!("Keepalive timed out, discarding connection from {}", peer);
            manager.remove_connection(peer);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Area, Position};
    use crate::sinks::InputLog;
    use serde_json::Value;
    use tokio::time::timeout;

    fn whole_world() -> Area {
        Area {
            top_left: Position { lat: 90.0, lon: -180.0 },
            bottom_right: Position { lat: -90.0, lon: 180.0 },
        }
    }

    fn model() -> DataModel {
        DataModel::new(whole_world(), Duration::from_secs(60))
    }

    async fn spawn_listener(config: ManagerConfig, model: &DataModel) -> ConnectionsManager {
        spawn_listener_with_sinks(config, model, Sinks::in_process()).await
    }

    async fn spawn_listener_with_sinks(
        config: ManagerConfig,
        model: &DataModel,
        sinks: Sinks,
    ) -> ConnectionsManager {
        let manager = ConnectionsManager::bind("127.0.0.1:0", config, model.clone(), sinks)
            .await
            .unwrap();
        let runner = manager.clone();
        tokio::spawn(async move { runner.run().await });
        manager
    }

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn send(socket: &UdpSocket, target: SocketAddr, payload: &str) {
        socket.send_to(payload.as_bytes(), target).await.unwrap();
    }

    async fn recv_json(socket: &UdpSocket) -> Value {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (length, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap();
        serde_json::from_slice(&buffer[..length]).unwrap()
    }

    async fn expect_silence(socket: &UdpSocket, wait: Duration) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        if let Ok(received) = timeout(wait, socket.recv_from(&mut buffer)).await {
            let (length, _) = received.unwrap();
            panic!(
                "Expected no datagram, got: {}",
                String::from_utf8_lossy(&buffer[..length])
            );
        }
    }

    #[tokio::test]
    async fn ping_round_trips_an_acknowledge() {
        let model = model();
        let listener = spawn_listener(ManagerConfig::new(ConnectionKind::Vehicle), &model).await;
        let vehicle = client().await;

        send(
            &vehicle,
            listener.local_addr(),
            r#"{"index":7,"type":"ping","timestamp":"2025-01-01T00:00:00.000Z"}"#,
        )
        .await;

        let reply = recv_json(&vehicle).await;
        assert_eq!(reply["index"], 1);
        assert_eq!(reply["type"], "acknowledge");
        assert_eq!(reply["acknowledgingIndex"], 7);
    }

    #[tokio::test]
    async fn live_subscriber_sees_a_new_vehicle() {
        let model = model();
        let processors =
            spawn_listener(ManagerConfig::new(ConnectionKind::Processor), &model).await;
        let vehicles = spawn_listener(ManagerConfig::new(ConnectionKind::Vehicle), &model).await;

        let processor = client().await;
        send(
            &processor,
            processors.local_addr(),
            r#"{"index":1,"type":"subscribe","timestamp":"2025-01-01T00:00:00.000Z","content":"live-updates","topic":"","interval":0}"#,
        )
        .await;
        assert_eq!(recv_json(&processor).await["type"], "acknowledge");

        let vehicle = client().await;
        send(
            &vehicle,
            vehicles.local_addr(),
            r#"{"index":1,"type":"update_vehicle","timestamp":"2025-01-01T00:00:01.000Z","vehicle":{"vin":"VIN-A"}}"#,
        )
        .await;

        let pushed = recv_json(&processor).await;
        assert_eq!(pushed["type"], "update_vehicle_position");
        assert_eq!(pushed["vehicle"]["vin"], "VIN-A");
    }

    #[tokio::test]
    async fn stale_vehicle_update_is_not_fanned_out() {
        let model = model();
        let processors =
            spawn_listener(ManagerConfig::new(ConnectionKind::Processor), &model).await;
        let vehicles = spawn_listener(ManagerConfig::new(ConnectionKind::Vehicle), &model).await;

        let processor = client().await;
        send(
            &processor,
            processors.local_addr(),
            r#"{"index":1,"type":"subscribe","timestamp":"2025-01-01T00:00:00.000Z","content":"live-updates","topic":"","interval":0}"#,
        )
        .await;
        assert_eq!(recv_json(&processor).await["type"], "acknowledge");

        let vehicle = client().await;
        send(
            &vehicle,
            vehicles.local_addr(),
            r#"{"index":1,"type":"update_vehicle","timestamp":"2025-01-01T00:00:01.000Z","vehicle":{"vin":"VIN-A"}}"#,
        )
        .await;
        assert_eq!(recv_json(&processor).await["vehicle"]["vin"], "VIN-A");

        // Strictly older than the stored state: dropped, no fan-out.
        send(
            &vehicle,
            vehicles.local_addr(),
            r#"{"index":2,"type":"update_vehicle","timestamp":"2025-01-01T00:00:00.500Z","vehicle":{"vin":"VIN-A"}}"#,
        )
        .await;
        expect_silence(&processor, Duration::from_millis(300)).await;

        let stored = model.vehicle("VIN-A").unwrap();
        assert_eq!(
            timestamp::format(&stored.timestamp),
            "2025-01-01T00:00:01.000Z"
        );
    }

    #[tokio::test]
    async fn notification_is_replaced_by_a_higher_level() {
        let model = model();
        let processors =
            spawn_listener(ManagerConfig::new(ConnectionKind::Processor), &model).await;
        let processor = client().await;

        send(
            &processor,
            processors.local_addr(),
            r#"{"index":1,"type":"notify","timestamp":"2025-01-01T00:00:00.000Z","vehicleId":1,"level":"info","contentType":"generic","content":{"text":"x"}}"#,
        )
        .await;
        assert_eq!(recv_json(&processor).await["acknowledgingIndex"], 1);

        send(
            &processor,
            processors.local_addr(),
            r#"{"index":2,"type":"notify","timestamp":"2025-01-01T00:00:01.000Z","vehicleId":1,"level":"danger","contentType":"generic","content":{"text":"y"}}"#,
        )
        .await;
        assert_eq!(recv_json(&processor).await["acknowledgingIndex"], 2);

        let notifications = model.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].level, crate::protocol::Level::Danger);
    }

    #[tokio::test]
    async fn notifications_expire_end_to_end() {
        let model = DataModel::new(whole_world(), Duration::from_millis(300));
        let processors =
            spawn_listener(ManagerConfig::new(ConnectionKind::Processor), &model).await;
        let processor = client().await;

        send(
            &processor,
            processors.local_addr(),
            r#"{"index":1,"type":"notify","timestamp":"2025-01-01T00:00:00.000Z","vehicleId":1,"level":"info","contentType":"generic","content":{"text":"x"}}"#,
        )
        .await;
        assert_eq!(recv_json(&processor).await["acknowledgingIndex"], 1);
        assert_eq!(model.notifications().len(), 1);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(model.notifications().is_empty());
    }

    #[tokio::test]
    async fn decision_reaches_only_the_targeted_vehicle() {
        let model = model();
        let processors =
            spawn_listener(ManagerConfig::new(ConnectionKind::Processor), &model).await;
        let vehicles = spawn_listener(ManagerConfig::new(ConnectionKind::Vehicle), &model).await;

        let target = client().await;
        send(
            &target,
            vehicles.local_addr(),
            r#"{"index":1,"type":"update_vehicle","timestamp":"2025-01-01T00:00:00.000Z","vehicle":{"vin":"VIN-B"}}"#,
        )
        .await;
        let bystander = client().await;
        send(
            &bystander,
            vehicles.local_addr(),
            r#"{"index":1,"type":"update_vehicle","timestamp":"2025-01-01T00:00:00.000Z","vehicle":{"vin":"VIN-C"}}"#,
        )
        .await;

        // Give the vehicle listener time to register both sessions.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let processor = client().await;
        send(
            &processor,
            processors.local_addr(),
            r#"{"index":1,"type":"decision_update","timestamp":"2025-01-01T00:00:02.000Z","vehicleDecision":{"vin":"VIN-B","message":"slow"}}"#,
        )
        .await;

        let pushed = recv_json(&target).await;
        assert_eq!(pushed["type"], "update_vehicle_position");
        assert_eq!(pushed["vehicleDecision"]["vin"], "VIN-B");
        assert_eq!(pushed["vehicleDecision"]["message"], "slow");

        expect_silence(&bystander, Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn keepalive_expiry_reaps_the_connection() {
        let model = model();
        let mut config = ManagerConfig::new(ConnectionKind::Vehicle);
        config.keepalive_timeout = Some(Duration::from_millis(200));
        let vehicles = spawn_listener(config, &model).await;

        let vehicle = client().await;
        send(
            &vehicle,
            vehicles.local_addr(),
            r#"{"index":1,"type":"update_vehicle","timestamp":"2025-01-01T00:00:00.000Z","vehicle":{"vin":"VIN-A"}}"#,
        )
        .await;

        timeout(Duration::from_secs(1), async {
            while model.vehicle("VIN-A").is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("vehicle never registered");
        assert_eq!(vehicles.connection_count(), 1);

        // No further datagrams: the keepalive fires and the death hook
        // removes the vehicle.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(vehicles.connection_count(), 0);
        assert!(model.vehicle("VIN-A").is_none());
    }

    #[tokio::test]
    async fn each_datagram_rearms_the_keepalive() {
        let model = model();
        let mut config = ManagerConfig::new(ConnectionKind::Vehicle);
        config.keepalive_timeout = Some(Duration::from_millis(300));
        let vehicles = spawn_listener(config, &model).await;

        let vehicle = client().await;
        for index in 1..=4u32 {
            send(
                &vehicle,
                vehicles.local_addr(),
                &format!(
                    r#"{{"index":{},"type":"ping","timestamp":"2025-01-01T00:00:00.000Z"}}"#,
                    index
                ),
            )
            .await;
            assert_eq!(recv_json(&vehicle).await["acknowledgingIndex"], index);
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        // 600ms of pings against a 300ms timeout: still alive.
        assert_eq!(vehicles.connection_count(), 1);
    }

    #[tokio::test]
    async fn input_log_receives_one_record_per_datagram() {
        struct RecordingLog {
            records: Mutex<Vec<(u16, String)>>,
        }
        impl InputLog for RecordingLog {
            fn record(&self, record: &InputRecord) {
                self.records
                    .lock()
                    .push((record.source_port, record.message.to_string()));
            }
        }

        let log = Arc::new(RecordingLog {
            records: Mutex::new(Vec::new()),
        });
        let mut sinks = Sinks::in_process();
        sinks.input_log = Some(log.clone() as Arc<dyn InputLog>);

        let model = model();
        let vehicles = spawn_listener_with_sinks(
            ManagerConfig::new(ConnectionKind::Vehicle),
            &model,
            sinks,
        )
        .await;

        let vehicle = client().await;
        let payload = r#"{"index":1,"type":"ping","timestamp":"2025-01-01T00:00:00.000Z"}"#;
        send(&vehicle, vehicles.local_addr(), payload).await;
        recv_json(&vehicle).await;

        let records = log.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, vehicle.local_addr().unwrap().port());
        assert_eq!(records[0].1, payload);
    }

    #[tokio::test]
    async fn read_errors_do_not_kill_other_connections() {
        let model = model();
        let vehicles = spawn_listener(ManagerConfig::new(ConnectionKind::Vehicle), &model).await;
        let vehicle = client().await;

        // Garbage from the same peer is dropped without affecting it.
        send(&vehicle, vehicles.local_addr(), "garbage").await;
        send(
            &vehicle,
            vehicles.local_addr(),
            r#"{"index":2,"type":"ping","timestamp":"2025-01-01T00:00:00.000Z"}"#,
        )
        .await;
        assert_eq!(recv_json(&vehicle).await["acknowledgingIndex"], 2);
    }
}
