//! Interfaces to the broker's external collaborators.
//!
//! The broker only ever talks to these through trait objects handed to the
//! connection manager at construction time, so deployments can wire in a real
//! cache or telemetry client while tests substitute in-process fakes.

use std::collections::HashMap;
use std::error::Error;
use std::net::IpAddr;
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

/// Opaque byte store keyed by string, the shape of an external cache.
/// Entries do not expire.
pub trait KeyValueCache: Send + Sync {
    fn set(&self, key: &str, value: Vec<u8>);
    fn get(&self, key: &str) -> Option<Vec<u8>>;
}

/// Crash/error reporting. Fire-and-forget; implementations must not block
/// the caller.
pub trait TelemetrySink: Send + Sync {
    fn capture_error(&self, error: &(dyn Error + '_));
}

/// One structured record per received datagram.
#[derive(Debug, Clone)]
pub struct InputRecord<'a> {
    pub receiving_port: u16,
    pub connection_type: &'static str,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub message: &'a str,
}

/// Append-only structured log of everything a manager receives.
pub trait InputLog: Send + Sync {
    fn record(&self, record: &InputRecord);
}

/// The sink handles a manager carries.
#[derive(Clone)]
pub struct Sinks {
    pub cache: Arc<dyn KeyValueCache>,
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Input logging is optional; `None` disables it.
    pub input_log: Option<Arc<dyn InputLog>>,
}

impl Sinks {
    /// In-process defaults: a memory-backed cache, telemetry through the
    /// `log` facade, no input log. This is what runs when no external
    /// services are configured.
    pub fn in_process() -> Sinks {
        Sinks {
            cache: Arc::new(MemoryCache::default()),
            telemetry: Arc::new(LogTelemetry),
            input_log: None,
        }
    }
}

/// Memory-backed [`KeyValueCache`].
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl KeyValueCache for MemoryCache {
    fn set(&self, key: &str, value: Vec<u8>) {
        self.entries.lock().insert(key.to_string(), value);
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }
}

/// [`TelemetrySink`] that reports through the `log` facade.
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn capture_error(&self, error: &(dyn Error + '_)) {
        error!("Captured error: {}", error);
    }
}
