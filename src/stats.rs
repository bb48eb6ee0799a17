//! Per-connection network quality accounting for vehicle links.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::NetworkStatsRecord;

/// Running counters for one vehicle connection.
///
/// Updated once per accepted `update_vehicle` datagram and published to the
/// key-value sink keyed by VIN, where `network-statistics` subscribers pick it
/// up. All durations are in microseconds; latency samples are signed because
/// vehicle clocks are not trusted to run ahead of ours.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub packets_received: u64,
    pub receive_errors: u64,
    total_latency: i64,
    pub average_latency: i64,
    prev_packet_time: Option<DateTime<Utc>>,
    last_delay: i64,
    /// Exponentially smoothed inter-arrival jitter. Zero until the second
    /// packet arrives.
    pub jitter: i64,
}

impl NetworkStats {
    pub fn new() -> NetworkStats {
        NetworkStats::default()
    }

    /// Record one received `update_vehicle` datagram.
    ///
    /// `sent_at` is the timestamp the vehicle stamped onto the datagram,
    /// `received_at` the local receive time.
    pub fn record_update(&mut self, sent_at: DateTime<Utc>, received_at: DateTime<Utc>) {
        self.packets_received += 1;

        if let Some(prev) = self.prev_packet_time {
            let current_delay = micros(received_at - prev);
            let difference = (current_delay - self.last_delay).abs();
            self.jitter = (self.jitter * 15 + difference) / 16;
            self.last_delay = current_delay;
        }
        self.prev_packet_time = Some(received_at);

        self.total_latency += micros(received_at - sent_at);
        self.average_latency = self.total_latency / self.packets_received as i64;
    }

    /// Count a datagram that failed to parse at the wire level.
    pub fn record_receive_error(&mut self) {
        self.receive_errors += 1;
    }

    /// The externally visible aggregate.
    pub fn snapshot(&self) -> NetworkStatsRecord {
        NetworkStatsRecord {
            packets_received: self.packets_received,
            receive_errors: self.receive_errors,
            average_latency: self.average_latency,
            jitter: self.jitter,
        }
    }
}

fn micros(duration: Duration) -> i64 {
    // Saturates rather than panics on a duration beyond ~292k years.
    duration.num_microseconds().unwrap_or(i64::MAX)
}
