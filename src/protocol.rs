use thiserror::Error;

pub mod inbound;
pub mod outbound;
pub mod types;

pub use inbound::*;
pub use outbound::*;
pub use types::*;

/// Largest datagram read from or written to a socket in one piece.
/// Anything beyond this is truncated by the receive buffer.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Wire timestamp format: UTC with millisecond precision,
/// e.g. `2025-01-01T00:00:00.000Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed datagram envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("Malformed `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
