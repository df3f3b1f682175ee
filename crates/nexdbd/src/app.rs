//! The storage-engine seam.

/// Receives every message delivered on a circuit.
///
/// Called from an inbound pool worker. A returned reply is sent back on the
/// same circuit under the same message id.
pub trait Application: Send + Sync {
    fn on_message(&self, circuit_id: u32, msg_id: u32, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Replies with the request payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Application for Echo {
    fn on_message(&self, circuit_id: u32, msg_id: u32, payload: &[u8]) -> Option<Vec<u8>> {
        tracing::trace!(circuit_id, msg_id, len = payload.len(), "echo");
        Some(payload.to_vec())
    }
}
