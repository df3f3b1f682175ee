//! nexdb-core: wire format, byte buffers, and the crypto/compression
//! collaborators used by the transport engine.
//! All other nexdb crates depend on this one.

pub mod buffer;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod wire;

pub use buffer::BoundedByteBuffer;
pub use config::{NexdbConfig, TransportConfig};
pub use wire::{FrameFlags, WireFrame};
