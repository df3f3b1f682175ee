//! nexdb-transport: the per-circuit message transport.
//!
//! A `Transport` turns logical messages into checksummed, optionally
//! compressed and encrypted frames on a byte stream, and reassembles them on
//! the other side. `TransportPool` hosts many circuits on a small, fixed set
//! of worker threads split between the inbound and outbound directions.

pub mod drain;
pub mod error;
pub mod pool;
pub mod reassembly;
pub mod transport;

pub use drain::{DataCallback, Direction, DrainLane, DrainTrigger};
pub use error::TransportError;
pub use pool::{CircuitObserver, PoolError, TransportPool};
pub use transport::Transport;
