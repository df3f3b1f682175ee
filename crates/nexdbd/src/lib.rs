//! nexdbd: the nexdb network daemon.
//!
//! Bridges TCP connections onto transport circuits and hands reassembled
//! messages to an `Application`.

pub mod app;
pub mod bridge;

pub use app::{Application, Echo};
pub use bridge::{connect, serve, Connection};
