//! TransportPool: circuit registry plus the worker threads that drain them.
//!
//! Workers are split into two runtimes so a flood of inbound traffic cannot
//! starve outbound flushing (and the reverse). Every circuit opened on the
//! pool gets one drain trigger on each, and a runtime never runs more
//! passes at once than it has workers.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info};

use nexdb_core::config::{ConfigError, PoolConfig, TransportConfig};
use nexdb_core::crypto::{ChaChaPoly, Cipher};

use crate::drain::DrainLane;
use crate::transport::Transport;

/// Notified as circuits come and go.
pub trait CircuitObserver: Send + Sync {
    fn on_open(&self, circuit_id: u32, transport: &Arc<Transport>);
    fn on_close(&self, circuit_id: u32);
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("circuit {0} is already open")]
    CircuitExists(u32),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Split `total` workers between inbound and outbound, giving each side at
/// least one. Returns `(inbound, outbound)`.
pub fn split_workers(total: usize, inbound_percent: u8) -> (usize, usize) {
    let total = total.max(2);
    let percent = usize::from(inbound_percent.min(100));
    let inbound = ((total * percent + 50) / 100).clamp(1, total - 1);
    (inbound, total - inbound)
}

pub struct TransportPool {
    config: TransportConfig,
    circuits: DashMap<u32, Arc<Transport>>,
    observers: RwLock<Vec<Arc<dyn CircuitObserver>>>,
    inbound_lane: DrainLane,
    outbound_lane: DrainLane,
    // Held so the workers live as long as the pool; taken on drop.
    inbound_runtime: Option<Runtime>,
    outbound_runtime: Option<Runtime>,
    workers: (usize, usize),
}

impl TransportPool {
    pub fn new(config: TransportConfig, pool: &PoolConfig) -> Result<Self, PoolError> {
        config.validate(ChaChaPoly.overhead())?;

        let (inbound, outbound) = split_workers(pool.worker_threads, pool.inbound_share_percent);
        let inbound_runtime = worker_runtime("nexdb-inbound", inbound)?;
        let outbound_runtime = worker_runtime("nexdb-outbound", outbound)?;
        info!(
            inbound_workers = inbound,
            outbound_workers = outbound,
            "transport pool started"
        );

        Ok(Self {
            config,
            circuits: DashMap::new(),
            observers: RwLock::new(Vec::new()),
            inbound_lane: DrainLane::new(inbound_runtime.handle().clone(), inbound),
            outbound_lane: DrainLane::new(outbound_runtime.handle().clone(), outbound),
            inbound_runtime: Some(inbound_runtime),
            outbound_runtime: Some(outbound_runtime),
            workers: (inbound, outbound),
        })
    }

    /// `(inbound, outbound)` worker thread counts.
    pub fn workers(&self) -> (usize, usize) {
        self.workers
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn add_observer(&self, observer: Arc<dyn CircuitObserver>) {
        self.observers.write().push(observer);
    }

    /// Create a circuit and attach it to the workers.
    pub fn open_circuit(&self, circuit_id: u32) -> Result<Arc<Transport>, PoolError> {
        let transport = match self.circuits.entry(circuit_id) {
            Entry::Occupied(_) => return Err(PoolError::CircuitExists(circuit_id)),
            Entry::Vacant(slot) => {
                let transport = Arc::new(Transport::new(circuit_id, self.config.clone())?);
                transport.schedule(&self.inbound_lane, &self.outbound_lane);
                slot.insert(transport.clone());
                transport
            }
        };
        info!(circuit_id, open = self.circuits.len(), "circuit opened");

        for observer in self.observers.read().iter() {
            observer.on_open(circuit_id, &transport);
        }
        Ok(transport)
    }

    /// Stop and forget a circuit. Returns `false` if it was not open.
    pub fn close_circuit(&self, circuit_id: u32) -> bool {
        let Some((_, transport)) = self.circuits.remove(&circuit_id) else {
            debug!(circuit_id, "close of unknown circuit ignored");
            return false;
        };
        transport.stop();
        info!(circuit_id, open = self.circuits.len(), "circuit closed");

        for observer in self.observers.read().iter() {
            observer.on_close(circuit_id);
        }
        true
    }

    pub fn get_circuit(&self, circuit_id: u32) -> Option<Arc<Transport>> {
        self.circuits.get(&circuit_id).map(|t| t.value().clone())
    }

    /// Open circuit ids in ascending order.
    pub fn list_circuit_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.circuits.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }
}

impl Drop for TransportPool {
    fn drop(&mut self) {
        for id in self.list_circuit_ids() {
            self.close_circuit(id);
        }
        if let Some(rt) = self.inbound_runtime.take() {
            rt.shutdown_background();
        }
        if let Some(rt) = self.outbound_runtime.take() {
            rt.shutdown_background();
        }
        info!("transport pool shut down");
    }
}

fn worker_runtime(name: &'static str, threads: usize) -> std::io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name(name)
        .enable_all()
        .build()
}

// ── Tests ────────────────────────────────────────────────────────────────────
