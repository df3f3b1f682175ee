//! One circuit: message framing over a pair of bounded byte buffers.
//!
//! ```text
//!   send(msg) ──► compress ─► segment ─► encrypt ─► frame ──► [outbound] ──► output()
//!   input()   ──► [inbound] ──► prefix ─► frame ─► decrypt ─► reassemble ─► decompress ──► read()
//! ```
//!
//! `send` serialises on the transmit state, so the frames of one message are
//! contiguous on the wire. `read` serialises on the receive state, so a frame
//! is consumed by exactly one reader.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use nexdb_core::buffer::{BoundedByteBuffer, BufferError};
use nexdb_core::compress::{Compressor, Zstd};
use nexdb_core::config::{ConfigError, TransportConfig};
use nexdb_core::crypto::{ChaChaPoly, Cipher, SessionKey};
use nexdb_core::wire::{
    declared_length, FrameFlags, WireError, WireFrame, FRAME_OVERHEAD, LENGTH_PREFIX,
};

use crate::drain::{DataCallback, Direction, DrainLane, DrainTrigger};
use crate::error::TransportError;
use crate::reassembly::{Completed, DropReason, Inserted, ReassemblyCache, Segment};

/// Additional authenticated data binding a ciphertext to its frame position.
fn frame_aad(msg_id: u32, segment_index: u32) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&msg_id.to_be_bytes());
    aad[4..].copy_from_slice(&segment_index.to_be_bytes());
    aad
}

struct TxState {
    key: Option<SessionKey>,
    /// The next frame carries `KEY_UPDATE`.
    key_just_rotated: bool,
}

struct RxState {
    key: Option<SessionKey>,
    /// Installed when the peer's next `KEY_UPDATE` frame arrives.
    staged: Option<SessionKey>,
    cache: ReassemblyCache,
}

struct Scheduler {
    inbound: DrainTrigger,
    outbound: DrainTrigger,
}

pub struct Transport {
    circuit_id: u32,
    config: TransportConfig,
    cipher: Arc<dyn Cipher>,
    compressor: Arc<dyn Compressor>,
    outbound: BoundedByteBuffer,
    inbound: BoundedByteBuffer,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    encryption_enabled: AtomicBool,
    compression_enabled: AtomicBool,
    callbacks: Mutex<Vec<Weak<dyn DataCallback>>>,
    scheduler: OnceLock<Scheduler>,
    stopped: AtomicBool,
}

impl Transport {
    /// A circuit using ChaCha20-Poly1305 and zstd at the configured level.
    pub fn new(circuit_id: u32, config: TransportConfig) -> Result<Self, ConfigError> {
        let compressor = Arc::new(Zstd::new(config.compression_level));
        Self::with_codecs(circuit_id, config, Arc::new(ChaChaPoly), compressor)
    }

    pub fn with_codecs(
        circuit_id: u32,
        config: TransportConfig,
        cipher: Arc<dyn Cipher>,
        compressor: Arc<dyn Compressor>,
    ) -> Result<Self, ConfigError> {
        config.validate(cipher.overhead())?;
        Ok(Self {
            circuit_id,
            outbound: BoundedByteBuffer::new(config.outbound_capacity),
            inbound: BoundedByteBuffer::new(config.inbound_capacity),
            tx: Mutex::new(TxState {
                key: None,
                key_just_rotated: false,
            }),
            rx: Mutex::new(RxState {
                key: None,
                staged: None,
                cache: ReassemblyCache::new(config.max_reassembly_entries),
            }),
            encryption_enabled: AtomicBool::new(false),
            compression_enabled: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            scheduler: OnceLock::new(),
            stopped: AtomicBool::new(false),
            cipher,
            compressor,
            config,
        })
    }

    /// Attach drain triggers on the given lanes. Until this is called the
    /// circuit is driven manually through `output` and `read`. Later calls
    /// are no-ops.
    pub fn schedule(self: &Arc<Self>, inbound: &DrainLane, outbound: &DrainLane) {
        self.scheduler.get_or_init(|| {
            let weak = Arc::downgrade(self);
            let inbound_trigger =
                DrainTrigger::spawn(inbound, self.circuit_id, Direction::Inbound, move || {
                    match weak.upgrade() {
                        Some(transport) => {
                            transport.drain_inbound();
                            true
                        }
                        None => false,
                    }
                });
            let weak = Arc::downgrade(self);
            let outbound_trigger =
                DrainTrigger::spawn(outbound, self.circuit_id, Direction::Outbound, move || {
                    match weak.upgrade() {
                        Some(transport) => {
                            transport.drain_outbound();
                            true
                        }
                        None => false,
                    }
                });
            Scheduler {
                inbound: inbound_trigger,
                outbound: outbound_trigger,
            }
        });
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn circuit_id(&self) -> u32 {
        self.circuit_id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption_enabled.load(Ordering::Acquire)
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Bytes waiting to go out on the wire.
    pub fn outbound_used(&self) -> usize {
        self.outbound.used_size()
    }

    /// Wire bytes received but not yet decoded.
    pub fn inbound_used(&self) -> usize {
        self.inbound.used_size()
    }

    /// Messages currently held in reassembly.
    pub fn pending_messages(&self) -> usize {
        self.rx.lock().cache.len()
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// Compress messages sent from now on. The receiving side needs no
    /// configuration; it follows the `COMPRESSED` flag.
    pub fn set_compression(&self, enabled: bool) {
        self.compression_enabled.store(enabled, Ordering::Release);
        debug!(circuit_id = self.circuit_id, enabled, "compression toggled");
    }

    /// Install session keys and enable encryption.
    ///
    /// With `pending` unset both keys take effect immediately. With `pending`
    /// set, `tx` takes effect now and the next outgoing frame is flagged
    /// `KEY_UPDATE`, while `rx` is staged until the peer's own `KEY_UPDATE`
    /// frame arrives.
    pub fn set_session_keys(&self, rx: SessionKey, tx: SessionKey, pending: bool) {
        info!(
            circuit_id = self.circuit_id,
            tx_key = %tx.fingerprint(),
            rx_key = %rx.fingerprint(),
            pending,
            "session keys installed"
        );
        {
            let mut state = self.tx.lock();
            state.key = Some(tx);
            state.key_just_rotated = pending;
        }
        {
            let mut state = self.rx.lock();
            if pending {
                state.staged = Some(rx);
            } else {
                state.key = Some(rx);
                state.staged = None;
            }
        }
        self.encryption_enabled.store(true, Ordering::Release);
    }

    /// Register a consumer. Only a weak reference is kept; a dropped
    /// callback is pruned at the next drain pass.
    pub fn add_callback(&self, callback: Weak<dyn DataCallback>) {
        self.callbacks.lock().push(callback);
    }

    /// Discard everything buffered in one direction. Resetting inbound also
    /// forgets partially reassembled messages.
    pub fn reset(&self, direction: Direction) {
        match direction {
            Direction::Outbound => self.outbound.clear(),
            Direction::Inbound => {
                let mut rx = self.rx.lock();
                self.inbound.clear();
                rx.cache.clear();
            }
        }
        debug!(circuit_id = self.circuit_id, ?direction, "circuit buffer reset");
    }

    /// Stop the drain triggers and drop all callbacks. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.inbound.stop();
            scheduler.outbound.stop();
        }
        self.callbacks.lock().clear();
        info!(circuit_id = self.circuit_id, "circuit stopped");
    }

    // ── Send path ────────────────────────────────────────────────────────────

    /// Frame `data` as message `msg_id` and append its frames to the
    /// outbound buffer. Returns the length of `data`.
    ///
    /// Each frame write waits up to `timeout` for space and is retried once;
    /// if it still does not fit the call fails with `BufferFull`, leaving any
    /// frames already written in place.
    pub fn send(&self, data: &[u8], msg_id: u32, timeout: Duration) -> Result<usize, TransportError> {
        if self.is_stopped() {
            return Err(TransportError::Stopped);
        }
        if data.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                len: data.len(),
                max: self.config.max_message_size,
            });
        }

        let mut tx = self.tx.lock();

        let compressed = self.compression_enabled();
        let body: Cow<'_, [u8]> = if compressed {
            Cow::Owned(self.compressor.compress(data)?)
        } else {
            Cow::Borrowed(data)
        };

        let key = if self.encryption_enabled() {
            Some(tx.key.clone().ok_or(TransportError::NoSessionKey)?)
        } else {
            None
        };
        let overhead = if key.is_some() { self.cipher.overhead() } else { 0 };
        let chunk_size = self.config.max_chunk(overhead);

        let chunks: Vec<&[u8]> = if body.is_empty() {
            vec![&body[..]]
        } else {
            body.chunks(chunk_size).collect()
        };
        let segment_count = chunks.len();
        if u32::try_from(segment_count).is_err() {
            return Err(TransportError::MessageTooLarge {
                len: body.len(),
                max: self.config.max_message_size,
            });
        }

        for (i, chunk) in chunks.into_iter().enumerate() {
            let segment_index = i as u32;
            let mut flags = FrameFlags::empty();
            if i + 1 < segment_count {
                flags |= FrameFlags::SEGMENTED;
            }
            if compressed {
                flags |= FrameFlags::COMPRESSED;
            }
            let announce_rotation = key.is_some() && tx.key_just_rotated;
            if announce_rotation {
                flags |= FrameFlags::KEY_UPDATE;
            }

            let payload = match &key {
                Some(key) => {
                    flags |= FrameFlags::ENCRYPTED;
                    let sealed =
                        self.cipher
                            .encrypt(key, chunk, &frame_aad(msg_id, segment_index))?;
                    Bytes::from(sealed)
                }
                None => Bytes::copy_from_slice(chunk),
            };

            let frame = WireFrame::new(msg_id, segment_index, flags, payload)
                .encode()
                .map_err(|_| TransportError::MessageTooLarge {
                    len: body.len(),
                    max: self.config.max_message_size,
                })?;
            self.write_with_retry(&self.outbound, &frame, timeout)
                .map_err(|e| match e {
                    TransportError::MessageTooLarge { .. } => TransportError::BufferFull,
                    other => other,
                })?;
            self.arm(Direction::Outbound);

            if announce_rotation {
                tx.key_just_rotated = false;
                info!(circuit_id = self.circuit_id, msg_id, "key update announced");
            }
            trace!(
                circuit_id = self.circuit_id,
                msg_id,
                segment_index,
                ?flags,
                len = frame.len(),
                "frame queued"
            );
        }

        debug!(
            circuit_id = self.circuit_id,
            msg_id,
            len = data.len(),
            segments = segment_count,
            compressed,
            encrypted = key.is_some(),
            "message sent"
        );
        Ok(data.len())
    }

    /// Move up to `buf.len()` queued wire bytes into `buf`. Returns 0 when
    /// nothing is queued.
    pub fn output(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let n = self.outbound.used_size().min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.outbound
            .read(&mut buf[..n], timeout)
            .map_err(|_| TransportError::Timeout)
    }

    // ── Receive path ─────────────────────────────────────────────────────────

    /// Append wire bytes received from the peer.
    pub fn input(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.is_stopped() {
            return Err(TransportError::Stopped);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let n = self.write_with_retry(&self.inbound, data, timeout)?;
        self.arm(Direction::Inbound);
        Ok(n)
    }

    /// Deliver the next complete message into `out`, decoding as many
    /// frames as that takes. Returns the message length and id.
    ///
    /// `Timeout` means the inbound buffer ran dry. Every other error
    /// concerns one frame or message, which has been discarded; calling
    /// `read` again continues with the next one.
    pub fn read(&self, out: &mut [u8], timeout: Duration) -> Result<(usize, u32), TransportError> {
        let mut rx = self.rx.lock();
        loop {
            while let Some(message) = rx.cache.take_complete() {
                let msg_id = message.msg_id;
                match self.deliver(message, out) {
                    Ok(len) => {
                        debug!(circuit_id = self.circuit_id, msg_id, len, "message delivered");
                        return Ok((len, msg_id));
                    }
                    Err(e) => {
                        warn!(circuit_id = self.circuit_id, error = %e, "undeliverable message dropped");
                    }
                }
            }

            let frame = self.next_frame(timeout)?;
            let now = Instant::now();
            self.ingest(&mut rx, frame, out.len(), now)?;

            for msg_id in rx.cache.evict_over_capacity() {
                debug!(circuit_id = self.circuit_id, msg_id, "reassembly entry evicted");
            }
            for msg_id in rx.cache.sweep_stale(now, timeout) {
                debug!(circuit_id = self.circuit_id, msg_id, "stale reassembly entry swept");
            }
        }
    }

    /// Peek the length prefix, validate it, then consume and decode one
    /// frame.
    fn next_frame(&self, timeout: Duration) -> Result<WireFrame, TransportError> {
        let mut prefix = [0u8; LENGTH_PREFIX];
        self.inbound
            .peek(&mut prefix, timeout)
            .map_err(|_| TransportError::Timeout)?;

        let declared = declared_length(prefix);
        let len = declared as usize;
        if len < FRAME_OVERHEAD || len > self.config.segment_size {
            self.inbound.clear();
            warn!(
                circuit_id = self.circuit_id,
                declared,
                segment_size = self.config.segment_size,
                "implausible length prefix, inbound stream cleared"
            );
            return Err(TransportError::Protocol { declared });
        }

        let mut bytes = vec![0u8; len];
        self.inbound
            .read(&mut bytes, timeout)
            .map_err(|_| TransportError::Timeout)?;

        match WireFrame::decode(&bytes) {
            Ok(frame) => Ok(frame),
            Err(WireError::ChecksumMismatch {
                msg_id,
                segment_index,
                expected,
                actual,
            }) => {
                warn!(
                    circuit_id = self.circuit_id,
                    msg_id,
                    segment_index,
                    expected = %format!("{expected:#010x}"),
                    actual = %format!("{actual:#010x}"),
                    "checksum mismatch, frame dropped"
                );
                Err(TransportError::Checksum {
                    msg_id,
                    segment: segment_index,
                })
            }
            Err(e) => {
                warn!(circuit_id = self.circuit_id, error = %e, "malformed frame dropped");
                Err(TransportError::Malformed { declared })
            }
        }
    }

    /// Apply key rotation, decrypt, and hand the segment to reassembly.
    fn ingest(
        &self,
        rx: &mut RxState,
        frame: WireFrame,
        out_len: usize,
        now: Instant,
    ) -> Result<(), TransportError> {
        let WireFrame {
            msg_id,
            segment_index,
            flags,
            payload,
        } = frame;
        trace!(circuit_id = self.circuit_id, msg_id, segment_index, ?flags, "frame received");

        if flags.unknown_bits() != 0 {
            debug!(circuit_id = self.circuit_id, msg_id, bits = flags.unknown_bits(), "ignoring unknown flag bits");
        }

        if flags.contains(FrameFlags::KEY_UPDATE) {
            match rx.staged.take() {
                Some(key) => {
                    info!(circuit_id = self.circuit_id, msg_id, rx_key = %key.fingerprint(), "peer rotated keys");
                    rx.key = Some(key);
                }
                None => {
                    warn!(circuit_id = self.circuit_id, msg_id, "key update without a staged key, keeping current key");
                }
            }
        }

        let payload = if flags.contains(FrameFlags::ENCRYPTED) {
            let Some(key) = rx.key.as_ref() else {
                warn!(circuit_id = self.circuit_id, msg_id, segment_index, "encrypted frame but no receive key");
                return Err(TransportError::Decrypt {
                    msg_id,
                    segment: segment_index,
                });
            };
            match self
                .cipher
                .decrypt(key, &payload, &frame_aad(msg_id, segment_index))
            {
                Ok(plain) => {
                    if !self.encryption_enabled.swap(true, Ordering::AcqRel) {
                        info!(circuit_id = self.circuit_id, "peer is encrypting, enabling encryption");
                    }
                    Bytes::from(plain)
                }
                Err(e) => {
                    warn!(circuit_id = self.circuit_id, msg_id, segment_index, error = %e, "decrypt failed, frame dropped");
                    return Err(TransportError::Decrypt {
                        msg_id,
                        segment: segment_index,
                    });
                }
            }
        } else {
            payload
        };

        let limit = self.config.max_message_size.min(out_len);
        let segment = Segment {
            msg_id,
            index: segment_index,
            terminal: !flags.contains(FrameFlags::SEGMENTED),
            compressed: flags.contains(FrameFlags::COMPRESSED),
            payload,
        };
        match rx.cache.insert(segment, limit, now) {
            Inserted::Pending | Inserted::Complete => Ok(()),
            Inserted::Dropped(DropReason::TooLarge { size, limit }) => {
                warn!(circuit_id = self.circuit_id, msg_id, size, limit, "oversize message dropped");
                Err(TransportError::MessageTooLarge { len: size, max: limit })
            }
            Inserted::Dropped(DropReason::Inconsistent) => {
                warn!(circuit_id = self.circuit_id, msg_id, segment_index, "inconsistent segment, message dropped");
                Ok(())
            }
        }
    }

    fn deliver(&self, message: Completed, out: &mut [u8]) -> Result<usize, TransportError> {
        let Completed {
            msg_id,
            compressed,
            payload,
        } = message;
        let body = if compressed {
            let max_len = out.len().min(self.config.max_message_size);
            self.compressor
                .decompress(&payload, max_len)
                .map_err(|_| TransportError::Decompress { msg_id })?
        } else {
            payload
        };
        if body.len() > out.len() {
            return Err(TransportError::MessageTooLarge {
                len: body.len(),
                max: out.len(),
            });
        }
        out[..body.len()].copy_from_slice(&body);
        Ok(body.len())
    }

    // ── Drain passes ─────────────────────────────────────────────────────────

    /// Hand queued wire bytes to every outbound callback. Returns the number
    /// of bytes handed over.
    pub fn drain_outbound(&self) -> usize {
        let mut total = 0;
        for callback in self.live_callbacks() {
            let size = callback.buffer_for(self.circuit_id, Direction::Outbound);
            if size == 0 {
                continue;
            }
            let mut buf = vec![0u8; size];
            loop {
                match self.output(&mut buf, self.config.drain_timeout()) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        callback.on_ready(self.circuit_id, Direction::Outbound, &buf[..n], 0);
                        total += n;
                    }
                }
            }
        }
        total
    }

    /// Deliver every complete message to the inbound callbacks. Returns the
    /// number of messages delivered.
    pub fn drain_inbound(&self) -> usize {
        let mut delivered = 0;
        for callback in self.live_callbacks() {
            let size = callback.buffer_for(self.circuit_id, Direction::Inbound);
            if size == 0 {
                continue;
            }
            let mut buf = vec![0u8; size];
            loop {
                match self.read(&mut buf, self.config.drain_timeout()) {
                    Ok((len, msg_id)) => {
                        callback.on_ready(self.circuit_id, Direction::Inbound, &buf[..len], msg_id);
                        delivered += 1;
                    }
                    Err(TransportError::Timeout) => break,
                    Err(e) => {
                        debug!(circuit_id = self.circuit_id, error = %e, "inbound drain continuing past error");
                    }
                }
            }
        }
        delivered
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn write_with_retry(
        &self,
        buffer: &BoundedByteBuffer,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        match buffer.write(data, timeout) {
            Ok(n) => Ok(n),
            Err(BufferError::ExceedsCapacity { requested, capacity }) => {
                Err(TransportError::MessageTooLarge {
                    len: requested,
                    max: capacity,
                })
            }
            Err(BufferError::TimedOut { .. }) => {
                debug!(circuit_id = self.circuit_id, len = data.len(), "buffer full, retrying once");
                buffer
                    .write(data, timeout)
                    .map_err(|_| TransportError::BufferFull)
            }
        }
    }

    fn arm(&self, direction: Direction) {
        if let Some(scheduler) = self.scheduler.get() {
            match direction {
                Direction::Inbound => scheduler.inbound.arm(),
                Direction::Outbound => scheduler.outbound.arm(),
            }
        }
    }

    fn live_callbacks(&self) -> Vec<Arc<dyn DataCallback>> {
        let mut callbacks = self.callbacks.lock();
        callbacks.retain(|c| c.strong_count() > 0);
        callbacks.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("circuit_id", &self.circuit_id)
            .field("encryption", &self.encryption_enabled())
            .field("compression", &self.compression_enabled())
            .field("outbound_used", &self.outbound.used_size())
            .field("inbound_used", &self.inbound.used_size())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
