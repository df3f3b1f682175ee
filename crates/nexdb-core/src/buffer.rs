//! Bounded byte ring: the single backpressure primitive of the transport.
//!
//! A fixed-capacity FIFO of bytes shared between a producer and the drain
//! path. Writes that do not fit block until space frees up, reads that ask
//! for more than is buffered block until it arrives; both give up at the
//! caller's deadline instead of overwriting or returning garbage.
//!
//! The buffer is byte-oriented on purpose: frames are rediscovered by the
//! consumer from their length prefix, so producer and consumer never need to
//! agree on boundaries.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Fixed-capacity blocking ring buffer of bytes.
pub struct BoundedByteBuffer {
    capacity: usize,
    ring: Mutex<Ring>,
    /// Signalled whenever bytes are consumed or the ring is cleared.
    space_available: Condvar,
    /// Signalled whenever bytes are appended.
    data_available: Condvar,
}

/// Ring storage plus two free-running cursors. `write_pos - read_pos` is the
/// number of buffered bytes and never exceeds the capacity.
struct Ring {
    storage: Box<[u8]>,
    read_pos: u64,
    write_pos: u64,
}

impl Ring {
    fn used(&self) -> usize {
        self.write_pos.wrapping_sub(self.read_pos) as usize
    }

    fn free(&self) -> usize {
        self.storage.len() - self.used()
    }

    fn offset(&self, pos: u64) -> usize {
        (pos % self.storage.len() as u64) as usize
    }

    fn copy_in(&mut self, data: &[u8]) {
        let cap = self.storage.len();
        let start = self.offset(self.write_pos);
        let first = data.len().min(cap - start);
        self.storage[start..start + first].copy_from_slice(&data[..first]);
        self.storage[..data.len() - first].copy_from_slice(&data[first..]);
        self.write_pos = self.write_pos.wrapping_add(data.len() as u64);
    }

    fn copy_out(&self, buf: &mut [u8]) {
        let cap = self.storage.len();
        let start = self.offset(self.read_pos);
        let first = buf.len().min(cap - start);
        let (head, tail) = buf.split_at_mut(first);
        head.copy_from_slice(&self.storage[start..start + first]);
        tail.copy_from_slice(&self.storage[..tail.len()]);
    }
}

impl BoundedByteBuffer {
    /// Create an empty buffer. A zero capacity is bumped to one byte so
    /// the cursor arithmetic stays well defined.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(Ring {
                storage: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
            }),
            space_available: Condvar::new(),
            data_available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently buffered. Never blocks on a condition.
    pub fn used_size(&self) -> usize {
        self.ring.lock().used()
    }

    pub fn free_size(&self) -> usize {
        self.ring.lock().free()
    }

    pub fn is_empty(&self) -> bool {
        self.used_size() == 0
    }

    /// Append all of `data`, waiting up to `timeout` for enough free space.
    /// Either every byte is written or none is.
    pub fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, BufferError> {
        if data.len() > self.capacity {
            return Err(BufferError::ExceedsCapacity {
                requested: data.len(),
                capacity: self.capacity,
            });
        }
        let deadline = deadline_after(timeout);

        let mut ring = self.ring.lock();
        if !wait_until(&mut ring, &self.space_available, deadline, |r| {
            r.free() >= data.len()
        }) {
            return Err(BufferError::TimedOut {
                needed: data.len(),
                available: ring.free(),
            });
        }

        ring.copy_in(data);
        drop(ring);
        self.data_available.notify_all();
        Ok(data.len())
    }

    /// Consume exactly `buf.len()` bytes, waiting up to `timeout` for them
    /// to be buffered. On timeout nothing is consumed.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, BufferError> {
        let mut ring = self.wait_for_data(buf.len(), timeout)?;
        ring.copy_out(buf);
        ring.read_pos = ring.read_pos.wrapping_add(buf.len() as u64);
        drop(ring);
        self.space_available.notify_all();
        Ok(buf.len())
    }

    /// Same wait as [`read`](Self::read) but leaves the read cursor where
    /// it is.
    pub fn peek(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, BufferError> {
        let ring = self.wait_for_data(buf.len(), timeout)?;
        ring.copy_out(buf);
        Ok(buf.len())
    }

    /// Drop everything buffered. Used to recover from a desynchronized
    /// stream; any frames queued behind the corruption are lost too.
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.read_pos = ring.write_pos;
        drop(ring);
        self.space_available.notify_all();
    }

    fn wait_for_data(
        &self,
        len: usize,
        timeout: Duration,
    ) -> Result<MutexGuard<'_, Ring>, BufferError> {
        if len > self.capacity {
            return Err(BufferError::ExceedsCapacity {
                requested: len,
                capacity: self.capacity,
            });
        }
        let deadline = deadline_after(timeout);

        let mut ring = self.ring.lock();
        if !wait_until(&mut ring, &self.data_available, deadline, |r| r.used() >= len) {
            return Err(BufferError::TimedOut {
                needed: len,
                available: ring.used(),
            });
        }
        Ok(ring)
    }
}

impl std::fmt::Debug for BoundedByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedByteBuffer")
            .field("capacity", &self.capacity)
            .field("used", &self.used_size())
            .finish()
    }
}

/// `None` means the timeout is too large to represent and the wait is
/// effectively unbounded.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Block on `cv` until `ready` holds or the deadline passes. Returns
/// whether the condition holds.
fn wait_until<F>(
    ring: &mut MutexGuard<'_, Ring>,
    cv: &Condvar,
    deadline: Option<Instant>,
    ready: F,
) -> bool
where
    F: Fn(&Ring) -> bool,
{
    while !ready(&**ring) {
        match deadline {
            Some(deadline) => {
                if cv.wait_until(ring, deadline).timed_out() {
                    return ready(&**ring);
                }
            }
            None => cv.wait(ring),
        }
    }
    true
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// `available` is free space for a write, buffered bytes for a read.
    #[error("timed out waiting for {needed} bytes ({available} available)")]
    TimedOut { needed: usize, available: usize },

    #[error("request for {requested} bytes can never fit a {capacity}-byte buffer")]
    ExceedsCapacity { requested: usize, capacity: usize },
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn write_then_read_preserves_order() {
        let buf = BoundedByteBuffer::new(16);
        buf.write(b"abc", SHORT).unwrap();
        buf.write(b"defg", SHORT).unwrap();
        assert_eq!(buf.used_size(), 7);

        let mut out = [0u8; 7];
        assert_eq!(buf.read(&mut out, SHORT).unwrap(), 7);
        assert_eq!(&out, b"abcdefg");
        assert!(buf.is_empty());
    }

    #[test]
    fn wraps_around_capacity() {
        let buf = BoundedByteBuffer::new(8);
        let mut out = [0u8; 6];
        for round in 0..10u8 {
            let data = [round; 6];
            buf.write(&data, SHORT).unwrap();
            buf.read(&mut out, SHORT).unwrap();
            assert_eq!(out, data, "round {round}");
        }
        assert_eq!(buf.used_size(), 0);
        assert_eq!(buf.free_size(), 8);
    }

    #[test]
    fn write_beyond_free_space_times_out_without_overwriting() {
        let buf = BoundedByteBuffer::new(8);
        buf.write(b"12345", SHORT).unwrap();

        let err = buf.write(b"6789", SHORT).unwrap_err();
        assert_eq!(
            err,
            BufferError::TimedOut {
                needed: 4,
                available: 3
            }
        );

        let mut out = [0u8; 5];
        buf.read(&mut out, SHORT).unwrap();
        assert_eq!(&out, b"12345");
    }

    #[test]
    fn read_beyond_used_times_out_and_consumes_nothing() {
        let buf = BoundedByteBuffer::new(8);
        buf.write(b"ab", SHORT).unwrap();

        let mut out = [0u8; 3];
        assert!(matches!(
            buf.read(&mut out, SHORT),
            Err(BufferError::TimedOut { needed: 3, .. })
        ));
        assert_eq!(buf.used_size(), 2);
    }

    #[test]
    fn peek_does_not_advance() {
        let buf = BoundedByteBuffer::new(8);
        buf.write(b"wxyz", SHORT).unwrap();

        let mut prefix = [0u8; 2];
        buf.peek(&mut prefix, SHORT).unwrap();
        assert_eq!(&prefix, b"wx");
        assert_eq!(buf.used_size(), 4);

        let mut all = [0u8; 4];
        buf.read(&mut all, SHORT).unwrap();
        assert_eq!(&all, b"wxyz");
    }

    #[test]
    fn oversized_requests_fail_immediately() {
        let buf = BoundedByteBuffer::new(4);
        assert_eq!(
            buf.write(&[0u8; 5], LONG),
            Err(BufferError::ExceedsCapacity {
                requested: 5,
                capacity: 4
            })
        );
        let mut out = [0u8; 5];
        assert!(matches!(
            buf.read(&mut out, LONG),
            Err(BufferError::ExceedsCapacity { .. })
        ));
    }

    #[test]
    fn clear_discards_everything() {
        let buf = BoundedByteBuffer::new(8);
        buf.write(b"garbage", SHORT).unwrap();
        buf.clear();
        assert!(buf.is_empty());
        buf.write(b"12345678", SHORT).unwrap();
        assert_eq!(buf.free_size(), 0);
    }

    // ── Cross-thread ─────────────────────────────────────────────────────────

    #[test]
    fn blocked_reader_wakes_on_write() {
        let buf = Arc::new(BoundedByteBuffer::new(32));
        let reader = {
            let buf = buf.clone();
            thread::spawn(move || {
                let mut out = [0u8; 10];
                buf.read(&mut out, LONG).map(|_| out)
            })
        };

        thread::sleep(Duration::from_millis(10));
        buf.write(b"01234", SHORT).unwrap();
        buf.write(b"56789", SHORT).unwrap();

        let out = reader.join().unwrap().unwrap();
        assert_eq!(&out, b"0123456789");
    }

    #[test]
    fn blocked_writer_wakes_on_read() {
        let buf = Arc::new(BoundedByteBuffer::new(8));
        buf.write(b"AAAAAAAA", SHORT).unwrap();

        let writer = {
            let buf = buf.clone();
            thread::spawn(move || buf.write(b"BBBB", LONG))
        };

        thread::sleep(Duration::from_millis(10));
        let mut out = [0u8; 4];
        buf.read(&mut out, SHORT).unwrap();

        assert_eq!(writer.join().unwrap(), Ok(4));
        let mut rest = [0u8; 8];
        buf.read(&mut rest, SHORT).unwrap();
        assert_eq!(&rest, b"AAAABBBB");
    }

    #[test]
    fn blocked_writer_wakes_on_clear() {
        let buf = Arc::new(BoundedByteBuffer::new(4));
        buf.write(b"full", SHORT).unwrap();

        let writer = {
            let buf = buf.clone();
            thread::spawn(move || buf.write(b"next", LONG))
        };

        thread::sleep(Duration::from_millis(10));
        buf.clear();
        assert_eq!(writer.join().unwrap(), Ok(4));
    }
}
