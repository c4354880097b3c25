//! The postmortem capture buffer: a wrap-aware byte ring fed from the
//! trace source, replayed into an ETM pump once the stream goes quiet.
//!
//! The ring keeps a read and a write index only; the slot before `rp` is
//! reserved so an empty ring (`rp == wp`) can be told apart from a full
//! one (`fill == N - 1`).

use std::time::{Duration, Instant};

use crate::etm::{EtmChange, EtmPump};

/// Quiet time on the wire after which the buffer is considered worth
/// replaying.
pub const HANG_TIME: Duration = Duration::from_millis(200);

/// What to do when a write catches up with the read pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    /// Drop the oldest byte and keep capturing.
    Continuous,

    /// Hold the buffer: stop writing until released.
    SingleShot,
}

/// The capture buffer cannot hold anything useful below two slots.
#[derive(Debug, thiserror::Error)]
#[error("postmortem buffer needs at least two bytes, got {0}")]
pub struct BadBufferLen(pub usize);

/// Byte ring with `fill = (wp - rp + N) mod N` and one reserved slot.
pub struct RingBuffer {
    buf: Vec<u8>,
    rp: usize,
    wp: usize,
    mode: WrapMode,

    /// Single-shot collision happened; writes are ignored until
    /// [`RingBuffer::release`].
    held: bool,

    /// Oldest data was overwritten at least once (continuous mode); any
    /// decoder alignment guess predating the buffer content is invalid.
    wrapped: bool,
}

impl RingBuffer {
    pub fn new(len: usize, mode: WrapMode) -> Result<Self, BadBufferLen> {
        if len < 2 {
            return Err(BadBufferLen(len));
        }
        Ok(RingBuffer {
            buf: vec![0; len],
            rp: 0,
            wp: 0,
            mode,
            held: false,
            wrapped: false,
        })
    }

    /// Bytes currently stored; at most `len - 1`.
    pub fn available(&self) -> usize {
        (self.wp + self.buf.len() - self.rp) % self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    pub fn is_full(&self) -> bool {
        self.available() == self.buf.len() - 1
    }

    pub fn held(&self) -> bool {
        self.held
    }

    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    /// Resume writing after a single-shot hold.
    pub fn release(&mut self) {
        self.held = false;
    }

    pub fn clear(&mut self) {
        self.rp = 0;
        self.wp = 0;
        self.held = false;
        self.wrapped = false;
    }

    pub fn write(&mut self, byte: u8) {
        if self.held {
            return;
        }

        let len = self.buf.len();
        let next = (self.wp + 1) % len;
        if next == self.rp {
            match self.mode {
                WrapMode::Continuous => {
                    self.rp = (self.rp + 1) % len;
                    self.wrapped = true;
                }
                WrapMode::SingleShot => {
                    self.held = true;
                    return;
                }
            }
        }

        self.buf[self.wp] = byte;
        self.wp = next;
    }

    pub fn write_all(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.write(*byte);
        }
    }

    /// The stored bytes, oldest first, as up to two slices: `[rp..wp)`
    /// straight, or `[rp..N)` then `[0..wp)` when wrapped around.
    pub fn chunks(&self) -> (&[u8], &[u8]) {
        if self.rp <= self.wp {
            (&self.buf[self.rp..self.wp], &[])
        } else {
            (&self.buf[self.rp..], &self.buf[..self.wp])
        }
    }
}

/// Ring buffer plus the replay trigger bookkeeping: quiescence timing
/// and the rendered-already latch.
pub struct Postmortem {
    ring: RingBuffer,
    last_byte: Option<Instant>,
    rendered: bool,
    hang_time: Duration,
}

impl Postmortem {
    pub fn new(len: usize, mode: WrapMode) -> Result<Self, BadBufferLen> {
        Ok(Postmortem {
            ring: RingBuffer::new(len, mode)?,
            last_byte: None,
            rendered: false,
            hang_time: HANG_TIME,
        })
    }

    /// Override the quiescence threshold. The protocol default is
    /// [`HANG_TIME`].
    pub fn with_hang_time(mut self, hang_time: Duration) -> Self {
        self.hang_time = hang_time;
        self
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn release(&mut self) {
        self.ring.release();
    }

    /// Capture a block of trace bytes.
    pub fn write(&mut self, bytes: &[u8]) {
        self.ring.write_all(bytes);
        self.last_byte = Some(Instant::now());
        self.rendered = false;
    }

    /// Whether the buffer content has been replayed since the last byte
    /// arrived.
    pub fn rendered(&self) -> bool {
        self.rendered
    }

    /// Whether the quiescence heuristic fires: no bytes for the hang
    /// time, data present, nothing rendered since the last byte.
    pub fn should_replay(&self, now: Instant) -> bool {
        !self.rendered
            && !self.ring.is_empty()
            && self
                .last_byte
                .map_or(false, |at| now.duration_since(at) >= self.hang_time)
    }

    /// Feed the buffer into the ETM pump, oldest byte first, invoking
    /// `on_change` per decoded flow change.
    ///
    /// If the buffer wrapped while collecting, whatever alignment the
    /// pump had guessed belongs to bytes that no longer exist, so it is
    /// told to drop sync first.
    pub fn replay<F: FnMut(EtmChange)>(&mut self, etm: &mut dyn EtmPump, mut on_change: F) {
        if self.ring.wrapped() {
            etm.force_sync(false);
        }

        let (head, tail) = self.ring.chunks();
        for byte in head.iter().chain(tail) {
            if let Some(change) = etm.pump(*byte) {
                on_change(change);
            }
        }
        self.rendered = true;
    }
}
