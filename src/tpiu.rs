//! A byte pump for the TPIU (Trace Port Interface Unit) framing layer.
//!
//! The TPIU multiplexes several trace streams onto one byte channel using
//! 16-byte frames as laid out in the CoreSight architecture specification
//! (ARM IHI 0029, formatter protocol). Each frame is eight byte-pairs; the
//! even bytes either carry data or announce a stream-id change, and byte 15
//! collects the even bytes' displaced low bits.
//!
//! The decoder is fed one byte at a time via [`TpiuDecoder::pump`] and
//! reports progress through [`TpiuEvent`]. A completed frame is retrieved
//! with [`TpiuDecoder::get_packet`], which demultiplexes it into
//! `(stream, data)` pairs with the delayed stream-change rule applied.

use std::time::{Duration, Instant};

/// Sync pattern as it appears in the rolling 32-bit window: three `0xFF`
/// then `0x7F`.
const SYNC_PATTERN: u32 = 0xFFFF_FF7F;

/// A half-sync is the 16-bit pattern `0x7FFF` at the current pair
/// alignment, i.e. the byte pair `(0xFF, 0x7F)`.
const HALFSYNC_FIRST: u8 = 0xFF;
const HALFSYNC_SECOND: u8 = 0x7F;

/// Leading byte of a frame carrying link statistics rather than trace data.
const STAT_FRAME_MAGIC: u8 = 0xA6;

pub const FRAME_LEN: usize = 16;

/// Two consecutive frames separated by at least this long mean the link
/// went away; the decoder drops sync rather than emit stale data.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of feeding one byte to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpiuEvent {
    /// Nothing of note; the byte was absorbed.
    Idle,

    /// Receiving: the byte was stored into the current frame.
    Rxing,

    /// Sync pattern seen while unsynchronised; frame reception begins.
    NewSync,

    /// Sync pattern seen while already synchronised; alignment confirmed.
    Synced,

    /// A complete 16-byte frame is available via
    /// [`TpiuDecoder::get_packet`].
    FrameReady,

    /// Synchronisation was lost (inter-frame timeout).
    Unsynced,

    /// The byte could not be processed in the current state.
    Error,
}

/// One demultiplexed byte together with the stream it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TpiuPair {
    /// Stream id the byte was tagged with (0..=0x7F).
    pub stream: u8,

    /// The data byte.
    pub data: u8,
}

/// The demultiplexed content of one frame: up to 15 `(stream, data)`
/// pairs. Frames consisting purely of stream-id changes decode to fewer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TpiuPacket {
    pub pairs: Vec<TpiuPair>,
}

/// Running decode counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TpiuStats {
    /// Sync patterns seen.
    pub sync_count: u64,

    /// Half-sync pairs elided from the stream.
    pub half_sync_count: u64,

    /// Frames completed.
    pub packet_count: u64,

    /// Times synchronisation was lost after having been acquired.
    pub lost_sync_count: u64,

    /// Bytes that could not be processed.
    pub error_count: u64,
}

/// Link statistics reported by the probe itself in a magic frame.
///
/// Layout within the frame: byte 0 is [`STAT_FRAME_MAGIC`], byte 1 the
/// pending count, byte 2 the LED state, bytes 3..5 the lost-frame count
/// and bytes 5..9 the total-frame count, all little-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommsStats {
    pub pending_count: u8,
    pub leds: u8,
    pub lost_frames: u16,
    pub total_frames: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Hunting for the sync pattern; incoming bytes are discarded.
    Unsynced,

    /// Collecting frame bytes.
    Rxing,
}

/// TPIU frame decoder state machine.
pub struct TpiuDecoder {
    state: State,

    /// Rolling window over the last four bytes, for sync detection.
    sync_monitor: u32,

    /// The frame under construction.
    rxed: [u8; FRAME_LEN],
    byte_count: usize,

    /// First byte of the pair currently being collected, if any. Pairs
    /// are only committed to the frame once both halves have arrived so
    /// that a half-sync can be elided without advancing the frame.
    pending: Option<u8>,

    /// Stream id in effect at the start of the next frame.
    current_stream: u8,

    /// Completion time of the previous frame.
    last_frame: Option<Instant>,

    /// Set by a completed frame, cleared by [`Self::get_packet`].
    frame_fresh: bool,

    frame_timeout: Duration,

    stats: TpiuStats,
    comms: Option<CommsStats>,
}

impl Default for TpiuDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TpiuDecoder {
    pub fn new() -> Self {
        TpiuDecoder {
            state: State::Unsynced,
            sync_monitor: 0,
            rxed: [0; FRAME_LEN],
            byte_count: 0,
            pending: None,
            current_stream: 0,
            last_frame: None,
            frame_fresh: false,
            frame_timeout: FRAME_TIMEOUT,
            stats: TpiuStats::default(),
            comms: None,
        }
    }

    /// Override the inter-frame timeout. Mostly of use to tests; the
    /// protocol default is [`FRAME_TIMEOUT`].
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn stats(&self) -> &TpiuStats {
        &self.stats
    }

    /// The most recent link statistics frame, if one was seen.
    pub fn comms_stats(&self) -> Option<&CommsStats> {
        self.comms.as_ref()
    }

    pub fn is_synced(&self) -> bool {
        self.state == State::Rxing
    }

    /// Declare the decoder synchronised at `offset` bytes into a frame,
    /// without waiting for a sync pattern. Also stamps the frame timer so
    /// the first real frame is not aged against a stale timestamp.
    pub fn force_sync(&mut self, offset: usize) {
        self.state = State::Rxing;
        self.byte_count = offset.min(FRAME_LEN - 1) & !1;
        self.pending = None;
        self.frame_fresh = false;
        self.last_frame = Some(Instant::now());
    }

    /// Feed one byte to the decoder.
    pub fn pump(&mut self, byte: u8) -> TpiuEvent {
        self.sync_monitor = (self.sync_monitor << 8) | u32::from(byte);

        if self.sync_monitor == SYNC_PATTERN {
            return self.handle_sync();
        }

        match self.state {
            State::Unsynced => TpiuEvent::Idle,
            State::Rxing => match self.pending.take() {
                None => {
                    self.pending = Some(byte);
                    TpiuEvent::Rxing
                }
                Some(first) if first == HALFSYNC_FIRST && byte == HALFSYNC_SECOND => {
                    // Half-sync: elided, frame position unchanged.
                    self.stats.half_sync_count += 1;
                    TpiuEvent::Idle
                }
                Some(first) => {
                    self.rxed[self.byte_count] = first;
                    self.rxed[self.byte_count + 1] = byte;
                    self.byte_count += 2;

                    if self.byte_count == FRAME_LEN {
                        self.complete_frame()
                    } else {
                        TpiuEvent::Rxing
                    }
                }
            },
        }
    }

    /// The sync pattern resynchronises unconditionally, whatever state the
    /// decoder was in.
    fn handle_sync(&mut self) -> TpiuEvent {
        // A probe statistics frame ends in the sync pattern: the preceding
        // fourteen collected bytes begin with the magic.
        if self.byte_count == FRAME_LEN - 2 && self.rxed[0] == STAT_FRAME_MAGIC {
            self.comms = Some(CommsStats {
                pending_count: self.rxed[1],
                leds: self.rxed[2],
                lost_frames: u16::from_le_bytes([self.rxed[3], self.rxed[4]]),
                total_frames: u32::from_le_bytes([
                    self.rxed[5],
                    self.rxed[6],
                    self.rxed[7],
                    self.rxed[8],
                ]),
            });
        }

        self.stats.sync_count += 1;
        self.byte_count = 0;
        self.pending = None;
        self.frame_fresh = false;
        self.last_frame = Some(Instant::now());

        match self.state {
            State::Unsynced => {
                self.state = State::Rxing;
                TpiuEvent::NewSync
            }
            State::Rxing => TpiuEvent::Synced,
        }
    }

    fn complete_frame(&mut self) -> TpiuEvent {
        let now = Instant::now();
        self.byte_count = 0;

        if let Some(last) = self.last_frame {
            if now.duration_since(last) >= self.frame_timeout {
                self.state = State::Unsynced;
                self.stats.lost_sync_count += 1;
                self.last_frame = None;
                self.frame_fresh = false;
                return TpiuEvent::Unsynced;
            }
        }

        self.last_frame = Some(now);
        self.stats.packet_count += 1;
        self.frame_fresh = true;
        TpiuEvent::FrameReady
    }

    /// Demultiplex the last completed frame.
    ///
    /// Only valid immediately after [`TpiuEvent::FrameReady`]; the byte
    /// counter must be at a frame boundary. Returns `None` otherwise.
    pub fn get_packet(&mut self) -> Option<TpiuPacket> {
        if !self.frame_fresh || self.byte_count != 0 {
            return None;
        }
        self.frame_fresh = false;

        let lowbits = self.rxed[FRAME_LEN - 1];
        let mut stream = self.current_stream;
        let mut pairs = Vec::with_capacity(FRAME_LEN - 1);

        for pair in 0..FRAME_LEN / 2 {
            let i = pair * 2;
            let low = (lowbits >> pair) & 1;
            let even = self.rxed[i];
            let mut delayed = None;

            if even & 1 == 1 {
                // Stream-id change; the pair's low bit selects whether it
                // takes effect before or after the companion data byte.
                let target = even >> 1;
                if low == 1 {
                    delayed = Some(target);
                } else {
                    stream = target;
                }
            } else {
                pairs.push(TpiuPair {
                    stream,
                    data: even | low,
                });
            }

            if i < FRAME_LEN - 2 {
                pairs.push(TpiuPair {
                    stream,
                    data: self.rxed[i + 1],
                });
            }

            if let Some(target) = delayed {
                stream = target;
            }
        }

        self.current_stream = stream;
        Some(TpiuPacket { pairs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synced_decoder() -> TpiuDecoder {
        let mut d = TpiuDecoder::new();
        for b in [0xFF, 0xFF, 0xFF, 0x7F].iter() {
            d.pump(*b);
        }
        assert!(d.is_synced());
        d
    }

    fn pump_frame(d: &mut TpiuDecoder, frame: &[u8; FRAME_LEN]) -> TpiuEvent {
        let mut last = TpiuEvent::Idle;
        for b in frame.iter() {
            last = d.pump(*b);
        }
        last
    }

    #[test]
    fn sync_from_cold() {
        let mut d = TpiuDecoder::new();
        assert_eq!(d.pump(0xFF), TpiuEvent::Idle);
        assert_eq!(d.pump(0xFF), TpiuEvent::Idle);
        assert_eq!(d.pump(0xFF), TpiuEvent::Idle);
        assert_eq!(d.pump(0x7F), TpiuEvent::NewSync);
        assert!(d.is_synced());
        assert_eq!(d.stats().sync_count, 1);
    }

    #[test]
    fn resync_while_rxing_reports_synced() {
        let mut d = synced_decoder();

        // A zero frame, then a second sync pattern.
        let ev = pump_frame(&mut d, &[0u8; FRAME_LEN]);
        assert_eq!(ev, TpiuEvent::FrameReady);

        d.pump(0xFF);
        d.pump(0xFF);
        d.pump(0xFF);
        assert_eq!(d.pump(0x7F), TpiuEvent::Synced);
    }

    #[test]
    fn zero_frame_demuxes_to_stream_zero() {
        let mut d = synced_decoder();
        assert_eq!(pump_frame(&mut d, &[0u8; FRAME_LEN]), TpiuEvent::FrameReady);

        let packet = d.get_packet().expect("frame should be available");
        assert_eq!(packet.pairs.len(), 15);
        assert!(packet.pairs.iter().all(|p| p.stream == 0 && p.data == 0));

        // A second fetch is refused: the frame is no longer fresh.
        assert!(d.get_packet().is_none());
    }

    #[test]
    fn half_sync_does_not_advance_the_frame() {
        let mut d = synced_decoder();

        d.pump(0x00);
        d.pump(0x00);
        assert_eq!(d.byte_count, 2);

        d.pump(0xFF);
        assert_eq!(d.pump(0x7F), TpiuEvent::Idle);
        assert_eq!(d.byte_count, 2, "half-sync must not advance the frame");
        assert_eq!(d.stats().half_sync_count, 1);

        d.pump(0x00);
        d.pump(0x00);
        assert_eq!(d.byte_count, 4);
    }

    #[test]
    fn immediate_stream_change() {
        let mut d = synced_decoder();

        // Pair 0: change to stream 1 (low bit clear: immediate), then data.
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = 0x03; // stream change, target 1
        frame[1] = 0xAA;
        assert_eq!(pump_frame(&mut d, &frame), TpiuEvent::FrameReady);

        let packet = d.get_packet().unwrap();
        assert_eq!(
            packet.pairs[0],
            TpiuPair {
                stream: 1,
                data: 0xAA
            }
        );
    }

    #[test]
    fn delayed_stream_change_applies_after_the_data_byte() {
        let mut d = synced_decoder();

        let mut frame = [0u8; FRAME_LEN];
        frame[0] = 0x03; // stream change, target 1
        frame[1] = 0xAA;
        frame[15] = 0x01; // pair 0 low bit: change is delayed
        assert_eq!(pump_frame(&mut d, &frame), TpiuEvent::FrameReady);

        let packet = d.get_packet().unwrap();
        // 0xAA still belongs to the previous stream (0)...
        assert_eq!(
            packet.pairs[0],
            TpiuPair {
                stream: 0,
                data: 0xAA
            }
        );
        // ...and everything after runs on stream 1.
        assert!(packet.pairs[1..].iter().all(|p| p.stream == 1));
    }

    #[test]
    fn data_byte_low_bit_restored_from_aux_byte() {
        let mut d = synced_decoder();

        let mut frame = [0u8; FRAME_LEN];
        frame[2] = 0x54; // even data byte, true value 0x55
        frame[15] = 0x02; // pair 1 low bit
        assert_eq!(pump_frame(&mut d, &frame), TpiuEvent::FrameReady);

        let packet = d.get_packet().unwrap();
        assert_eq!(packet.pairs[1].data, 0x55);
    }

    #[test]
    fn stream_persists_across_frames() {
        let mut d = synced_decoder();

        let mut frame = [0u8; FRAME_LEN];
        frame[0] = 0x05; // immediate change to stream 2
        pump_frame(&mut d, &frame);
        d.get_packet().unwrap();

        pump_frame(&mut d, &[0u8; FRAME_LEN]);
        let packet = d.get_packet().unwrap();
        assert!(packet.pairs.iter().all(|p| p.stream == 2));
    }

    /// Encode-then-decode round trip: a frame constructed from an event
    /// sequence (with the delayed-change rule respected) demuxes to
    /// exactly that sequence.
    #[test]
    fn frame_round_trip() {
        let mut d = synced_decoder();

        // Stream changes at pairs 0 (delayed) and 2 (immediate), data
        // everywhere else.
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = 0x07; // -> stream 3, delayed
        frame[1] = 0x10;
        frame[2] = 0x20;
        frame[3] = 0x30;
        frame[4] = 0x0B; // -> stream 5, immediate
        frame[5] = 0x40;
        frame[6] = 0x50;
        frame[7] = 0x60;
        frame[8] = 0x70;
        frame[9] = 0x80;
        frame[10] = 0x90;
        frame[11] = 0xA0;
        frame[12] = 0xB0;
        frame[13] = 0xC0;
        frame[14] = 0xD0;
        frame[15] = 0x01; // pair 0 delayed

        let expect = [
            (0u8, 0x10u8), // before the delayed change lands
            (3, 0x20),
            (3, 0x30),
            (5, 0x40), // immediate change
            (5, 0x50),
            (5, 0x60),
            (5, 0x70),
            (5, 0x80),
            (5, 0x90),
            (5, 0xA0),
            (5, 0xB0),
            (5, 0xC0),
            (5, 0xD0),
        ];

        pump_frame(&mut d, &frame);
        let packet = d.get_packet().unwrap();
        let got: Vec<(u8, u8)> = packet.pairs.iter().map(|p| (p.stream, p.data)).collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn frame_timeout_drops_sync() {
        let mut d = TpiuDecoder::new().with_frame_timeout(Duration::from_millis(5));
        for b in [0xFF, 0xFF, 0xFF, 0x7F].iter() {
            d.pump(*b);
        }

        pump_frame(&mut d, &[0u8; FRAME_LEN]);
        assert!(d.get_packet().is_some());

        std::thread::sleep(Duration::from_millis(10));
        let ev = pump_frame(&mut d, &[0u8; FRAME_LEN]);
        assert_eq!(ev, TpiuEvent::Unsynced);
        assert!(!d.is_synced());
        assert_eq!(d.stats().lost_sync_count, 1);
        assert!(d.get_packet().is_none(), "timed-out frame is discarded");
    }

    #[test]
    fn force_sync_frame_completes_at_the_expected_byte() {
        let mut d = TpiuDecoder::new();
        d.force_sync(4);
        assert!(d.is_synced());

        // 16 - 4 = 12 bytes to the boundary.
        for _ in 0..11 {
            assert_ne!(d.pump(0x00), TpiuEvent::FrameReady);
        }
        assert_eq!(d.pump(0x00), TpiuEvent::FrameReady);
    }

    #[test]
    fn comms_stats_frame_is_decoded() {
        let mut d = synced_decoder();

        // Twelve payload bytes; the frame is then closed out by the sync
        // pattern, whose first two bytes land in the pair collector.
        let mut payload = [0u8; 12];
        payload[0] = 0xA6;
        payload[1] = 3; // pending
        payload[2] = 0x05; // leds
        payload[3] = 0x22; // lost, le
        payload[4] = 0x11;
        payload[5] = 0x78; // total, le
        payload[6] = 0x56;
        payload[7] = 0x34;
        payload[8] = 0x12;
        for b in payload.iter() {
            d.pump(*b);
        }
        d.pump(0xFF);
        d.pump(0xFF);
        d.pump(0xFF);
        assert_eq!(d.pump(0x7F), TpiuEvent::Synced);

        let stats = d.comms_stats().expect("stats frame decoded");
        assert_eq!(stats.pending_count, 3);
        assert_eq!(stats.leds, 0x05);
        assert_eq!(stats.lost_frames, 0x1122);
        assert_eq!(stats.total_frames, 0x12345678);
    }
}
