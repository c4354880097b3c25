//! A byte pump for the ITM and DWT packet protocol as specified in the
//! ARMv7-M architecture reference manual, Appendix D4.
//!
//! Unlike a pull decoder over [`std::io::Read`], this machine accepts one
//! byte at a time (the shape the TPIU demultiplexer hands them over in)
//! and reports progress through [`ItmEvent`]. A fully assembled message
//! rides in [`ItmEvent::Packet`].
//!
//! The pump starts unsynchronised and discards bytes until an ITM
//! synchronisation packet passes by, unless [`ItmDecoder::force_sync`]
//! declares the stream aligned (the TPIU layer does this whenever it has
//! just found frame sync itself).

use bitmatch::bitmatch;

use crate::msg::{ItmMessage, TimeStatus};

/// ITM synchronisation: at least five zero bytes followed by `0x80`,
/// tracked byte-aligned in a rolling 48-bit window.
const ITM_SYNC_MASK: u64 = 0xFFFF_FFFF_FFFF;
const ITM_SYNC_PATTERN: u64 = 0x0000_0000_0080;

/// A TPIU sync pattern inside an ITM flow means the stream is mislabeled
/// or the demux upstream has come apart.
const TPIU_SYNC_MASK: u64 = 0xFFFF_FFFF;
const TPIU_SYNC_PATTERN: u64 = 0xFFFF_FF7F;

/// Ways a byte can fail to decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ItmError {
    /// Header byte matches no packet class.
    #[error("header byte {0:#04x} matches no packet class")]
    InvalidHeader(u8),

    /// A hardware source packet combined a discriminator with a payload
    /// size the discriminator does not admit.
    #[error("hardware packet discriminator {disc} with {len}-byte payload is invalid")]
    InvalidHardwarePacket { disc: u8, len: u8 },

    /// An exception trace packet carried a reserved action code.
    #[error("exception {number} with reserved action code")]
    InvalidExceptionTrace { number: u16 },

    /// A source packet header announced the reserved payload size.
    #[error("source packet header {header:#04x} carries a reserved payload size")]
    InvalidSourcePayload { header: u8 },

    /// A TPIU sync pattern was seen inside the ITM flow.
    #[error("TPIU sync pattern inside ITM stream")]
    TpiuSyncInStream,
}

/// Outcome of feeding one byte to the pump.
#[derive(Debug, Clone, PartialEq)]
pub enum ItmEvent {
    /// Byte absorbed; a packet may be in progress.
    Idle,

    /// Byte discarded while hunting for synchronisation.
    Unsynced,

    /// A synchronisation packet was recognised.
    Synced,

    /// The target reported overflow: trace data was lost at the source.
    Overflow,

    /// The byte could not be decoded. Synchronisation is kept unless the
    /// error says otherwise.
    Error(ItmError),

    /// A complete message was assembled.
    Packet(ItmMessage),
}

/// Running decode counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ItmStats {
    pub sync_count: u64,
    pub lost_sync_count: u64,
    pub overflow_count: u64,
    pub error_count: u64,
}

/// Packet currently being assembled, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Between packets; the next byte is a header.
    Idle,

    /// Instrumentation payload: `target` bytes, little-endian.
    Software {
        port: u8,
        target: u8,
        count: u8,
        value: u32,
    },

    /// Hardware source payload: `target` bytes for discriminator `disc`.
    Hardware {
        disc: u8,
        target: u8,
        count: u8,
        payload: [u8; 4],
    },

    /// Instruction-sync payload: `target` bytes of commanded address.
    NiSync {
        kind: u8,
        target: u8,
        count: u8,
        addr: u32,
    },

    /// Local timestamp continuation bytes (7 bits each).
    LocalTimestamp {
        status: TimeStatus,
        count: u8,
        ts: u32,
    },

    /// Global timestamp continuation bytes. Decoded and discarded: the
    /// consumers of this stack work from local timestamp deltas.
    GlobalTimestamp,
}

/// ITM/DWT packet protocol byte pump.
pub struct ItmDecoder {
    state: State,

    /// Rolling window over the last eight bytes, for sync detection.
    last_bytes: u64,

    /// Stimulus port page set by extension packets; offsets software
    /// port numbers in steps of 32.
    page_register: u8,

    synced: bool,

    stats: ItmStats,
}

impl Default for ItmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ItmDecoder {
    pub fn new() -> Self {
        ItmDecoder {
            state: State::Idle,
            last_bytes: 0,
            page_register: 0,
            synced: false,
            stats: ItmStats::default(),
        }
    }

    pub fn stats(&self) -> &ItmStats {
        &self.stats
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Declare the stream aligned (or not) without waiting for a sync
    /// packet. Used by the layer above when TPIU framing (re)appears.
    pub fn force_sync(&mut self, synced: bool) {
        if self.synced && !synced {
            self.stats.lost_sync_count += 1;
        }
        self.synced = synced;
        self.state = State::Idle;
    }

    /// Feed one byte to the pump.
    pub fn pump(&mut self, byte: u8) -> ItmEvent {
        self.last_bytes = (self.last_bytes << 8) | u64::from(byte);

        if self.last_bytes & TPIU_SYNC_MASK == TPIU_SYNC_PATTERN {
            self.stats.error_count += 1;
            if self.synced {
                self.stats.lost_sync_count += 1;
            }
            self.synced = false;
            self.state = State::Idle;
            return ItmEvent::Error(ItmError::TpiuSyncInStream);
        }

        if self.last_bytes & ITM_SYNC_MASK == ITM_SYNC_PATTERN {
            self.stats.sync_count += 1;
            self.synced = true;
            self.page_register = 0;
            self.state = State::Idle;
            return ItmEvent::Synced;
        }

        if !self.synced {
            return ItmEvent::Unsynced;
        }

        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => self.decode_header(byte),

            State::Software {
                port,
                target,
                mut count,
                mut value,
            } => {
                value |= u32::from(byte) << (8 * count);
                count += 1;
                if count == target {
                    ItmEvent::Packet(ItmMessage::Software {
                        port,
                        len: target,
                        value,
                    })
                } else {
                    self.state = State::Software {
                        port,
                        target,
                        count,
                        value,
                    };
                    ItmEvent::Idle
                }
            }

            State::Hardware {
                disc,
                target,
                mut count,
                mut payload,
            } => {
                payload[usize::from(count)] = byte;
                count += 1;
                if count == target {
                    self.finish_hardware(disc, target, &payload)
                } else {
                    self.state = State::Hardware {
                        disc,
                        target,
                        count,
                        payload,
                    };
                    ItmEvent::Idle
                }
            }

            State::NiSync {
                kind,
                target,
                mut count,
                mut addr,
            } => {
                addr |= u32::from(byte) << (8 * count);
                count += 1;
                if count == target {
                    ItmEvent::Packet(ItmMessage::NiSync { kind, addr })
                } else {
                    self.state = State::NiSync {
                        kind,
                        target,
                        count,
                        addr,
                    };
                    ItmEvent::Idle
                }
            }

            State::LocalTimestamp {
                status,
                mut count,
                mut ts,
            } => {
                if count < 4 {
                    ts |= u32::from(byte & 0x7F) << (7 * count);
                    count += 1;
                }
                if byte & 0x80 == 0 {
                    ItmEvent::Packet(ItmMessage::Timestamp {
                        status,
                        increment: ts,
                    })
                } else {
                    self.state = State::LocalTimestamp { status, count, ts };
                    ItmEvent::Idle
                }
            }

            State::GlobalTimestamp => {
                if byte & 0x80 != 0 {
                    self.state = State::GlobalTimestamp;
                }
                ItmEvent::Idle
            }
        }
    }

    /// Decode a header byte and enter the matching payload state.
    /// (Appendix D4, packet class table.)
    #[bitmatch]
    fn decode_header(&mut self, header: u8) -> ItmEvent {
        // See (Appendix D4.2.8, Table D4-4).
        fn translate_ss(ss: u8) -> Option<u8> {
            match ss {
                0b01 => Some(1),
                0b10 => Some(2),
                0b11 => Some(4),
                _ => None,
            }
        }

        #[bitmatch]
        match header {
            // A zero byte is only ever part of a synchronisation packet;
            // the rolling window picks the pattern up when it completes.
            "0000_0000" => ItmEvent::Idle,

            "0111_0000" => {
                self.stats.overflow_count += 1;
                ItmEvent::Overflow
            }

            "11ss_0000" => {
                // Local timestamp, format 1.
                self.state = State::LocalTimestamp {
                    status: match s {
                        0b00 => TimeStatus::Synced,
                        0b01 => TimeStatus::TimestampDelayed,
                        0b10 => TimeStatus::DataDelayed,
                        _ => TimeStatus::BothDelayed,
                    },
                    count: 0,
                    ts: 0,
                };
                ItmEvent::Idle
            }

            "0ttt_0000" => {
                // Local timestamp, format 2: the value rides in the header.
                ItmEvent::Packet(ItmMessage::Timestamp {
                    status: TimeStatus::Synced,
                    increment: u32::from(t),
                })
            }

            "1001_0100" => {
                // Global timestamp, lower half; swallowed.
                self.state = State::GlobalTimestamp;
                ItmEvent::Idle
            }
            "1011_0100" => {
                // Global timestamp, upper half; swallowed.
                self.state = State::GlobalTimestamp;
                ItmEvent::Idle
            }

            "0ppp_1000" => {
                // Extension packet: stimulus port page.
                self.page_register = p << 5;
                ItmEvent::Idle
            }

            "aaaa_a0ss" => {
                // Instrumentation packet.
                let target = match translate_ss(s) {
                    Some(t) => t,
                    None => {
                        self.stats.error_count += 1;
                        return ItmEvent::Error(ItmError::InvalidSourcePayload { header });
                    }
                };
                self.state = State::Software {
                    port: a + self.page_register,
                    target,
                    count: 0,
                    value: 0,
                };
                ItmEvent::Idle
            }

            "aaaa_a1ss" => {
                // Hardware source packet.
                let disc = a;
                let target = match translate_ss(s) {
                    Some(t) => t,
                    None => {
                        self.stats.error_count += 1;
                        return ItmEvent::Error(ItmError::InvalidSourcePayload { header });
                    }
                };

                if (3..=7).contains(&disc) {
                    // Reserved discriminators carry instruction-sync
                    // markers on the parts this stack supports.
                    self.state = State::NiSync {
                        kind: header,
                        target,
                        count: 0,
                        addr: 0,
                    };
                    ItmEvent::Idle
                } else if disc <= 2 || (8..=23).contains(&disc) {
                    self.state = State::Hardware {
                        disc,
                        target,
                        count: 0,
                        payload: [0; 4],
                    };
                    ItmEvent::Idle
                } else {
                    self.stats.error_count += 1;
                    ItmEvent::Error(ItmError::InvalidHeader(header))
                }
            }

            "hhhh_hhhh" => {
                self.stats.error_count += 1;
                ItmEvent::Error(ItmError::InvalidHeader(h))
            }
        }
    }

    /// Turn a completed hardware source payload into a message.
    #[bitmatch]
    fn finish_hardware(&mut self, disc: u8, len: u8, payload: &[u8; 4]) -> ItmEvent {
        let word = u32::from_le_bytes(*payload);

        match disc {
            0 if len == 1 => {
                let b = payload[0];
                ItmEvent::Packet(ItmMessage::DwtEvent {
                    cpi: b & (1 << 0) != 0,
                    exc: b & (1 << 1) != 0,
                    sleep: b & (1 << 2) != 0,
                    lsu: b & (1 << 3) != 0,
                    fold: b & (1 << 4) != 0,
                    cyc: b & (1 << 5) != 0,
                })
            }

            1 if len == 2 => {
                let number = (u16::from(payload[1] & 1) << 8) | u16::from(payload[0]);
                let event = match (payload[1] >> 4) & 0b11 {
                    0b01 => crate::msg::ExceptionEvent::Enter,
                    0b10 => crate::msg::ExceptionEvent::Exit,
                    0b11 => crate::msg::ExceptionEvent::Resume,
                    _ => {
                        self.stats.error_count += 1;
                        return ItmEvent::Error(ItmError::InvalidExceptionTrace { number });
                    }
                };
                ItmEvent::Packet(ItmMessage::Exception { number, event })
            }

            2 if len == 1 && payload[0] == 0 => ItmEvent::Packet(ItmMessage::PcSample {
                pc: 0,
                sleep: true,
            }),
            2 if len == 4 => ItmEvent::Packet(ItmMessage::PcSample {
                pc: word,
                sleep: false,
            }),

            8..=23 => {
                #[bitmatch]
                let "???t_tccd" = disc;
                match (t, d, len) {
                    // PC of a matched access.
                    (0b01, 0, 4) => ItmEvent::Packet(ItmMessage::DataAccessWp {
                        comp: c,
                        data: word,
                    }),
                    // Low halfword of the matched address.
                    (0b01, 1, 2) => ItmEvent::Packet(ItmMessage::DataOffsetWp {
                        comp: c,
                        offset: u16::from_le_bytes([payload[0], payload[1]]),
                    }),
                    // The value read or written.
                    (0b10, d, _) => ItmEvent::Packet(ItmMessage::DataRwWp {
                        comp: c,
                        is_write: d == 1,
                        data: word,
                    }),
                    _ => {
                        self.stats.error_count += 1;
                        ItmEvent::Error(ItmError::InvalidHardwarePacket { disc, len })
                    }
                }
            }

            _ => {
                self.stats.error_count += 1;
                ItmEvent::Error(ItmError::InvalidHardwarePacket { disc, len })
            }
        }
    }
}
