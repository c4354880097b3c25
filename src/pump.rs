//! The top-level protocol pump: raw bytes in, dispatched messages out.
//!
//! Depending on configuration the pump either strips TPIU framing and
//! feeds the configured stream to the ITM decoder, or hands bytes to the
//! ITM decoder directly. TPIU sync state is coupled into the ITM pump:
//! finding frame sync means the ITM stream is byte-aligned mid-flow, and
//! losing it means the opposite.

use log::{debug, info};

use crate::itm::{ItmDecoder, ItmEvent, ItmStats};
use crate::msg::MessageSink;
use crate::tpiu::{TpiuDecoder, TpiuEvent, TpiuStats};

/// TPIU streams that never carry payload: 0 is the null/padding stream,
/// 0x7F carries trigger packets.
const NULL_STREAM: u8 = 0;
const TRIGGER_STREAM: u8 = 0x7F;

/// Pump configuration, owned by the pump and passed down from the tool's
/// command line.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Expect TPIU framing and demultiplex it.
    pub use_tpiu: bool,

    /// TPIU stream the ITM flow rides on.
    pub itm_stream: u8,

    /// Assume ITM byte alignment instead of waiting for a sync packet.
    pub force_itm_sync: bool,
}

impl Default for PumpConfig {
    fn default() -> Self {
        PumpConfig {
            use_tpiu: false,
            itm_stream: 1,
            force_itm_sync: true,
        }
    }
}

/// Configuration mistakes caught at construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TPIU enabled with the null stream id 0")]
    TpiuStreamZero,
}

/// Byte pump over the whole decode stack.
pub struct TracePump {
    config: PumpConfig,
    tpiu: TpiuDecoder,
    itm: ItmDecoder,
}

impl TracePump {
    pub fn new(config: PumpConfig) -> Result<Self, ConfigError> {
        if config.use_tpiu && config.itm_stream == NULL_STREAM {
            return Err(ConfigError::TpiuStreamZero);
        }

        let mut itm = ItmDecoder::new();
        if config.force_itm_sync && !config.use_tpiu {
            // No framing layer to tell us when alignment appears; take
            // the stream as aligned from the first byte.
            itm.force_sync(true);
        }

        Ok(TracePump {
            config,
            tpiu: TpiuDecoder::new(),
            itm,
        })
    }

    pub fn tpiu_stats(&self) -> &TpiuStats {
        self.tpiu.stats()
    }

    pub fn itm_stats(&self) -> &ItmStats {
        self.itm.stats()
    }

    /// Feed one byte through the stack, dispatching any completed
    /// messages into `sink`.
    pub fn pump<S: MessageSink>(&mut self, byte: u8, sink: &mut S) {
        if !self.config.use_tpiu {
            self.itm_byte(byte, sink);
            return;
        }

        match self.tpiu.pump(byte) {
            TpiuEvent::NewSync | TpiuEvent::Synced => {
                if self.config.force_itm_sync {
                    self.itm.force_sync(true);
                }
            }
            TpiuEvent::Unsynced => {
                debug!("TPIU frame sync lost");
                self.itm.force_sync(false);
            }
            TpiuEvent::FrameReady => {
                if let Some(packet) = self.tpiu.get_packet() {
                    for pair in packet.pairs {
                        if pair.stream == self.config.itm_stream {
                            self.itm_byte(pair.data, sink);
                        } else if pair.stream != NULL_STREAM && pair.stream != TRIGGER_STREAM {
                            info!("dropping byte for unhandled TPIU stream {}", pair.stream);
                        }
                    }
                }
            }
            TpiuEvent::Idle | TpiuEvent::Rxing => {}
            TpiuEvent::Error => debug!("TPIU decode error"),
        }
    }

    /// Feed a block of bytes.
    pub fn pump_block<S: MessageSink>(&mut self, bytes: &[u8], sink: &mut S) {
        for byte in bytes {
            self.pump(*byte, sink);
        }
    }

    fn itm_byte<S: MessageSink>(&mut self, byte: u8, sink: &mut S) {
        match self.itm.pump(byte) {
            ItmEvent::Packet(msg) => sink.dispatch(&msg),
            // Overflow and decode errors are recoverable: counters have
            // already been bumped, established sync is kept.
            ItmEvent::Overflow => debug!("ITM overflow reported by target"),
            ItmEvent::Error(e) => debug!("ITM decode error: {}", e),
            ItmEvent::Idle | ItmEvent::Unsynced | ItmEvent::Synced => {}
        }
    }
}
