//! # `swotrace`
//!
//! A decoder stack for real-time trace streams emitted by ARM Cortex-M
//! microcontrollers, plus the machinery that fans decoded events out to
//! consumers.
//!
//! Two wire protocols are handled in layers. The TPIU framing layer
//! multiplexes trace streams onto one byte channel in 16-byte frames;
//! [`tpiu`] demultiplexes them. The ITM/DWT layer carries
//! software-emitted values, PC samples, exception and watchpoint events
//! and timestamps; [`itm`] turns its bytes into [`msg::ItmMessage`]s.
//! [`pump::TracePump`] stacks the two (or runs ITM bare) and dispatches
//! every decoded message into a [`msg::MessageSink`].
//!
//! Two sinks ship: [`fifo::FifoSet`] fans messages out to per-channel
//! named pipes or files through worker threads, and [`cat::CatSink`]
//! renders everything as text records on one stream.
//!
//! For postmortem work, [`ring::Postmortem`] captures raw ETM bytes in a
//! wrap-aware ring buffer and replays them into an [`etm::EtmPump`] once
//! the stream goes quiet; [`reconstruct::Reconstructor`] then rebuilds
//! an instruction-level narrative against a [`reconstruct::SymbolOracle`].
//!
//! The decoders are byte pumps: feed one byte, get an event back. They
//! never fail their callers; framing problems surface as events and
//! counters, and processing continues.

pub mod cat;
pub mod etm;
pub mod fifo;
pub mod itm;
pub mod msg;
pub mod pump;
pub mod reconstruct;
pub mod render;
pub mod ring;
pub mod source;
pub mod tpiu;

pub use cat::CatSink;
pub use etm::{EtmChange, EtmDecoder, EtmPump};
pub use fifo::{FifoConfig, FifoSet};
pub use itm::{ItmDecoder, ItmEvent};
pub use msg::{ItmMessage, MessageSink};
pub use pump::{PumpConfig, TracePump};
pub use render::{HwEventCode, HwEventFilter};
pub use ring::{Postmortem, RingBuffer, WrapMode};
pub use tpiu::{TpiuDecoder, TpiuEvent, TpiuPacket};
