//! Decoded ITM/DWT messages and the sink seam they are dispatched through.
//!
//! The wire protocol is decoded by [`crate::itm::ItmDecoder`]; everything
//! downstream of it (fan-out, formatting) consumes the [`ItmMessage`] sum
//! type defined here through the [`MessageSink`] trait.

/// Relationship between a local timestamp and the data it accompanies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimeStatus {
    /// Timestamp is synchronous to the associated data.
    Synced,

    /// The timestamp was emitted late relative to the data.
    TimestampDelayed,

    /// The data was emitted late relative to the event it reports.
    DataDelayed,

    /// Both of the above.
    BothDelayed,
}

/// What the processor did with an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExceptionEvent {
    Enter,
    Exit,
    Resume,
}

/// One decoded message from the ITM/DWT flow.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ItmMessage {
    /// A value written by software to a stimulus port.
    Software {
        /// Stimulus port (0..=31 on page 0; higher pages offset by 32).
        port: u8,

        /// Number of payload bytes written (1, 2 or 4).
        len: u8,

        /// The payload, assembled little-endian.
        value: u32,
    },

    /// Periodic program-counter sample.
    PcSample {
        /// Sampled PC. Zero (and meaningless) when `sleep` is set.
        pc: u32,

        /// The core was sleeping when the sample was taken.
        sleep: bool,
    },

    /// The processor entered, left or resumed an exception handler.
    Exception {
        /// Exception number (9 bits; >= 16 are external interrupts).
        number: u16,
        event: ExceptionEvent,
    },

    /// One or more DWT event counters wrapped.
    DwtEvent {
        cpi: bool,
        exc: bool,
        sleep: bool,
        lsu: bool,
        fold: bool,
        cyc: bool,
    },

    /// A DWT comparator matched on a data access; reports the value moved.
    DataRwWp { comp: u8, is_write: bool, data: u32 },

    /// A DWT comparator matched; reports the PC of the access.
    DataAccessWp { comp: u8, data: u32 },

    /// A DWT comparator matched; reports the low half of the address.
    DataOffsetWp { comp: u8, offset: u16 },

    /// Instruction-sync marker carrying a commanded address.
    NiSync { kind: u8, addr: u32 },

    /// Local timestamp: the target clock advanced by `increment` ticks.
    Timestamp {
        status: TimeStatus,
        increment: u32,
    },
}

/// Consumer of decoded messages.
///
/// One method per message variant, each a no-op unless overridden, so a
/// sink only spells out the classes it cares about; unknown or unwanted
/// messages are silently discarded. [`MessageSink::dispatch`] is the
/// routing step and should not normally be overridden.
pub trait MessageSink {
    fn software(&mut self, _port: u8, _len: u8, _value: u32) {}

    fn pc_sample(&mut self, _pc: u32, _sleep: bool) {}

    fn exception(&mut self, _number: u16, _event: ExceptionEvent) {}

    #[allow(clippy::too_many_arguments)]
    fn dwt_event(
        &mut self,
        _cpi: bool,
        _exc: bool,
        _sleep: bool,
        _lsu: bool,
        _fold: bool,
        _cyc: bool,
    ) {
    }

    fn data_rw_wp(&mut self, _comp: u8, _is_write: bool, _data: u32) {}

    fn data_access_wp(&mut self, _comp: u8, _data: u32) {}

    fn data_offset_wp(&mut self, _comp: u8, _offset: u16) {}

    fn ni_sync(&mut self, _kind: u8, _addr: u32) {}

    fn timestamp(&mut self, _status: TimeStatus, _increment: u32) {}

    /// Route one message to its handler.
    fn dispatch(&mut self, msg: &ItmMessage) {
        match *msg {
            ItmMessage::Software { port, len, value } => self.software(port, len, value),
            ItmMessage::PcSample { pc, sleep } => self.pc_sample(pc, sleep),
            ItmMessage::Exception { number, event } => self.exception(number, event),
            ItmMessage::DwtEvent {
                cpi,
                exc,
                sleep,
                lsu,
                fold,
                cyc,
            } => self.dwt_event(cpi, exc, sleep, lsu, fold, cyc),
            ItmMessage::DataRwWp {
                comp,
                is_write,
                data,
            } => self.data_rw_wp(comp, is_write, data),
            ItmMessage::DataAccessWp { comp, data } => self.data_access_wp(comp, data),
            ItmMessage::DataOffsetWp { comp, offset } => self.data_offset_wp(comp, offset),
            ItmMessage::NiSync { kind, addr } => self.ni_sync(kind, addr),
            ItmMessage::Timestamp { status, increment } => self.timestamp(status, increment),
        }
    }
}
