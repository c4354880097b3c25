//! The cat-style sink: every decoded event becomes at most one text
//! record on a single output stream.
//!
//! Hardware events render as the CSV-ish lines described in
//! [`crate::render`], gated by a class mask; software channels go
//! through the same three-way template logic the fan-out uses. Channels
//! without a template stay silent here; raw payload bytes have no
//! place in a line-oriented stream.

use std::io::Write;

use log::debug;

use crate::msg::{ExceptionEvent, MessageSink, TimeStatus};
use crate::render::{self, HwEventFilter, HwLineBuilder};

/// Software channels addressable from the command line.
pub const NUM_CHANNELS: usize = 32;

/// Message formatter over one output stream.
pub struct CatSink<W: Write> {
    out: W,
    templates: Vec<Option<String>>,
    hw: HwLineBuilder,
}

impl<W: Write> CatSink<W> {
    pub fn new(out: W, hw_filter: HwEventFilter) -> Self {
        let mut templates = Vec::with_capacity(NUM_CHANNELS);
        templates.resize_with(NUM_CHANNELS, || None);
        CatSink {
            out,
            templates,
            hw: HwLineBuilder::new(hw_filter),
        }
    }

    /// Install the format template for a software channel.
    pub fn set_template(&mut self, ch: usize, template: &str) -> bool {
        match self.templates.get_mut(ch) {
            Some(slot) => {
                *slot = Some(template.to_string());
                true
            }
            None => false,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    /// Failures to write are drops, not errors: the decode loop above
    /// must not stall on a slow or closed output.
    fn emit(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            debug!("output dropped a record: {}", e);
        }
    }

    fn emit_hw(&mut self, line: Option<String>) {
        if let Some(line) = line {
            self.emit(&line);
        }
    }
}

impl<W: Write> MessageSink for CatSink<W> {
    fn software(&mut self, port: u8, len: u8, value: u32) {
        let record = match self.templates.get(usize::from(port)) {
            Some(Some(template)) => render::format_software(template, len, value),
            _ => return,
        };
        self.emit(&record);
    }

    fn pc_sample(&mut self, pc: u32, sleep: bool) {
        let line = self.hw.pc_sample(pc, sleep);
        self.emit_hw(line);
    }

    fn exception(&mut self, number: u16, event: ExceptionEvent) {
        let line = self.hw.exception(number, event);
        self.emit_hw(line);
    }

    fn dwt_event(&mut self, cpi: bool, exc: bool, sleep: bool, lsu: bool, fold: bool, cyc: bool) {
        let line = self.hw.dwt_event(cpi, exc, sleep, lsu, fold, cyc);
        self.emit_hw(line);
    }

    fn data_rw_wp(&mut self, comp: u8, is_write: bool, data: u32) {
        let line = self.hw.data_rw_wp(comp, is_write, data);
        self.emit_hw(line);
    }

    fn data_access_wp(&mut self, comp: u8, data: u32) {
        let line = self.hw.data_access_wp(comp, data);
        self.emit_hw(line);
    }

    fn data_offset_wp(&mut self, comp: u8, offset: u16) {
        let line = self.hw.data_offset_wp(comp, offset);
        self.emit_hw(line);
    }

    fn ni_sync(&mut self, kind: u8, addr: u32) {
        let line = self.hw.ni_sync(kind, addr);
        self.emit_hw(line);
    }

    fn timestamp(&mut self, status: TimeStatus, increment: u32) {
        let line = self.hw.advance_time(status, increment);
        self.emit_hw(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::ItmMessage;
    use crate::render::HwEventCode;

    fn output(sink: CatSink<Vec<u8>>) -> String {
        String::from_utf8(sink.out).unwrap()
    }

    #[test]
    fn exception_record() {
        let mut sink = CatSink::new(Vec::new(), HwEventFilter::all());
        sink.dispatch(&ItmMessage::Timestamp {
            status: TimeStatus::Synced,
            increment: 500,
        });
        sink.dispatch(&ItmMessage::Exception {
            number: 11,
            event: ExceptionEvent::Enter,
        });

        assert!(output(sink).ends_with("16,500,Enter,SVCall\n"));
    }

    #[test]
    fn templated_software_channel() {
        let mut sink = CatSink::new(Vec::new(), HwEventFilter::none());
        sink.set_template(2, "%c");
        sink.dispatch(&ItmMessage::Software {
            port: 2,
            len: 3,
            value: 0x0043_4241,
        });

        assert_eq!(output(sink), "ABC");
    }

    #[test]
    fn channels_without_templates_stay_silent() {
        let mut sink = CatSink::new(Vec::new(), HwEventFilter::none());
        sink.dispatch(&ItmMessage::Software {
            port: 2,
            len: 4,
            value: 0xDEAD_BEEF,
        });

        assert!(output(sink).is_empty());
    }

    #[test]
    fn class_mask_selects_hardware_events() {
        let mut sink = CatSink::new(
            Vec::new(),
            HwEventFilter::none().with(HwEventCode::PcSample),
        );
        sink.dispatch(&ItmMessage::Exception {
            number: 3,
            event: ExceptionEvent::Enter,
        });
        sink.dispatch(&ItmMessage::PcSample {
            pc: 0x0800_0000,
            sleep: false,
        });

        assert_eq!(output(sink), "17,0,0x08000000\n");
    }

    #[test]
    fn out_of_range_template_slots_are_refused() {
        let mut sink = CatSink::new(Vec::new(), HwEventFilter::none());
        assert!(!sink.set_template(32, "%d"));
        assert!(sink.set_template(31, "%d"));
    }
}
