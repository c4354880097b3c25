//! Text rendering shared by the fan-out and cat sinks: the per-channel
//! printf-style template engine for software messages, and the CSV-ish
//! hardware-event lines.

use crate::msg::{ExceptionEvent, TimeStatus};

/// Longest record a single event may produce; longer output is truncated.
pub const MAX_EVENT_LEN: usize = 100;

/// Line terminator for rendered records.
pub const EOL: &str = "\n";

/// Reinterpret a software payload as an IEEE-754 single.
///
/// The payload arrives as a little-endian wire word and is punned
/// byte-for-byte; on a big-endian host the result matches the target's
/// float only because the word was already byte-swapped during packet
/// assembly. This is the only place the pun is allowed to live.
pub fn reinterpret_f32(value: u32) -> f32 {
    f32::from_bits(value)
}

/// Value substituted into a template.
#[derive(Clone, Copy)]
enum Arg {
    Int(u32),
    Float(f32),
}

/// Render a software message through its channel template.
///
/// Three cases, decided by substring presence, first match wins:
/// a template containing `%f` reinterprets the payload as a float; one
/// containing `%c` is applied once per payload byte (little-endian order)
/// and the applications concatenated; anything else substitutes the
/// integer payload. In every case the value is replicated across at most
/// four conversion slots, and the result is cut at [`MAX_EVENT_LEN`].
pub fn format_software(template: &str, len: u8, value: u32) -> String {
    let mut out = if template.contains("%f") {
        apply_template(template, Arg::Float(reinterpret_f32(value)))
    } else if template.contains("%c") {
        let mut s = String::new();
        for byte in value.to_le_bytes().iter().take(usize::from(len)) {
            s.push_str(&apply_template(template, Arg::Int(u32::from(*byte))));
        }
        s
    } else {
        apply_template(template, Arg::Int(value))
    };

    if out.len() > MAX_EVENT_LEN {
        let mut end = MAX_EVENT_LEN;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}

/// Substitute `arg` for each conversion specification in `template`.
///
/// The supported printf subset is `%[0][width][.precision]` followed by
/// one of `d i u x X c f`; `%%` is a literal percent and anything else is
/// copied through untouched. Conversions past the fourth produce nothing
/// (the original passed the value four times).
fn apply_template(template: &str, arg: Arg) -> String {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut slots = 0;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let zero_pad = chars.peek() == Some(&'0');
        if zero_pad {
            chars.next();
        }

        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + d as usize;
            chars.next();
        }

        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = p * 10 + d as usize;
                chars.next();
            }
            precision = Some(p);
        }

        let conv = match chars.next() {
            Some(c) => c,
            None => {
                out.push('%');
                break;
            }
        };

        slots += 1;
        if slots > 4 {
            continue;
        }

        match (conv, arg) {
            ('d', a) | ('i', a) => {
                let v = match a {
                    Arg::Int(v) => v as i32 as i64,
                    Arg::Float(f) => f as i64,
                };
                push_padded(&mut out, &v.to_string(), width, zero_pad);
            }
            ('u', a) => {
                let v = match a {
                    Arg::Int(v) => u64::from(v),
                    Arg::Float(f) => f as u64,
                };
                push_padded(&mut out, &v.to_string(), width, zero_pad);
            }
            ('x', a) | ('X', a) => {
                let v = match a {
                    Arg::Int(v) => u64::from(v),
                    Arg::Float(f) => f as u64,
                };
                let s = if conv == 'x' {
                    format!("{:x}", v)
                } else {
                    format!("{:X}", v)
                };
                push_padded(&mut out, &s, width, zero_pad);
            }
            ('c', Arg::Int(v)) => out.push((v & 0xFF) as u8 as char),
            ('c', Arg::Float(f)) => out.push((f as u32 & 0xFF) as u8 as char),
            ('f', a) => {
                let v = match a {
                    Arg::Int(v) => v as f64,
                    Arg::Float(f) => f64::from(f),
                };
                let s = format!("{:.*}", precision.unwrap_or(6), v);
                push_padded(&mut out, &s, width, zero_pad);
            }
            // Unknown conversion: reproduce it, as printf would more or
            // less do, and give the slot back.
            (other, _) => {
                slots -= 1;
                out.push('%');
                out.push(other);
            }
        }
    }

    out
}

fn push_padded(out: &mut String, s: &str, width: usize, zero_pad: bool) {
    let pad = width.saturating_sub(s.len());
    // Keep any sign ahead of zero padding.
    if zero_pad && s.starts_with('-') {
        out.push('-');
        for _ in 0..pad {
            out.push('0');
        }
        out.push_str(&s[1..]);
        return;
    }
    for _ in 0..pad {
        out.push(if zero_pad { '0' } else { ' ' });
    }
    out.push_str(s);
}

/// Numeric class codes leading each hardware-event line.
///
/// Only the exception class code is pinned by the historical output
/// format; the neighbouring classes take the adjacent values and all of
/// them are stable, documented output surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum HwEventCode {
    Ts = 15,
    Exception = 16,
    PcSample = 17,
    Dwt = 18,
    Rwwt = 19,
    Awp = 20,
    Ofs = 21,
    NiSync = 22,
}

/// Bitmask over [`HwEventCode`] classes selecting which ones render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HwEventFilter(u32);

impl HwEventFilter {
    pub fn all() -> Self {
        HwEventFilter(u32::MAX)
    }

    pub fn none() -> Self {
        HwEventFilter(0)
    }

    pub fn with(mut self, code: HwEventCode) -> Self {
        self.0 |= 1 << (code as u8 - HwEventCode::Ts as u8);
        self
    }

    pub fn contains(&self, code: HwEventCode) -> bool {
        self.0 & (1 << (code as u8 - HwEventCode::Ts as u8)) != 0
    }
}

impl Default for HwEventFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Exception names for the architectural range; externals are rendered
/// as `External,<n>`.
const EXCEPTION_NAMES: [&str; 16] = [
    "Thread",
    "Reset",
    "NMI",
    "HardFault",
    "MemManage",
    "BusFault",
    "UsageFault",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "SVCall",
    "DebugMonitor",
    "Reserved",
    "PendSV",
    "SysTick",
];

fn exception_name(number: u16) -> String {
    if usize::from(number) < EXCEPTION_NAMES.len() {
        EXCEPTION_NAMES[usize::from(number)].to_string()
    } else {
        format!("External,{}", number)
    }
}

fn event_name(event: ExceptionEvent) -> &'static str {
    match event {
        ExceptionEvent::Enter => "Enter",
        ExceptionEvent::Exit => "Exit",
        ExceptionEvent::Resume => "Resume",
    }
}

/// Renders hardware events as CSV-ish lines while keeping the
/// accumulated target timestamp and the per-event delta.
///
/// Each line is terminated with [`EOL`]; events filtered out by the
/// class mask return `None` (their side effects on the clock still
/// happen, so deltas stay correct).
pub struct HwLineBuilder {
    filter: HwEventFilter,

    /// Accumulated target timestamp, advanced by every timestamp
    /// message's increment.
    timestamp: u64,

    /// Timestamp at the previously rendered hardware event.
    last_hw_event: u64,
}

impl HwLineBuilder {
    pub fn new(filter: HwEventFilter) -> Self {
        HwLineBuilder {
            filter,
            timestamp: 0,
            last_hw_event: 0,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn delta(&mut self) -> u64 {
        let dt = self.timestamp - self.last_hw_event;
        self.last_hw_event = self.timestamp;
        dt
    }

    /// Advance the accumulated clock; renders the timestamp line.
    pub fn advance_time(&mut self, status: TimeStatus, increment: u32) -> Option<String> {
        self.timestamp += u64::from(increment);
        if !self.filter.contains(HwEventCode::Ts) {
            return None;
        }
        let status = match status {
            TimeStatus::Synced => 0,
            TimeStatus::TimestampDelayed => 1,
            TimeStatus::DataDelayed => 2,
            TimeStatus::BothDelayed => 3,
        };
        Some(format!(
            "{},{},{}{}",
            HwEventCode::Ts as u8,
            status,
            increment,
            EOL
        ))
    }

    pub fn exception(&mut self, number: u16, event: ExceptionEvent) -> Option<String> {
        if !self.filter.contains(HwEventCode::Exception) {
            return None;
        }
        Some(format!(
            "{},{},{},{}{}",
            HwEventCode::Exception as u8,
            self.delta(),
            event_name(event),
            exception_name(number),
            EOL
        ))
    }

    pub fn dwt_event(
        &mut self,
        cpi: bool,
        exc: bool,
        sleep: bool,
        lsu: bool,
        fold: bool,
        cyc: bool,
    ) -> Option<String> {
        if !self.filter.contains(HwEventCode::Dwt) {
            return None;
        }
        let mut line = format!("{},{}", HwEventCode::Dwt as u8, self.delta());
        for (set, name) in [
            (cpi, "CPI"),
            (exc, "Exc"),
            (sleep, "Sleep"),
            (lsu, "LSU"),
            (fold, "Fold"),
            (cyc, "Cyc"),
        ]
        .iter()
        {
            if *set {
                line.push(',');
                line.push_str(name);
            }
        }
        line.push_str(EOL);
        Some(line)
    }

    pub fn pc_sample(&mut self, pc: u32, sleep: bool) -> Option<String> {
        if !self.filter.contains(HwEventCode::PcSample) {
            return None;
        }
        let dt = self.delta();
        Some(if sleep {
            format!("{},{},**SLEEP**{}", HwEventCode::PcSample as u8, dt, EOL)
        } else {
            format!("{},{},0x{:08x}{}", HwEventCode::PcSample as u8, dt, pc, EOL)
        })
    }

    pub fn data_rw_wp(&mut self, comp: u8, is_write: bool, data: u32) -> Option<String> {
        if !self.filter.contains(HwEventCode::Rwwt) {
            return None;
        }
        Some(format!(
            "{},{},{},{},0x{:x}{}",
            HwEventCode::Rwwt as u8,
            self.delta(),
            comp,
            if is_write { "Write" } else { "Read" },
            data,
            EOL
        ))
    }

    pub fn data_access_wp(&mut self, comp: u8, data: u32) -> Option<String> {
        if !self.filter.contains(HwEventCode::Awp) {
            return None;
        }
        Some(format!(
            "{},{},{},0x{:08x}{}",
            HwEventCode::Awp as u8,
            self.delta(),
            comp,
            data,
            EOL
        ))
    }

    pub fn data_offset_wp(&mut self, comp: u8, offset: u16) -> Option<String> {
        if !self.filter.contains(HwEventCode::Ofs) {
            return None;
        }
        Some(format!(
            "{},{},{},0x{:04x}{}",
            HwEventCode::Ofs as u8,
            self.delta(),
            comp,
            offset,
            EOL
        ))
    }

    pub fn ni_sync(&mut self, kind: u8, addr: u32) -> Option<String> {
        if !self.filter.contains(HwEventCode::NiSync) {
            return None;
        }
        Some(format!(
            "{},{:02x},0x{:08x}{}",
            HwEventCode::NiSync as u8,
            kind,
            addr,
            EOL
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_template_broadcasts_per_byte() {
        // Three payload bytes 'A' 'B' 'C', little-endian.
        assert_eq!(format_software("%c", 3, 0x0043_4241), "ABC");
    }

    #[test]
    fn char_template_respects_length() {
        assert_eq!(format_software("%c", 1, 0x0043_4241), "A");
    }

    #[test]
    fn float_template_reinterprets_the_payload() {
        let bits = 1.5f32.to_bits();
        assert_eq!(format_software("%f", 4, bits), "1.500000");
        assert_eq!(format_software("v=%.1f", 4, bits), "v=1.5");
    }

    #[test]
    fn integer_template_replicates_the_value() {
        assert_eq!(format_software("%d %d", 4, 7), "7 7");
        assert_eq!(format_software("%d=%x", 4, 255), "255=ff");
    }

    #[test]
    fn replication_stops_after_four_slots() {
        assert_eq!(format_software("%d %d %d %d %d", 4, 1), "1 1 1 1 ");
    }

    #[test]
    fn width_and_zero_padding() {
        assert_eq!(format_software("%08x", 4, 0xBEEF), "0000beef");
        assert_eq!(format_software("%4d", 4, 7), "   7");
    }

    #[test]
    fn negative_value_keeps_sign_ahead_of_zeros() {
        assert_eq!(format_software("%05d", 4, (-42i32) as u32), "-0042");
    }

    #[test]
    fn percent_escape_and_unknown_conversions() {
        assert_eq!(format_software("100%% %q", 4, 1), "100% %q");
    }

    #[test]
    fn output_truncates_at_record_limit() {
        let s = format_software("%c", 4, 0x41414141).repeat(50);
        assert!(format_software(&s, 1, 0x41).len() <= MAX_EVENT_LEN);

        let long = "x".repeat(300);
        assert_eq!(format_software(&long, 4, 0).len(), MAX_EVENT_LEN);
    }

    #[test]
    fn exception_line_matches_the_record_format() {
        let mut hw = HwLineBuilder::new(HwEventFilter::all());
        hw.advance_time(TimeStatus::Synced, 500);
        let line = hw.exception(11, ExceptionEvent::Enter).unwrap();
        assert_eq!(line, "16,500,Enter,SVCall\n");
    }

    #[test]
    fn external_exceptions_render_numerically() {
        let mut hw = HwLineBuilder::new(HwEventFilter::all());
        let line = hw.exception(42, ExceptionEvent::Exit).unwrap();
        assert_eq!(line, "16,0,Exit,External,42\n");
    }

    #[test]
    fn deltas_measure_from_the_previous_hardware_event() {
        let mut hw = HwLineBuilder::new(HwEventFilter::all());
        hw.advance_time(TimeStatus::Synced, 100);
        assert_eq!(hw.pc_sample(0x0800_0000, false).unwrap(), "17,100,0x08000000\n");
        hw.advance_time(TimeStatus::Synced, 30);
        assert_eq!(hw.pc_sample(0, true).unwrap(), "17,30,**SLEEP**\n");
    }

    #[test]
    fn dwt_names_follow_the_set_bits() {
        let mut hw = HwLineBuilder::new(HwEventFilter::all());
        let line = hw
            .dwt_event(true, false, false, true, false, true)
            .unwrap();
        assert_eq!(line, "18,0,CPI,LSU,Cyc\n");
    }

    #[test]
    fn watchpoint_lines() {
        let mut hw = HwLineBuilder::new(HwEventFilter::all());
        assert_eq!(hw.data_rw_wp(1, true, 0xBEEF).unwrap(), "19,0,1,Write,0xbeef\n");
        assert_eq!(
            hw.data_access_wp(2, 0x0800_0010).unwrap(),
            "20,0,2,0x08000010\n"
        );
        assert_eq!(hw.data_offset_wp(3, 0x42).unwrap(), "21,0,3,0x0042\n");
        assert_eq!(
            hw.ni_sync(0x1F, 0x0800_0000).unwrap(),
            "22,1f,0x08000000\n"
        );
    }

    #[test]
    fn filtered_classes_render_nothing_but_time_still_advances() {
        let mut hw = HwLineBuilder::new(HwEventFilter::none().with(HwEventCode::Exception));
        assert!(hw.advance_time(TimeStatus::Synced, 250).is_none());
        assert!(hw.pc_sample(0, false).is_none());
        let line = hw.exception(15, ExceptionEvent::Resume).unwrap();
        assert_eq!(line, "16,250,Resume,SysTick\n");
    }
}
