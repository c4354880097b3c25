//! Per-channel fan-out: one worker per configured software channel plus
//! one for hardware events, each draining a bounded internal pipe into a
//! named pipe (or a regular file in permafile mode) on disk.
//!
//! The producer side is the decoder pump. It never blocks: outside
//! permafile mode records are pushed with `try_send` and silently dropped
//! when the pipe is full or the worker is gone. Within a channel, records
//! that do arrive keep their order; across channels there is no ordering
//! guarantee.
//!
//! Workers park in `recv_timeout` and check a stop flag between blocking
//! calls, so shutdown needs no signals: dropping the producer ends the
//! pipe, the flag covers a worker stuck waiting for a FIFO reader.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::msg::{ExceptionEvent, MessageSink, TimeStatus};
use crate::render::{self, HwEventFilter, HwLineBuilder};

/// Software stimulus channels routed to their own outputs.
pub const NUM_CHANNELS: usize = 32;

/// Index of the hardware-event channel, one past the software ones.
pub const HW_CHANNEL: usize = NUM_CHANNELS;

/// Fixed output filename for the hardware-event channel.
pub const HW_CHANNEL_NAME: &str = "hwevent";

/// How often a parked worker wakes to look at its stop flag.
const DRAIN_TICK: Duration = Duration::from_millis(100);

/// Backoff while waiting for a FIFO reader to attach.
const OPEN_RETRY: Duration = Duration::from_millis(10);

/// Errors surfaced while configuring the channel table. Worker-side I/O
/// never reaches the producer; it is logged and the record dropped.
#[derive(Debug, thiserror::Error)]
pub enum FifoError {
    #[error("channel {0} is out of range (0..={})", NUM_CHANNELS - 1)]
    BadChannel(usize),

    #[error("channel {0} is already configured")]
    DuplicateChannel(usize),

    #[error("channel name may not be empty")]
    EmptyName,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Fan-out configuration, owned by the [`FifoSet`].
#[derive(Debug, Clone)]
pub struct FifoConfig {
    /// Directory the per-channel outputs are created in.
    pub dir: PathBuf,

    /// Write regular truncate-on-open files instead of named pipes, and
    /// never drop records.
    pub permafile: bool,

    /// Hardware-event classes forwarded to the hardware channel.
    pub hw_filter: HwEventFilter,

    /// Records buffered per channel before the producer starts dropping.
    pub pipe_depth: usize,
}

impl FifoConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FifoConfig {
            dir: dir.into(),
            permafile: false,
            hw_filter: HwEventFilter::all(),
            pipe_depth: 1024,
        }
    }
}

struct Channel {
    name: String,
    format: Option<String>,
    tx: Option<SyncSender<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

/// The channel table and its message-sink face.
///
/// Construction spawns the hardware-event worker; software channels are
/// added one by one with [`FifoSet::add_channel`]. Dropping the set (or
/// calling [`FifoSet::shutdown`]) stops every worker and removes the
/// FIFOs they created.
pub struct FifoSet {
    config: FifoConfig,
    channels: Vec<Option<Channel>>,
    hw: HwLineBuilder,
}

impl FifoSet {
    pub fn new(config: FifoConfig) -> Result<Self, FifoError> {
        let mut channels: Vec<Option<Channel>> = Vec::with_capacity(NUM_CHANNELS + 1);
        channels.resize_with(NUM_CHANNELS + 1, || None);

        let hw_filter = config.hw_filter;
        let mut set = FifoSet {
            config,
            channels,
            hw: HwLineBuilder::new(hw_filter),
        };
        set.channels[HW_CHANNEL] = Some(set.spawn_channel(HW_CHANNEL_NAME, None)?);
        Ok(set)
    }

    /// Install a software channel. `format` is the printf-style template
    /// applied to each message; without one the raw payload bytes pass
    /// through.
    pub fn add_channel(
        &mut self,
        ch: usize,
        name: &str,
        format: Option<&str>,
    ) -> Result<(), FifoError> {
        if ch >= NUM_CHANNELS {
            return Err(FifoError::BadChannel(ch));
        }
        if name.is_empty() {
            return Err(FifoError::EmptyName);
        }
        if self.channels[ch].is_some() {
            return Err(FifoError::DuplicateChannel(ch));
        }

        self.channels[ch] = Some(self.spawn_channel(name, format)?);
        Ok(())
    }

    /// The format template configured for a channel, if any.
    pub fn channel_format(&self, ch: usize) -> Option<&str> {
        self.channels
            .get(ch)?
            .as_ref()?
            .format
            .as_deref()
    }

    /// The name configured for a channel, if any.
    pub fn channel_name(&self, ch: usize) -> Option<&str> {
        Some(self.channels.get(ch)?.as_ref()?.name.as_str())
    }

    /// Filesystem path of a channel's output.
    pub fn channel_path(&self, ch: usize) -> Option<PathBuf> {
        Some(self.config.dir.join(&self.channels.get(ch)?.as_ref()?.name))
    }

    fn spawn_channel(&self, name: &str, format: Option<&str>) -> Result<Channel, FifoError> {
        let path = self.config.dir.join(name);
        let permafile = self.config.permafile;
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(self.config.pipe_depth);

        let worker = {
            let stop = Arc::clone(&stop);
            let label = name.to_string();
            thread::Builder::new()
                .name(format!("fifo-{}", name))
                .spawn(move || {
                    if let Err(e) = worker_loop(rx, &path, permafile, &stop) {
                        warn!("channel {} worker failed: {}", label, e);
                    }
                })?
        };

        Ok(Channel {
            name: name.to_string(),
            format: format.map(str::to_string),
            tx: Some(tx),
            stop,
            worker: Some(worker),
        })
    }

    /// Hand a record to a channel's worker. Lossy outside permafile
    /// mode: a full pipe or a dead worker swallows the record.
    fn send(&mut self, ch: usize, record: Vec<u8>) {
        let permafile = self.config.permafile;
        let tx = match self.channels[ch].as_ref().and_then(|c| c.tx.as_ref()) {
            Some(tx) => tx,
            None => return,
        };

        if permafile {
            let _ = tx.send(record);
        } else {
            match tx.try_send(record) {
                Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    fn send_hw(&mut self, line: Option<String>) {
        if let Some(line) = line {
            self.send(HW_CHANNEL, line.into_bytes());
        }
    }

    /// Stop every worker and wait for them to unlink their FIFOs.
    pub fn shutdown(&mut self) {
        for slot in self.channels.iter_mut() {
            if let Some(ch) = slot.as_mut() {
                ch.stop.store(true, Ordering::Relaxed);
                ch.tx.take();
            }
        }
        for slot in self.channels.iter_mut() {
            if let Some(ch) = slot.as_mut() {
                if let Some(worker) = ch.worker.take() {
                    let _ = worker.join();
                }
            }
        }
    }
}

impl Drop for FifoSet {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MessageSink for FifoSet {
    fn software(&mut self, port: u8, len: u8, value: u32) {
        let ch = usize::from(port);
        if ch >= NUM_CHANNELS || self.channels[ch].is_none() {
            return;
        }

        let record = match self.channel_format(ch) {
            Some(template) => render::format_software(template, len, value).into_bytes(),
            None => value.to_le_bytes()[..usize::from(len).min(4)].to_vec(),
        };
        self.send(ch, record);
    }

    fn pc_sample(&mut self, pc: u32, sleep: bool) {
        let line = self.hw.pc_sample(pc, sleep);
        self.send_hw(line);
    }

    fn exception(&mut self, number: u16, event: ExceptionEvent) {
        let line = self.hw.exception(number, event);
        self.send_hw(line);
    }

    fn dwt_event(&mut self, cpi: bool, exc: bool, sleep: bool, lsu: bool, fold: bool, cyc: bool) {
        let line = self.hw.dwt_event(cpi, exc, sleep, lsu, fold, cyc);
        self.send_hw(line);
    }

    fn data_rw_wp(&mut self, comp: u8, is_write: bool, data: u32) {
        let line = self.hw.data_rw_wp(comp, is_write, data);
        self.send_hw(line);
    }

    fn data_access_wp(&mut self, comp: u8, data: u32) {
        let line = self.hw.data_access_wp(comp, data);
        self.send_hw(line);
    }

    fn data_offset_wp(&mut self, comp: u8, offset: u16) {
        let line = self.hw.data_offset_wp(comp, offset);
        self.send_hw(line);
    }

    fn ni_sync(&mut self, kind: u8, addr: u32) {
        let line = self.hw.ni_sync(kind, addr);
        self.send_hw(line);
    }

    fn timestamp(&mut self, status: TimeStatus, increment: u32) {
        let line = self.hw.advance_time(status, increment);
        self.send_hw(line);
    }
}

/// Drain one channel's pipe into its output until the producer hangs up
/// or the stop flag is raised.
fn worker_loop(
    rx: Receiver<Vec<u8>>,
    path: &Path,
    permafile: bool,
    stop: &AtomicBool,
) -> io::Result<()> {
    let mut out: Option<File> = if permafile {
        Some(File::create(path)?)
    } else {
        // Anything already at the path is stale.
        let _ = fs::remove_file(path);
        create_fifo(path)?;
        None
    };

    debug!("channel worker for {} running", path.display());

    'records: loop {
        let record = match rx.recv_timeout(DRAIN_TICK) {
            Ok(record) => record,
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        loop {
            if out.is_none() {
                match wait_for_reader(path, stop) {
                    Some(file) => out = Some(file),
                    // Told to stop while no reader was attached.
                    None => break 'records,
                }
            }
            let file = match out.as_mut() {
                Some(file) => file,
                None => unreachable!(),
            };

            match file.write_all(&record).and_then(|_| file.flush()) {
                Ok(()) => continue 'records,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    // Reader went away; drop the record, wait for the
                    // next reader.
                    debug!("reader left {}", path.display());
                    out = None;
                    continue 'records;
                }
                Err(e) => return Err(e),
            }
        }
    }

    if !permafile {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

/// Repeatedly try to open the FIFO for writing until a reader attaches.
/// Returns `None` if the stop flag is raised first.
fn wait_for_reader(path: &Path, stop: &AtomicBool) -> Option<File> {
    loop {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        match open_fifo_writer(path) {
            Ok(Some(file)) => return Some(file),
            Ok(None) => thread::sleep(OPEN_RETRY),
            Err(e) => {
                warn!("cannot open {}: {}", path.display(), e);
                thread::sleep(OPEN_RETRY);
            }
        }
    }
}

#[cfg(unix)]
fn create_fifo(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;

    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o640))
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

/// Open the FIFO write-only without blocking for a reader: `Ok(None)`
/// when none is attached yet. The descriptor is switched back to
/// blocking so writes see reader backpressure.
#[cfg(unix)]
fn open_fifo_writer(path: &Path) -> io::Result<Option<File>> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    match fs::OpenOptions::new()
        .write(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path)
    {
        Ok(file) => {
            fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::empty()))
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            Ok(Some(file))
        }
        Err(e) if e.raw_os_error() == Some(nix::libc::ENXIO) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn create_fifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes need a unix host; use permafile mode",
    ))
}

#[cfg(not(unix))]
fn open_fifo_writer(_path: &Path) -> io::Result<Option<File>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named pipes need a unix host; use permafile mode",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::ItmMessage;

    fn permafile_set(dir: &Path) -> FifoSet {
        let mut config = FifoConfig::new(dir);
        config.permafile = true;
        FifoSet::new(config).unwrap()
    }

    fn read_settled(path: &Path) -> Vec<u8> {
        fs::read(path).unwrap_or_default()
    }

    #[test]
    fn char_template_lands_in_the_channel_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = permafile_set(dir.path());
        set.add_channel(3, "text", Some("%c")).unwrap();

        set.dispatch(&ItmMessage::Software {
            port: 3,
            len: 3,
            value: 0x0043_4241,
        });
        let path = set.channel_path(3).unwrap();
        set.shutdown();

        assert_eq!(read_settled(&path), b"ABC");
    }

    #[test]
    fn raw_mode_passes_payload_bytes_through_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = permafile_set(dir.path());
        set.add_channel(0, "raw", None).unwrap();

        set.dispatch(&ItmMessage::Software {
            port: 0,
            len: 4,
            value: 0x4433_2211,
        });
        set.dispatch(&ItmMessage::Software {
            port: 0,
            len: 2,
            value: 0x6655,
        });
        let path = set.channel_path(0).unwrap();
        set.shutdown();

        assert_eq!(read_settled(&path), &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    }

    #[test]
    fn hardware_channel_gets_formatted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = permafile_set(dir.path());

        set.dispatch(&ItmMessage::Timestamp {
            status: TimeStatus::Synced,
            increment: 500,
        });
        set.dispatch(&ItmMessage::Exception {
            number: 11,
            event: ExceptionEvent::Enter,
        });
        let path = set.channel_path(HW_CHANNEL).unwrap();
        set.shutdown();

        let text = String::from_utf8(read_settled(&path)).unwrap();
        assert!(text.ends_with("16,500,Enter,SVCall\n"));
    }

    #[test]
    fn unconfigured_channels_swallow_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = permafile_set(dir.path());
        // Channel 5 was never added; nothing should blow up.
        set.dispatch(&ItmMessage::Software {
            port: 5,
            len: 1,
            value: 0x41,
        });
    }

    #[test]
    fn channel_format_returns_the_template_not_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = permafile_set(dir.path());
        set.add_channel(1, "counts", Some("n=%d")).unwrap();

        assert_eq!(set.channel_format(1), Some("n=%d"));
        assert_eq!(set.channel_name(1), Some("counts"));
        assert_eq!(set.channel_format(2), None);
    }

    #[test]
    fn configuration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = permafile_set(dir.path());

        assert!(matches!(
            set.add_channel(32, "oops", None),
            Err(FifoError::BadChannel(32))
        ));
        assert!(matches!(
            set.add_channel(0, "", None),
            Err(FifoError::EmptyName)
        ));
        set.add_channel(0, "one", None).unwrap();
        assert!(matches!(
            set.add_channel(0, "two", None),
            Err(FifoError::DuplicateChannel(0))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn fifo_round_trip_preserves_byte_order() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let mut set = FifoSet::new(FifoConfig::new(dir.path())).unwrap();
        set.add_channel(0, "pipe", None).unwrap();
        let path = set.channel_path(0).unwrap();

        // The worker creates the FIFO asynchronously.
        while !path.exists() {
            thread::sleep(Duration::from_millis(1));
        }

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8];
            File::open(&path).unwrap().read_exact(&mut buf).unwrap();
            buf
        });

        for value in [0x0403_0201u32, 0x0807_0605].iter() {
            set.dispatch(&ItmMessage::Software {
                port: 0,
                len: 4,
                value: *value,
            });
        }

        // Join before shutdown: delivery is only guaranteed while the
        // producer is alive (shutdown may drop what is still queued).
        let got = reader.join().unwrap();
        set.shutdown();

        assert_eq!(got, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_unlinks_the_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = FifoSet::new(FifoConfig::new(dir.path())).unwrap();
        set.add_channel(0, "gone", None).unwrap();
        let path = set.channel_path(0).unwrap();

        while !path.exists() {
            thread::sleep(Duration::from_millis(1));
        }
        set.shutdown();
        assert!(!path.exists());
    }
}
