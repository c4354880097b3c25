use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use structopt::StructOpt;

use swotrace::etm::EtmDecoder;
use swotrace::reconstruct::{InstrWidth, Instruction, LineKind, Reconstructor, SymbolOracle};
use swotrace::ring::{Postmortem, WrapMode};
use swotrace::source::{parse_server, ByteSource, Endpoint, RETRY_BACKOFF, TRANSFER_SIZE};
use swotrace::tpiu::{TpiuDecoder, TpiuEvent};

/// Wakeup cadence while the wire is quiet.
const TICK_TIME: Duration = Duration::from_millis(100);

/// How often capture statistics go to the log.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Postmortem monitor: captures ETM program-flow trace into a \
             ring buffer and, when the stream goes quiet, replays it as an \
             instruction-level narrative against a symbol map."
)]
struct Opt {
    /// Server to collect trace from, as host[:port]
    #[structopt(short = "s", long = "server", default_value = "localhost")]
    server: String,

    /// Read from a capture file instead of a server
    #[structopt(short = "f", long = "file", parse(from_os_str))]
    file: Option<PathBuf>,

    /// Terminate when the source ends instead of waiting for more
    #[structopt(short = "e", long = "eof-terminate")]
    end_terminate: bool,

    /// Postmortem buffer length, in KiB
    #[structopt(short = "b", long = "buflen", default_value = "32")]
    buflen_kb: usize,

    /// Expect TPIU framing; take ETM bytes from this stream
    #[structopt(short = "t", long = "tpiu", name = "stream")]
    tpiu_stream: Option<u8>,

    /// Stop capturing when the buffer fills instead of wrapping
    #[structopt(short = "x", long = "single-shot")]
    single_shot: bool,

    /// Symbol map: lines of `addr width file function line target|- assembly`
    #[structopt(short = "m", long = "map", parse(from_os_str))]
    map: Option<PathBuf>,

    /// Verbosity: 0 errors, 1 warnings, 2 info, 3 debug
    #[structopt(short = "v", long = "verbose", default_value = "1")]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:5} {}",
                chrono::Utc::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .filter_level(level)
        .init();
}

/// Address lookup backed by a plain symbol-map file, one instruction per
/// line: `addr width file function line target|- assembly...`.
#[derive(Default)]
struct MapOracle {
    instructions: HashMap<u32, Instruction>,
}

impl MapOracle {
    fn load(path: &PathBuf) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read symbol map {}", path.display()))?;

        let mut instructions = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parsed = (|| -> Option<(u32, Instruction)> {
                let mut fields = line.split_whitespace();
                let addr = parse_hex(fields.next()?)?;
                let width = match fields.next()? {
                    "2" => InstrWidth::Halfword,
                    "4" => InstrWidth::Word,
                    _ => return None,
                };
                let file = fields.next()?.to_string();
                let function = fields.next()?.to_string();
                let line_no = fields.next()?.parse().ok()?;
                let jump_target = match fields.next()? {
                    "-" => None,
                    t => Some(parse_hex(t)?),
                };
                let assembly = fields.collect::<Vec<_>>().join(" ");
                Some((
                    addr,
                    Instruction {
                        file,
                        function,
                        line: line_no,
                        assembly,
                        width,
                        jump_target,
                    },
                ))
            })();

            match parsed {
                Some((addr, instr)) => {
                    instructions.insert(addr, instr);
                }
                None => warn!("symbol map line {} is malformed, skipped", lineno + 1),
            }
        }

        Ok(MapOracle { instructions })
    }
}

fn parse_hex(s: &str) -> Option<u32> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

impl SymbolOracle for MapOracle {
    fn instruction_at(&self, addr: u32) -> Option<Instruction> {
        self.instructions.get(&addr).cloned()
    }
}

/// Strips TPIU framing from the capture stream, keeping one stream's
/// bytes, when framing is in use at all.
struct EtmTap {
    tpiu: Option<(TpiuDecoder, u8)>,
}

impl EtmTap {
    fn extract(&mut self, block: &[u8], out: &mut Vec<u8>) {
        match self.tpiu.as_mut() {
            None => out.extend_from_slice(block),
            Some((decoder, stream)) => {
                for byte in block {
                    if decoder.pump(*byte) == TpiuEvent::FrameReady {
                        if let Some(packet) = decoder.get_packet() {
                            out.extend(
                                packet
                                    .pairs
                                    .iter()
                                    .filter(|p| p.stream == *stream)
                                    .map(|p| p.data),
                            );
                        }
                    }
                }
            }
        }
    }
}

fn print_lines(recon: &Reconstructor<MapOracle>) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in recon.lines() {
        let _ = match line.kind {
            LineKind::File => writeln!(out, "== {}", line.text),
            LineKind::Source => writeln!(out, "{}", line.text),
            LineKind::Assembly => writeln!(out, "        {}", line.text),
            LineKind::NotExecAssembly => writeln!(out, "      ! {}", line.text),
            LineKind::Event => writeln!(out, "* {}", line.text),
            LineKind::Debug => writeln!(out, "? {}", line.text),
        };
    }
    let _ = out.flush();
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    init_logging(opt.verbose);

    if opt.buflen_kb == 0 {
        anyhow::bail!("postmortem buffer length must be at least 1 KiB");
    }
    let buflen = opt.buflen_kb * 1024;
    let mode = if opt.single_shot {
        WrapMode::SingleShot
    } else {
        WrapMode::Continuous
    };
    let mut pm = Postmortem::new(buflen, mode).context("bad buffer length")?;

    let oracle = match &opt.map {
        Some(path) => MapOracle::load(path)?,
        None => MapOracle::default(),
    };
    let mut etm = EtmDecoder::new();
    let mut recon = Reconstructor::new(oracle);
    let mut tap = EtmTap {
        tpiu: opt.tpiu_stream.map(|stream| (TpiuDecoder::new(), stream)),
    };

    let endpoint = match &opt.file {
        Some(path) => Endpoint::File(path.clone()),
        None => parse_server(&opt.server),
    };
    let source = ByteSource::new(endpoint, opt.end_terminate);

    let mut buf = [0u8; TRANSFER_SIZE];
    let mut etm_bytes = Vec::with_capacity(TRANSFER_SIZE);
    let mut total_bytes: u64 = 0;
    let mut last_stats = Instant::now();
    let mut first_attempt = true;

    'session: loop {
        let mut stream = match source.open() {
            Ok(stream) => {
                first_attempt = false;
                stream
            }
            Err(e) if first_attempt => {
                return Err(e).context("cannot open trace source");
            }
            Err(e) => {
                warn!("trace source unavailable: {}", e);
                std::thread::sleep(RETRY_BACKOFF);
                continue;
            }
        };
        stream
            .set_read_timeout(Some(TICK_TIME))
            .context("cannot configure source")?;

        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total_bytes += n as u64;
                    etm_bytes.clear();
                    tap.extract(&buf[..n], &mut etm_bytes);
                    pm.write(&etm_bytes);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("trace source failed: {}", e);
                    break;
                }
            }

            let now = Instant::now();
            if pm.should_replay(now) {
                debug!("stream quiet, replaying {} bytes", pm.ring().available());
                recon.clear();
                pm.replay(&mut etm, |change| recon.apply(change));
                print_lines(&recon);
            }

            if now.duration_since(last_stats) >= STATS_INTERVAL {
                last_stats = now;
                info!(
                    "captured {} bytes, {} buffered{}",
                    total_bytes,
                    pm.ring().available(),
                    if pm.ring().held() { ", held" } else { "" }
                );
            }
        }

        if opt.end_terminate {
            break 'session;
        }
        std::thread::sleep(RETRY_BACKOFF);
    }

    // Whatever is left when the source closes is the postmortem.
    if !pm.ring().is_empty() && !pm.rendered() {
        recon.clear();
        pm.replay(&mut etm, |change| recon.apply(change));
        print_lines(&recon);
    }

    Ok(())
}
