use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::info;
use structopt::StructOpt;

use swotrace::fifo::{FifoConfig, FifoSet};
use swotrace::pump::{PumpConfig, TracePump};
use swotrace::source::{parse_server, ByteSource, Endpoint};

/// How often decode statistics go to the log.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Fans decoded ITM trace out to per-channel named pipes (or \
             plain files), one worker per configured channel plus one \
             carrying formatted hardware events."
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

    /// Expect TPIU framing; decode ITM from this stream
    #[structopt(short = "t", long = "tpiu", name = "stream")]
    tpiu_stream: Option<u8>,

    /// Do not assume ITM alignment; wait for a sync packet
    #[structopt(short = "n", long = "no-force-sync")]
    no_force_sync: bool,

    /// Directory the channel outputs are created in
    #[structopt(
        short = "b",
        long = "basedir",
        parse(from_os_str),
        default_value = "."
    )]
    basedir: PathBuf,

    /// Write regular files instead of named pipes
    #[structopt(short = "P", long = "permafile")]
    permafile: bool,

    /// Install a channel as N,NAME[,FORMAT] (repeatable)
    #[structopt(short = "c", long = "channel", name = "N,NAME[,FORMAT]")]
    channels: Vec<String>,

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

fn main() -> Result<()> {
    let opt = Opt::from_args();
    init_logging(opt.verbose);

    let config = PumpConfig {
        use_tpiu: opt.tpiu_stream.is_some(),
        itm_stream: opt.tpiu_stream.unwrap_or(1),
        force_itm_sync: !opt.no_force_sync,
    };
    let mut pump = TracePump::new(config).context("bad decode configuration")?;

    std::fs::create_dir_all(&opt.basedir)
        .with_context(|| format!("cannot create {}", opt.basedir.display()))?;

    let mut fifo_config = FifoConfig::new(&opt.basedir);
    fifo_config.permafile = opt.permafile;
    let mut fifos = FifoSet::new(fifo_config).context("cannot start channel workers")?;

    for spec in &opt.channels {
        let mut parts = spec.splitn(3, ',');
        let ch = parts.next().unwrap_or_default();
        let name = match parts.next() {
            Some(name) => name,
            None => bail!("channel spec '{}' is not N,NAME[,FORMAT]", spec),
        };
        let format = parts.next();

        let ch: usize = ch
            .parse()
            .with_context(|| format!("bad channel number in '{}'", spec))?;
        fifos
            .add_channel(ch, name, format)
            .with_context(|| format!("cannot configure channel {}", ch))?;

        if let (Some(name), Some(path)) = (fifos.channel_name(ch), fifos.channel_path(ch)) {
            info!("channel {} ({}) writes to {}", ch, name, path.display());
        }
    }

    let endpoint = match &opt.file {
        Some(path) => Endpoint::File(path.clone()),
        None => parse_server(&opt.server),
    };

    let mut last_stats = Instant::now();
    ByteSource::new(endpoint, opt.end_terminate)
        .run(|block| {
            pump.pump_block(block, &mut fifos);

            let now = Instant::now();
            if now.duration_since(last_stats) >= STATS_INTERVAL {
                last_stats = now;
                let tpiu = pump.tpiu_stats();
                let itm = pump.itm_stats();
                info!(
                    "frames {} (lost sync {}, half-syncs {}); itm syncs {}, overflows {}, errors {}",
                    tpiu.packet_count,
                    tpiu.lost_sync_count,
                    tpiu.half_sync_count,
                    itm.sync_count,
                    itm.overflow_count,
                    itm.error_count,
                );
            }
            true
        })
        .context("trace source failed")?;

    fifos.shutdown();
    Ok(())
}
