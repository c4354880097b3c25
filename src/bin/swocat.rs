use std::io;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use structopt::StructOpt;

use swotrace::cat::CatSink;
use swotrace::pump::{PumpConfig, TracePump};
use swotrace::render::HwEventFilter;
use swotrace::source::{parse_server, ByteSource, Endpoint};

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Dumps decoded ITM/DWT trace as one text record per event. \
             Connects to a trace server or reads a capture file, strips \
             TPIU framing when asked to, and applies per-channel printf-style \
             formats to software messages."
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

    /// Install a channel format as N,FORMAT (repeatable)
    #[structopt(short = "c", long = "channel", name = "N,FORMAT")]
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

    let stdout = io::stdout();
    let mut sink = CatSink::new(stdout.lock(), HwEventFilter::all());
    for spec in &opt.channels {
        let (ch, format) = match spec.split_once(',') {
            Some((ch, format)) => (ch, format),
            None => bail!("channel spec '{}' is not N,FORMAT", spec),
        };
        let ch: usize = ch
            .parse()
            .with_context(|| format!("bad channel number in '{}'", spec))?;
        if !sink.set_template(ch, format) {
            bail!("channel {} is out of range", ch);
        }
    }

    let endpoint = match &opt.file {
        Some(path) => Endpoint::File(path.clone()),
        None => parse_server(&opt.server),
    };

    ByteSource::new(endpoint, opt.end_terminate)
        .run(|block| {
            pump.pump_block(block, &mut sink);
            true
        })
        .context("trace source failed")?;

    Ok(())
}
