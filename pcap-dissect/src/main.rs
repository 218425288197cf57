#![warn(clippy::all)]

use clap::{crate_version, Parser, ValueEnum};
use tracing::{debug, info, warn, Level};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tempfile::NamedTempFile;
use xz2::read::XzDecoder;

use libpcap_dissect::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputMode {
    /// One line per packet
    Summary,
    /// Every layer and field
    Full,
    /// Field names only
    Tree,
    /// One JSON object per line
    Json,
    /// Nothing (useful with --write)
    Quiet,
}

/// Packet dissection tool, driving tshark
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<String>,

    /// Capture live on this interface instead of reading a file
    #[arg(short, long, conflicts_with = "input")]
    interface: Option<String>,

    /// List capture interfaces and exit
    #[arg(short = 'D', long)]
    list_interfaces: bool,

    /// Display filter, applied by the dissector
    #[arg(short = 'Y', long)]
    display_filter: Option<String>,

    /// Capture filter (live capture only)
    #[arg(short = 'f', long, requires = "interface")]
    bpf_filter: Option<String>,

    /// Stop after this many packets
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// Stop after this many seconds
    #[arg(short = 'a', long)]
    duration: Option<u32>,

    /// Output mode
    #[arg(short, long, value_enum, default_value_t = OutputMode::Summary)]
    output: OutputMode,

    /// Include hidden fields in tree output
    #[arg(long)]
    show_hidden: bool,

    /// Save the raw packets to this file
    #[arg(short, long, value_name = "FILE")]
    write: Option<String>,

    /// Do not track raw packet bytes
    #[arg(long, conflicts_with = "write")]
    no_raw: bool,

    /// Convert field values to their declared types
    #[arg(long)]
    typed: bool,

    /// 802.11 decryption key
    #[arg(long)]
    decryption_key: Option<String>,

    /// Encryption standard of the key (wep, wpa-pwd, wpa-psk)
    #[arg(long, default_value = "wpa-pwd")]
    decryption_type: String,

    /// Path of the tshark executable
    #[arg(long, value_name = "PATH")]
    tshark: Option<String>,

    /// Be verbose
    #[arg(short, long)]
    verbose: bool,

    /// Input file ('-' for stdin; .gz, .xz and .lz4 are decompressed)
    input: Option<String>,
}

/// Prints packets in the selected mode and optionally saves them. Stops the
/// capture when interrupted.
struct Output<W: Write> {
    mode: OutputMode,
    show_hidden: bool,
    out: W,
    saver: Option<PcapSaver>,
    interrupted: Arc<AtomicBool>,
}

impl<W: Write> PacketHandler for Output<W> {
    fn handle_packet(&mut self, packet: Packet, ctx: &CaptureContext) -> Result<(), Error> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(Error::Generic("interrupted"));
        }
        match self.mode {
            OutputMode::Summary => writeln!(
                self.out,
                "{:>6} {:>6}.{:06} {}",
                ctx.pcap_index,
                ctx.rel_ts.secs,
                ctx.rel_ts.micros,
                packet.summary()
            )?,
            OutputMode::Full => writeln!(self.out, "{}", packet)?,
            OutputMode::Tree => {
                writeln!(self.out, "Packet {}:", packet.number())?;
                write!(self.out, "{}", packet.tree_string(self.show_hidden))?;
            }
            OutputMode::Json => {
                serde_json::to_writer(&mut self.out, &packet).map_err(io::Error::from)?;
                writeln!(self.out)?;
            }
            OutputMode::Quiet => (),
        }
        if let Some(saver) = self.saver.as_mut() {
            saver.handle_packet(packet, ctx)?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        let _ = self.out.flush();
        if let Some(saver) = self.saver.as_mut() {
            saver.teardown();
        }
    }
}

fn load_config(config: &mut Config, filename: &str) -> Result<(), io::Error> {
    debug!("Loading configuration {filename}");
    let path = Path::new(&filename);
    let file = File::open(path)?;
    config.load_config(file)
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::try_from_env("PCAP_DISSECT_LOG")
        .unwrap_or_else(|_| EnvFilter::from_default_env().add_directive(level.into()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .compact();
    match config.get("log_file") {
        Some(log_file) => {
            let output_dir = config.get("output_dir").unwrap_or(".");
            let file_appender = RollingFileAppender::new(Rotation::NEVER, output_dir, log_file);
            builder.with_writer(file_appender).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
}

/// Copy stdin or a compressed input to a temporary raw container. Returns
/// `None` when the file can be given to the dissector as is.
fn unpack_input(name: &str) -> Result<Option<NamedTempFile>, Error> {
    let mut reader: Box<dyn Read> = if name == "-" {
        Box::new(io::stdin())
    } else {
        let file = File::open(name)?;
        if name.ends_with(".gz") {
            Box::new(GzDecoder::new(file))
        } else if name.ends_with(".xz") {
            Box::new(XzDecoder::new(file))
        } else if name.ends_with(".lz4") {
            Box::new(lz4::Decoder::new(file)?)
        } else {
            return Ok(None);
        }
    };
    let mut tmp = tempfile::Builder::new()
        .prefix("pcap-dissect-")
        .suffix(".pcap")
        .tempfile()?;
    let sz = io::copy(&mut reader, &mut tmp)?;
    tmp.flush()?;
    debug!("unpacked {} ({} bytes) to {}", name, sz, tmp.path().display());
    Ok(Some(tmp))
}

fn run(args: Args) -> Result<(), Error> {
    let mut config = Config::default();
    if let Some(ref filename) = args.config {
        load_config(&mut config, filename)?;
    }
    // override config options from command-line arguments
    if let Some(ref path) = args.tshark {
        config.set("tshark.path", path.as_str());
    }
    if args.no_raw {
        config.set("capture.raw", false);
    }
    if args.typed {
        config.set("capture.parse_types", true);
    }

    init_logging(&config, args.verbose);
    info!("pcap-dissect {}", crate_version!());

    if args.list_interfaces {
        for line in Capture::list_interfaces(&config)? {
            println!("{line}");
        }
        return Ok(());
    }

    // keep the unpacked copy alive until the capture ends
    let mut unpacked = None;
    let capture = match (args.interface.as_ref(), args.input.as_deref()) {
        (Some(interface), _) => Capture::live(
            vec![interface.clone()],
            args.bpf_filter.as_deref(),
            &config,
        )?,
        (None, Some(input)) => {
            unpacked = unpack_input(input)?;
            match unpacked {
                Some(ref tmp) => Capture::from_file(tmp.path(), &config),
                None => Capture::from_file(input, &config),
            }
        }
        (None, None) => return Err(Error::Generic("no input file or interface given")),
    };
    let capture = match args.display_filter {
        Some(ref filter) => capture.display_filter(filter),
        None => capture,
    };
    let mut capture = match args.decryption_key {
        Some(ref key) => capture.decryption_key(key, &args.decryption_type)?,
        None => capture,
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let saver = match args.write {
        Some(ref path) => Some(PcapSaver::create(path)?),
        None => None,
    };
    let stdout = io::stdout();
    let mut output = Output {
        mode: args.output,
        show_hidden: args.show_hidden,
        out: io::BufWriter::new(stdout.lock()),
        saver,
        interrupted: interrupted.clone(),
    };

    let result = capture.apply_on_packets(&mut output, args.duration, args.count);
    if let Some(ref mut saver) = output.saver {
        saver.close()?;
        info!("{} packets saved, {} skipped", saver.saved(), saver.skipped());
    }
    drop(unpacked);
    match result {
        Ok(n) => {
            info!("pcap-dissect: {} packets, done", n);
            Ok(())
        }
        Err(_) if interrupted.load(Ordering::SeqCst) => {
            warn!("pcap-dissect: interrupted");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("pcap-dissect: {e}");
        ::std::process::exit(1);
    }
}
