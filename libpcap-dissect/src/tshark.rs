//! Boundary with the external tools: the decoder (`tshark`) and the capture
//! tool (`dumpcap`). Locating them, querying them, and building their
//! command lines.

use crate::config::Config;
use crate::error::Error;
use crate::field_types::FieldTypes;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::str::FromStr;
use tracing::debug;

/// First decoder version using `-Y` for display filters
const DISPLAY_FILTER_MIN_VERSION: (u32, u32, u32) = (1, 10, 0);

fn default_locations() -> Vec<PathBuf> {
    if cfg!(windows) {
        ["ProgramFiles(x86)", "ProgramW6432"]
            .iter()
            .map(|var| {
                let base = std::env::var_os(var).unwrap_or_default();
                Path::new(&base).join("Wireshark").join("tshark.exe")
            })
            .collect()
    } else {
        [
            "/usr/bin/tshark",
            "/usr/sbin/tshark",
            "/usr/lib/tshark",
            "/usr/local/bin/tshark",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }
}

/// Render a command line for diagnostics
pub fn command_line<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    let mut s = program.display().to_string();
    for arg in args {
        s.push(' ');
        s.push_str(&arg.as_ref().to_string_lossy());
    }
    s
}

fn run_output(program: &Path, args: &[&str]) -> Result<Output, Error> {
    let command = command_line(program, args);
    debug!("running {}", command);
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            debug!("could not run {}: {}", command, e);
            Error::ToolCrashed {
                command: command.clone(),
                status: None,
            }
        })?;
    if !output.status.success() {
        return Err(Error::ToolCrashed {
            command,
            status: Some(output.status),
        });
    }
    Ok(output)
}

/// Parse the leading `major.minor.patch` numbers of a version string
fn parse_version(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = s.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

/// Flag selecting a display filter for a decoder of this version.
/// Unparseable versions are assumed recent.
pub fn display_filter_flag_for(version: &str) -> &'static str {
    match parse_version(version) {
        Some(v) if v < DISPLAY_FILTER_MIN_VERSION => "-R",
        _ => "-Y",
    }
}

/// Extract interface ids from the interface listing (`1. eth0 (...)` gives `1`)
pub fn interface_ids(listing: &[String]) -> Vec<String> {
    listing
        .iter()
        .filter_map(|line| line.split('.').next())
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty())
        .collect()
}

/// The decoder executable
#[derive(Clone, Debug)]
pub struct Tshark {
    path: PathBuf,
}

impl Tshark {
    /// Locate the decoder: `tshark.path` from the configuration if set,
    /// otherwise the default install locations.
    pub fn locate(config: &Config) -> Result<Tshark, Error> {
        let candidates = match config.get("tshark.path") {
            Some(p) => vec![PathBuf::from(p)],
            None => default_locations(),
        };
        match candidates.iter().find(|p| p.is_file()) {
            Some(path) => {
                debug!("decoder found at {}", path.display());
                Ok(Tshark { path: path.clone() })
            }
            None => Err(Error::ToolNotFound {
                searched: candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
            }),
        }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Tshark {
        Tshark { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capture tool path: `dumpcap.path` from the configuration, or the
    /// sibling of the decoder with `tshark` replaced by `dumpcap` in its name
    pub fn dumpcap_path(&self, config: &Config) -> PathBuf {
        if let Some(p) = config.get("dumpcap.path") {
            return PathBuf::from(p);
        }
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().replace("tshark", "dumpcap"))
            .unwrap_or_else(|| "dumpcap".to_owned());
        self.path.with_file_name(name)
    }

    /// Version string: first word starting with a digit on the first line
    /// of `tshark -v` (`TShark (Wireshark) 3.6.2 ...` gives `3.6.2`)
    pub fn version(&self) -> Result<String, Error> {
        let output = run_output(&self.path, &["-v"])?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.lines()
            .next()
            .and_then(|l| {
                l.split_whitespace()
                    .find(|w| w.starts_with(|c: char| c.is_ascii_digit()))
            })
            .map(str::to_owned)
            .ok_or(Error::Generic("could not read decoder version"))
    }

    pub fn display_filter_flag(&self) -> &'static str {
        match self.version() {
            Ok(v) => display_filter_flag_for(&v),
            Err(e) => {
                debug!("decoder version unknown ({}), assuming recent", e);
                "-Y"
            }
        }
    }

    /// Lines of the interface listing (`tshark -D`)
    pub fn list_interfaces(&self) -> Result<Vec<String>, Error> {
        let output = run_output(&self.path, &["-D"])?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_owned)
            .collect())
    }

    /// Declared field types (`tshark -G fields`)
    pub fn field_types(&self) -> Result<FieldTypes, Error> {
        let output = run_output(&self.path, &["-G", "fields"])?;
        let types = FieldTypes::parse_listing(output.stdout.as_slice())?;
        debug!("decoder declares {} field types", types.len());
        Ok(types)
    }
}

/// Encryption standards the decoder can decrypt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionStandard {
    Wep,
    WpaPwd,
    WpaPsk,
}

impl EncryptionStandard {
    pub const SUPPORTED: &'static [&'static str] = &["wep", "wpa-pwd", "wpa-psk"];

    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionStandard::Wep => "wep",
            EncryptionStandard::WpaPwd => "wpa-pwd",
            EncryptionStandard::WpaPsk => "wpa-psk",
        }
    }
}

impl fmt::Display for EncryptionStandard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionStandard {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wep" => Ok(EncryptionStandard::Wep),
            // "wpa-pwk" is an older spelling
            "wpa-pwd" | "wpa-pwk" => Ok(EncryptionStandard::WpaPwd),
            "wpa-psk" => Ok(EncryptionStandard::WpaPsk),
            _ => Err(Error::UnsupportedConfiguration(format!(
                "unknown encryption standard '{}', supported: {}",
                s,
                EncryptionStandard::SUPPORTED.join(", ")
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decryption {
    pub key: String,
    pub standard: EncryptionStandard,
}

impl Decryption {
    pub fn new(key: &str, standard: &str) -> Result<Decryption, Error> {
        Ok(Decryption {
            key: key.to_owned(),
            standard: standard.parse()?,
        })
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "-o".to_owned(),
            "wlan.enable_decryption:TRUE".to_owned(),
            "-o".to_owned(),
            format!("uat:80211_keys:\"{}\",\"{}\"", self.standard, self.key),
        ]
    }
}

/// Options forwarded to the decoder
#[derive(Clone, Debug, Default)]
pub struct DecoderOptions {
    pub display_filter: Option<String>,
    pub packet_count: Option<usize>,
    /// Duration limit, in seconds
    pub duration: Option<u32>,
    pub decryption: Option<Decryption>,
}

impl DecoderOptions {
    /// Decoder arguments: PDML output, reading from standard input, line
    /// buffered, followed by the configured options
    pub fn args(&self, filter_flag: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-T", "pdml", "-i", "-", "-l"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(ref filter) = self.display_filter {
            args.push(filter_flag.to_owned());
            args.push(filter.clone());
        }
        if let Some(count) = self.packet_count {
            args.push("-c".to_owned());
            args.push(count.to_string());
        }
        if let Some(duration) = self.duration {
            args.push("-a".to_owned());
            args.push(format!("duration:{duration}"));
        }
        if let Some(ref d) = self.decryption {
            args.extend(d.args());
        }
        args
    }
}

/// Capture tool arguments: pcap format, quiet, one thread per interface,
/// writing to standard output
pub fn capture_args(
    interfaces: &[String],
    bpf_filter: Option<&str>,
    packet_count: Option<usize>,
    duration: Option<u32>,
) -> Vec<String> {
    let mut args: Vec<String> = ["-P", "-q", "-t", "-w", "-"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if let Some(count) = packet_count {
        args.push("-c".to_owned());
        args.push(count.to_string());
    }
    if let Some(duration) = duration {
        args.push("-a".to_owned());
        args.push(format!("duration:{duration}"));
    }
    if let Some(filter) = bpf_filter {
        args.push("-f".to_owned());
        args.push(filter.to_owned());
    }
    for iface in interfaces {
        args.push("-i".to_owned());
        args.push(iface.clone());
    }
    args
}
