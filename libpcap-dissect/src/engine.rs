use crate::config::Config;
use crate::context::CaptureContext;
use crate::error::Error;
use crate::field_types::FieldTypes;
use crate::handler::PacketHandler;
use crate::packet::Packet;
use crate::raw_store::{RawRecord, RawRecordWriter};
use crate::scanner::{StreamTagScanner, DEFAULT_BATCH_SIZE};
use crate::source::{terminate, FileSource, LiveSource, PacketsSource, StderrDrain};
use crate::tshark::{capture_args, command_line, interface_ids, Decryption, DecoderOptions, Tshark};
use crate::archive::DEFAULT_ARCHIVE_MAX_SIZE;
use crate::duration::Duration;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tempfile::NamedTempFile;
use tracing::{debug, info, trace, warn};

/// Read decoded records from `decoder_output` until it ends or `max_packets`
/// packets were handled, and call `handler` for each packet.
///
/// `raw` is called with the decoder packet number of each packet and returns
/// the matching raw record, if any. Returns the number of packets handled.
pub fn drive<R, F, H>(
    decoder_output: &mut R,
    mut raw: F,
    handler: &mut H,
    types: &FieldTypes,
    batch_size: usize,
    max_packets: Option<usize>,
) -> Result<u64, Error>
where
    R: Read,
    F: FnMut(u64) -> Result<Option<RawRecord>, Error>,
    H: PacketHandler + ?Sized,
{
    let mut scanner = StreamTagScanner::default().with_batch_size(batch_size);
    let mut ctx = CaptureContext::default();
    while let Some(record) = scanner.next_record(decoder_output)? {
        let mut packet = Packet::from_pdml(&record, types)?;
        ctx.advance(packet.sniff_time());
        trace!(
            "packet {} (decoder number {}, {} bytes)",
            ctx.pcap_index,
            packet.number(),
            packet.length()
        );
        match raw(packet.number())? {
            Some(r) => packet.attach_raw(r)?,
            None => trace!("no raw bytes for packet {}", packet.number()),
        }
        handler.handle_packet(packet, &ctx)?;
        if let Some(max) = max_packets {
            if ctx.pcap_index >= max as u64 {
                debug!("packet limit reached ({})", max);
                break;
            }
        }
    }
    Ok(ctx.pcap_index)
}

/// A packet given to an in-memory capture
pub enum InMemPacket {
    /// Raw bytes of a packet, timestamped when written
    Raw(Vec<u8>),
    /// A packet decoded earlier. Its raw bytes are needed.
    Decoded(Packet),
}

impl From<Vec<u8>> for InMemPacket {
    fn from(v: Vec<u8>) -> Self {
        InMemPacket::Raw(v)
    }
}

impl From<Packet> for InMemPacket {
    fn from(p: Packet) -> Self {
        InMemPacket::Decoded(p)
    }
}

enum SourceKind {
    File(PathBuf),
    Live {
        interfaces: Vec<String>,
        bpf_filter: Option<String>,
    },
    InMemory(NamedTempFile),
}

/// One capture: where packets come from, and how they are decoded
///
/// ## example
///
/// ```no_run
/// use libpcap_dissect::{Capture, CaptureContext, Config, Error, Packet};
///
/// let config = Config::default();
/// let mut capture = Capture::from_file("input.pcap", &config).display_filter("dns");
/// let mut count = 0;
/// let mut handler = |packet: Packet, _ctx: &CaptureContext| -> Result<(), Error> {
///     println!("{}", packet.summary());
///     count += 1;
///     Ok(())
/// };
/// capture.apply_on_packets(&mut handler, None, Some(10))?;
/// # Ok::<(), Error>(())
/// ```
pub struct Capture {
    kind: SourceKind,
    config: Config,
    display_filter: Option<String>,
    decryption: Option<Decryption>,
}

impl Capture {
    fn new(kind: SourceKind, config: &Config) -> Self {
        Capture {
            kind,
            config: config.clone(),
            display_filter: None,
            decryption: None,
        }
    }

    /// Capture reading packets from a file
    pub fn from_file<P: AsRef<Path>>(path: P, config: &Config) -> Self {
        Capture::new(SourceKind::File(path.as_ref().to_path_buf()), config)
    }

    /// Live capture on one interface. With no interface, every interface
    /// listed by the decoder is used.
    ///
    /// Capturing on more than one interface is not supported: the capture
    /// tool then writes a format the raw index cannot read.
    pub fn live(
        interfaces: Vec<String>,
        bpf_filter: Option<&str>,
        config: &Config,
    ) -> Result<Self, Error> {
        let interfaces = if interfaces.is_empty() {
            interface_ids(&Capture::list_interfaces(config)?)
        } else {
            interfaces
        };
        if interfaces.len() > 1 {
            return Err(Error::UnsupportedConfiguration(format!(
                "capturing from multiple interfaces ({}) is not supported",
                interfaces.join(", ")
            )));
        }
        Ok(Capture::new(
            SourceKind::Live {
                interfaces,
                bpf_filter: bpf_filter.map(str::to_owned),
            },
            config,
        ))
    }

    /// Capture over packets held in memory. They are written to a temporary
    /// raw container, removed when the capture is dropped.
    pub fn in_memory<I>(packets: I, config: &Config) -> Result<Self, Error>
    where
        I: IntoIterator<Item = InMemPacket>,
    {
        let file = tempfile::Builder::new()
            .prefix("pcap-dissect-")
            .suffix(".pcap")
            .tempfile()?;
        let mut writer = RawRecordWriter::new(BufWriter::new(file.as_file()));
        let mut written = 0;
        for (i, packet) in packets.into_iter().enumerate() {
            match packet {
                InMemPacket::Raw(data) => {
                    let now = Duration::now();
                    writer.write_record(&data, now.secs, now.micros)?;
                }
                InMemPacket::Decoded(p) => match p.raw_record() {
                    Some(r) => writer.write_raw_record(r)?,
                    None => {
                        warn!("skipping packet {}: no raw bytes", i);
                        continue;
                    }
                },
            }
            written += 1;
        }
        writer.finish()?;
        debug!(
            "in-memory capture: {} packets in {}",
            written,
            file.path().display()
        );
        Ok(Capture::new(SourceKind::InMemory(file), config))
    }

    /// Lines of the decoder's interface listing
    pub fn list_interfaces(config: &Config) -> Result<Vec<String>, Error> {
        Tshark::locate(config)?.list_interfaces()
    }

    /// Display filter, forwarded verbatim to the decoder
    pub fn display_filter(mut self, filter: &str) -> Self {
        self.display_filter = Some(filter.to_owned());
        self
    }

    pub fn decryption(mut self, decryption: Decryption) -> Self {
        self.decryption = Some(decryption);
        self
    }

    /// Decrypt traffic with `key`. Fails if `standard` is not supported.
    pub fn decryption_key(self, key: &str, standard: &str) -> Result<Self, Error> {
        Ok(self.decryption(Decryption::new(key, standard)?))
    }

    /// Path of the file read by this capture, if any
    pub fn input_path(&self) -> Option<&Path> {
        match self.kind {
            SourceKind::File(ref p) => Some(p),
            SourceKind::InMemory(ref f) => Some(f.path()),
            SourceKind::Live { .. } => None,
        }
    }

    fn packets_source(
        &self,
        tshark: &Tshark,
        timeout: Option<u32>,
        packet_count: Option<usize>,
    ) -> Box<dyn PacketsSource> {
        let raw = self.config.get_bool("capture.raw").unwrap_or(true);
        match self.kind {
            SourceKind::File(ref path) => Box::new(FileSource::new(path, raw)),
            SourceKind::InMemory(ref file) => Box::new(FileSource::new(file.path(), raw)),
            SourceKind::Live {
                ref interfaces,
                ref bpf_filter,
            } => {
                let args = capture_args(interfaces, bpf_filter.as_deref(), packet_count, timeout);
                let batch_size = self
                    .config
                    .get_usize("capture.batch_size")
                    .unwrap_or(DEFAULT_BATCH_SIZE);
                let archive_max_size = self
                    .config
                    .get_usize("capture.archive_max_size")
                    .unwrap_or(DEFAULT_ARCHIVE_MAX_SIZE);
                Box::new(
                    LiveSource::new(tshark.dumpcap_path(&self.config), args)
                        .with_raw(raw)
                        .with_batch_size(batch_size)
                        .with_archive_max_size(archive_max_size),
                )
            }
        }
    }

    /// Decode every packet of the capture and give it to `handler`.
    ///
    /// `timeout` (seconds) is forwarded to the external tools. The capture
    /// stops after `packet_count` packets, when the input ends, or when the
    /// handler fails. Processes and handles are released on every path.
    /// Returns the number of packets handled.
    pub fn apply_on_packets<H: PacketHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        timeout: Option<u32>,
        packet_count: Option<usize>,
    ) -> Result<u64, Error> {
        let packet_count = packet_count.filter(|&n| n > 0);
        let timeout = timeout.filter(|&t| t > 0);
        let tshark = Tshark::locate(&self.config)?;
        let types = if self.config.get_bool("capture.parse_types").unwrap_or(false) {
            tshark.field_types()?
        } else {
            FieldTypes::new()
        };
        let filter_flag = match self.display_filter {
            Some(_) => tshark.display_filter_flag(),
            None => "-Y",
        };
        let options = DecoderOptions {
            display_filter: self.display_filter.clone(),
            packet_count,
            duration: timeout,
            decryption: self.decryption.clone(),
        };
        let batch_size = self
            .config
            .get_usize("capture.batch_size")
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let mut session = Session {
            source: self.packets_source(&tshark, timeout, packet_count),
            decoder: None,
            stderr: None,
        };
        let result = session.run(
            tshark.path(),
            &options.args(filter_flag),
            handler,
            &types,
            batch_size,
            packet_count,
        );
        let cleanup = session.cleanup(result.is_err());
        match (result, cleanup) {
            (Ok(n), Ok(())) => {
                info!("capture done, {} packets", n);
                Ok(n)
            }
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        }
    }
}

/// Processes and handles of one running capture
struct Session {
    source: Box<dyn PacketsSource>,
    decoder: Option<Child>,
    stderr: Option<StderrDrain>,
}

impl Session {
    fn run<H: PacketHandler + ?Sized>(
        &mut self,
        program: &Path,
        args: &[String],
        handler: &mut H,
        types: &FieldTypes,
        batch_size: usize,
        max_packets: Option<usize>,
    ) -> Result<u64, Error> {
        let input = self.source.start()?;
        let command = command_line(program, args);
        debug!("starting decoder: {}", command);
        let mut child = Command::new(program)
            .args(args)
            .stdin(input)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                warn!("could not start decoder: {}", e);
                Error::ToolCrashed {
                    command: command.clone(),
                    status: None,
                }
            })?;
        if let Some(stderr) = child.stderr.take() {
            self.stderr = Some(StderrDrain::spawn(stderr, "decoder")?);
        }
        let decoder_input = child.stdin.take();
        let stdout = child.stdout.take();
        let status = child.try_wait()?;
        self.decoder = Some(child);
        if let Some(status) = status.filter(|s| !s.success()) {
            return Err(Error::ToolCrashed {
                command,
                status: Some(status),
            });
        }
        let mut stdout = stdout.ok_or(Error::Generic("decoder output not available"))?;
        self.source.connect(decoder_input)?;

        handler.init()?;
        let source = &mut self.source;
        let res = drive(
            &mut stdout,
            |n| source.next_raw_packet(n),
            handler,
            types,
            batch_size,
            max_packets,
        );
        handler.teardown();
        let count = res?;
        let limit_reached = max_packets.map_or(false, |m| count >= m as u64);
        if !limit_reached {
            // output ended: the decoder exited, check how
            if let Some(ref mut child) = self.decoder {
                let status = child.wait()?;
                if !status.success() {
                    return Err(Error::ToolCrashed {
                        command,
                        status: Some(status),
                    });
                }
            }
        }
        Ok(count)
    }

    /// Stop the decoder, collect its diagnostics, then close the source.
    /// Returns the first error.
    fn cleanup(&mut self, failed: bool) -> Result<(), Error> {
        let mut result = Ok(());
        if let Some(mut child) = self.decoder.take() {
            result = terminate(&mut child);
        }
        if let Some(mut drain) = self.stderr.take() {
            let text = drain.collect();
            let text = text.trim_end();
            if !text.is_empty() {
                if failed {
                    warn!("decoder stderr: {}", text);
                } else {
                    debug!("decoder stderr: {}", text);
                }
            }
        }
        if let Err(e) = self.source.close() {
            if result.is_ok() {
                result = Err(e);
            }
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.cleanup(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_record;
    use crate::raw_store::RawIndex;
    use std::io::Cursor;

    const LENGTHS: [u32; 3] = [60, 74, 98];

    fn container() -> Vec<u8> {
        let mut w = RawRecordWriter::new(Vec::new());
        for (i, len) in LENGTHS.iter().enumerate() {
            let data = vec![i as u8; *len as usize];
            w.write_record(&data, 1_577_836_801 + i as u32, 0).unwrap();
        }
        w.finish().unwrap()
    }

    fn decoder_output() -> String {
        let mut s = String::from("<?xml version=\"1.0\"?>\n<pdml version=\"0\" creator=\"wireshark\">\n");
        for (i, len) in LENGTHS.iter().enumerate() {
            s.push_str(&test_record(i as u64 + 1, *len));
            s.push('\n');
        }
        s.push_str("</pdml>\n");
        s
    }

    type Seen = Vec<(u64, u64, u32, Option<u32>)>;

    fn collect(seen: &mut Seen) -> impl FnMut(Packet, &CaptureContext) -> Result<(), Error> + '_ {
        move |p: Packet, ctx: &CaptureContext| {
            seen.push((
                ctx.pcap_index,
                p.number(),
                p.length(),
                p.raw_record().map(|r| r.origlen),
            ));
            Ok(())
        }
    }

    #[test]
    fn drive_attaches_raw_bytes() {
        let mut index = RawIndex::new(Cursor::new(container()));
        let mut seen = Seen::new();
        let mut handler = collect(&mut seen);
        let n = drive(
            &mut Cursor::new(decoder_output()),
            |n| index.get(n),
            &mut handler,
            &FieldTypes::new(),
            64,
            None,
        )
        .unwrap();
        drop(handler);
        assert_eq!(n, 3);
        assert_eq!(
            seen,
            vec![
                (1, 1, 60, Some(60)),
                (2, 2, 74, Some(74)),
                (3, 3, 98, Some(98))
            ]
        );
    }

    #[test]
    fn drive_limits_and_errors() {
        let mut seen = Seen::new();
        let mut handler = collect(&mut seen);
        let n = drive(
            &mut Cursor::new(decoder_output()),
            |_| Ok(None),
            &mut handler,
            &FieldTypes::new(),
            4096,
            Some(2),
        )
        .unwrap();
        drop(handler);
        assert_eq!(n, 2);
        assert_eq!(seen.iter().map(|s| s.3).collect::<Vec<_>>(), vec![None, None]);

        let mut calls = 0;
        let mut failing = |_p: Packet, _ctx: &CaptureContext| -> Result<(), Error> {
            calls += 1;
            Err(Error::Generic("stop"))
        };
        let res = drive(
            &mut Cursor::new(decoder_output()),
            |_| Ok(None),
            &mut failing,
            &FieldTypes::new(),
            4096,
            None,
        );
        assert!(matches!(res, Err(Error::Generic("stop"))));
        assert_eq!(calls, 1);

        let output = decoder_output();
        let truncated = &output[..300];
        let res = drive(
            &mut Cursor::new(truncated),
            |_| Ok(None),
            &mut |_p: Packet, _ctx: &CaptureContext| -> Result<(), Error> { Ok(()) },
            &FieldTypes::new(),
            4096,
            None,
        );
        assert!(matches!(res, Err(Error::MalformedStream(_))));
    }

    #[test]
    fn multiple_interfaces_rejected() {
        let res = Capture::live(
            vec!["eth0".to_owned(), "eth1".to_owned()],
            None,
            &Config::default(),
        );
        assert!(matches!(res, Err(Error::UnsupportedConfiguration(_))));
    }

    #[test]
    fn bad_encryption_standard() {
        let res = Capture::from_file("x.pcap", &Config::default()).decryption_key("k", "rot13");
        assert!(matches!(res, Err(Error::UnsupportedConfiguration(_))));
    }

    #[test]
    fn missing_decoder() {
        let mut config = Config::default();
        config.set("tshark.path", "/nonexistent/tshark");
        let mut capture = Capture::from_file("x.pcap", &config);
        let res = capture.apply_on_packets(
            &mut |_p: Packet, _ctx: &CaptureContext| -> Result<(), Error> { Ok(()) },
            None,
            None,
        );
        assert!(matches!(res, Err(Error::ToolNotFound { .. })));
    }

    #[cfg(unix)]
    mod fake_decoder {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// Install a shell script standing in for the decoder
        fn install(dir: &TempDir, body: &str) -> Config {
            let path = dir.path().join("tshark");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            let mut config = Config::default();
            config.set("tshark.path", path.display().to_string());
            config
        }

        fn replaying_decoder(dir: &TempDir) -> Config {
            let pdml = dir.path().join("out.pdml");
            std::fs::write(&pdml, decoder_output()).unwrap();
            install(dir, &format!("cat > /dev/null\ncat '{}'", pdml.display()))
        }

        #[test]
        fn file_session_end_to_end() {
            let dir = TempDir::new().unwrap();
            let config = replaying_decoder(&dir);
            let input = dir.path().join("input.pcap");
            std::fs::write(&input, container()).unwrap();
            let mut capture = Capture::from_file(&input, &config);
            let mut seen = Seen::new();
            let n = capture
                .apply_on_packets(&mut collect(&mut seen), None, None)
                .unwrap();
            assert_eq!(n, 3);
            let seqs: Vec<_> = seen.iter().map(|s| s.0).collect();
            assert_eq!(seqs, vec![1, 2, 3]);
            let lengths: Vec<_> = seen.iter().map(|s| s.3).collect();
            assert_eq!(lengths, vec![Some(60), Some(74), Some(98)]);
        }

        #[test]
        fn in_memory_session() {
            let dir = TempDir::new().unwrap();
            let config = replaying_decoder(&dir);
            let no_raw = Packet::from_pdml(test_record(9, 60).as_bytes(), &FieldTypes::new()).unwrap();
            let packets: Vec<InMemPacket> = vec![
                vec![0u8; 60].into(),
                no_raw.into(),
                vec![1u8; 74].into(),
                vec![2u8; 98].into(),
            ];
            let mut capture = Capture::in_memory(packets, &config).unwrap();
            let path = capture.input_path().unwrap().to_path_buf();
            assert!(path.exists());
            let mut seen = Seen::new();
            capture
                .apply_on_packets(&mut collect(&mut seen), None, Some(2))
                .unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[1].3, Some(74));
            drop(capture);
            assert!(!path.exists());
        }

        /// Capture tool script writing `data` as its capture output
        fn install_capture(dir: &TempDir, config: &mut Config, data: &[u8]) {
            let input = dir.path().join("live.pcap");
            std::fs::write(&input, data).unwrap();
            let path = dir.path().join("dumpcap");
            std::fs::write(&path, format!("#!/bin/sh\ncat '{}'\n", input.display())).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            config.set("dumpcap.path", path.display().to_string());
        }

        #[test]
        fn live_session_with_filtered_decoder() {
            let dir = TempDir::new().unwrap();
            // the decoder only reports the third packet, as with a display filter
            let pdml = dir.path().join("out.pdml");
            std::fs::write(
                &pdml,
                format!(
                    "<?xml version=\"1.0\"?>\n<pdml version=\"0\">\n{}\n</pdml>\n",
                    test_record(3, LENGTHS[2])
                ),
            )
            .unwrap();
            let mut config = install(&dir, &format!("cat > /dev/null\ncat '{}'", pdml.display()));
            install_capture(&dir, &mut config, &container());

            let mut capture = Capture::live(vec!["eth0".to_owned()], None, &config).unwrap();
            let mut seen = Vec::new();
            let n = capture
                .apply_on_packets(
                    &mut |p: Packet, ctx: &CaptureContext| -> Result<(), Error> {
                        seen.push((
                            ctx.pcap_index,
                            p.number(),
                            p.raw_record().map(|r| r.origlen),
                            p.raw().map(|d| d[0]),
                        ));
                        Ok(())
                    },
                    None,
                    None,
                )
                .unwrap();
            assert_eq!(n, 1);
            assert_eq!(seen, vec![(1, 3, Some(98), Some(2))]);
        }

        #[test]
        fn live_session_archive_overrun() {
            let dir = TempDir::new().unwrap();
            // consumes the whole capture and never reports a packet
            let mut config = install(&dir, "cat > /dev/null");
            let mut w = RawRecordWriter::new(Vec::new());
            for i in 0..1000u32 {
                w.write_record(&[0u8; 60], 1_577_836_801 + i, 0).unwrap();
            }
            let data = w.finish().unwrap();
            assert!(data.len() > 50_000);
            install_capture(&dir, &mut config, &data);
            config.set("capture.archive_max_size", 50_000i64);

            let mut capture = Capture::live(vec!["eth0".to_owned()], None, &config).unwrap();
            let res = capture.apply_on_packets(
                &mut |_p: Packet, _ctx: &CaptureContext| -> Result<(), Error> { Ok(()) },
                None,
                None,
            );
            match res {
                Err(Error::BufferOverrun { capacity }) => assert_eq!(capacity, 50_000),
                other => panic!("unexpected result {:?}", other),
            }
        }

        #[test]
        fn crashing_decoder() {
            let dir = TempDir::new().unwrap();
            let config = install(&dir, "echo 'invalid filter' >&2\nexit 2");
            let input = dir.path().join("input.pcap");
            std::fs::write(&input, container()).unwrap();
            let mut capture = Capture::from_file(&input, &config);
            let res = capture.apply_on_packets(
                &mut |_p: Packet, _ctx: &CaptureContext| -> Result<(), Error> { Ok(()) },
                None,
                None,
            );
            match res {
                Err(Error::ToolCrashed { status: Some(s), .. }) => assert_eq!(s.code(), Some(2)),
                other => panic!("unexpected result {:?}", other),
            }
        }
    }
}
