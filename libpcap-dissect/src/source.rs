//! Packet sources: where the decoder input and the raw bytes come from

use crate::archive::{archive, ArchiveReader, ArchiveWriter, DEFAULT_ARCHIVE_MAX_SIZE};
use crate::error::Error;
use crate::fanout::PipeFanout;
use crate::raw_store::{RawIndex, RawRecord};
use crate::scanner::DEFAULT_BATCH_SIZE;
use crate::tshark::command_line;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use tracing::{debug, warn};

/// A source of raw packets, feeding the decoder and providing the raw bytes
/// of each decoded packet.
///
/// Call order: `start`, spawn the decoder with the returned input, `connect`
/// with the decoder's standard input if it was piped, then any number of
/// `next_raw_packet`, then `close`. `close` must be safe to call at any
/// point, and more than once.
pub trait PacketsSource {
    /// Start producing packets. Returns what the decoder must read from.
    fn start(&mut self) -> Result<Stdio, Error>;

    /// Connect the decoder input, if `start` asked for a pipe
    fn connect(&mut self, decoder_input: Option<ChildStdin>) -> Result<(), Error>;

    /// Raw record with decoder packet number `number` (1-based,
    /// non-decreasing). `Ok(None)` if raw bytes are not tracked.
    fn next_raw_packet(&mut self, number: u64) -> Result<Option<RawRecord>, Error>;

    /// Release every process, thread and handle
    fn close(&mut self) -> Result<(), Error>;
}

/// Collects the standard error of a child process on a helper thread, so
/// that the child never blocks on a full pipe.
pub(crate) struct StderrDrain {
    handle: Option<thread::JoinHandle<String>>,
}

impl StderrDrain {
    pub(crate) fn spawn<R: Read + Send + 'static>(mut stream: R, name: &str) -> Result<Self, Error> {
        let handle = thread::Builder::new()
            .name(format!("{name}-stderr"))
            .spawn(move || {
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })?;
        Ok(StderrDrain {
            handle: Some(handle),
        })
    }

    /// Wait for the stream to end and return its content. Empty after the
    /// first call.
    pub(crate) fn collect(&mut self) -> String {
        self.handle
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }
}

/// Kill a child process and reap it. A child that already exited is fine.
pub(crate) fn terminate(child: &mut Child) -> Result<(), Error> {
    if let Err(e) = child.kill() {
        // InvalidInput: the process already exited
        if e.kind() != std::io::ErrorKind::InvalidInput {
            warn!("could not kill process {}: {}", child.id(), e);
        }
    }
    let status = child.wait()?;
    debug!("process {} ended: {}", child.id(), status);
    Ok(())
}

/// Packets read from a capture file
pub struct FileSource {
    path: PathBuf,
    raw: bool,
    index: Option<RawIndex<BufReader<File>>>,
}

impl FileSource {
    pub fn new<P: AsRef<Path>>(path: P, raw: bool) -> Self {
        FileSource {
            path: path.as_ref().to_path_buf(),
            raw,
            index: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PacketsSource for FileSource {
    fn start(&mut self) -> Result<Stdio, Error> {
        let feeder = File::open(&self.path)?;
        if self.raw {
            let file = File::open(&self.path)?;
            self.index = Some(RawIndex::new(BufReader::new(file)));
        }
        debug!("file source: {}", self.path.display());
        Ok(Stdio::from(feeder))
    }

    fn connect(&mut self, _decoder_input: Option<ChildStdin>) -> Result<(), Error> {
        Ok(())
    }

    fn next_raw_packet(&mut self, number: u64) -> Result<Option<RawRecord>, Error> {
        match self.index {
            Some(ref mut index) => index.get(number),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.index = None;
        Ok(())
    }
}

/// Packets captured live by an external capture tool
///
/// The tool writes a raw container on its standard output. A fan-out worker
/// copies it to the decoder input and, if raw bytes are tracked, to a bounded
/// archive read by the raw index.
pub struct LiveSource {
    program: PathBuf,
    args: Vec<String>,
    raw: bool,
    batch_size: usize,
    archive_max_size: usize,
    child: Option<Child>,
    stderr: Option<StderrDrain>,
    archive: Option<ArchiveWriter>,
    index: Option<RawIndex<ArchiveReader>>,
    fanout: Option<PipeFanout>,
}

impl LiveSource {
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
        LiveSource {
            program: program.into(),
            args,
            raw: true,
            batch_size: DEFAULT_BATCH_SIZE,
            archive_max_size: DEFAULT_ARCHIVE_MAX_SIZE,
            child: None,
            stderr: None,
            archive: None,
            index: None,
            fanout: None,
        }
    }

    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_archive_max_size(mut self, size: usize) -> Self {
        self.archive_max_size = size;
        self
    }

    pub fn command_line(&self) -> String {
        command_line(&self.program, &self.args)
    }
}

impl PacketsSource for LiveSource {
    fn start(&mut self) -> Result<Stdio, Error> {
        if self.child.is_some() {
            return Err(Error::InvalidState("live source already started"));
        }
        let command = self.command_line();
        debug!("starting capture: {}", command);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                warn!("could not start capture tool: {}", e);
                Error::ToolCrashed {
                    command: command.clone(),
                    status: None,
                }
            })?;
        if let Some(stderr) = child.stderr.take() {
            self.stderr = Some(StderrDrain::spawn(stderr, "capture")?);
        }
        match child.try_wait()? {
            Some(status) if !status.success() => {
                let _ = child.wait();
                return Err(Error::ToolCrashed {
                    command,
                    status: Some(status),
                });
            }
            _ => (),
        }
        if self.raw {
            let (writer, reader) = archive(self.archive_max_size);
            self.archive = Some(writer);
            self.index = Some(RawIndex::new(reader));
        }
        self.child = Some(child);
        Ok(Stdio::piped())
    }

    fn connect(&mut self, decoder_input: Option<ChildStdin>) -> Result<(), Error> {
        let decoder_input =
            decoder_input.ok_or(Error::InvalidState("live source needs a piped decoder input"))?;
        let stdout = self
            .child
            .as_mut()
            .and_then(|c| c.stdout.take())
            .ok_or(Error::InvalidState("live source not started"))?;
        let fanout = PipeFanout::spawn(stdout, decoder_input, self.archive.take(), self.batch_size)?;
        self.fanout = Some(fanout);
        Ok(())
    }

    fn next_raw_packet(&mut self, number: u64) -> Result<Option<RawRecord>, Error> {
        match self.index {
            Some(ref mut index) => index.get(number),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        // stop consuming the archive first, late bytes are then discarded
        self.index = None;
        self.archive = None;
        let mut result = Ok(());
        if let Some(mut child) = self.child.take() {
            result = terminate(&mut child);
        }
        if let Some(mut drain) = self.stderr.take() {
            let text = drain.collect();
            if !text.trim().is_empty() {
                debug!("capture tool stderr: {}", text.trim_end());
            }
        }
        if let Some(mut fanout) = self.fanout.take() {
            match fanout.join() {
                Ok(sz) => debug!("fan-out copied {} bytes", sz),
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_store::RawRecordWriter;
    use std::io::Write;

    fn container(n: u32) -> tempfile::NamedTempFile {
        let mut w = RawRecordWriter::new(Vec::new());
        for i in 1..=n {
            w.write_record(&vec![i as u8; 40 + i as usize], 100 + i, 0).unwrap();
        }
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&w.finish().unwrap()).unwrap();
        f
    }

    #[test]
    fn file_source_raw_lookup() {
        let f = container(3);
        let mut src = FileSource::new(f.path(), true);
        let _stdin = src.start().unwrap();
        src.connect(None).unwrap();
        assert_eq!(src.next_raw_packet(2).unwrap().map(|r| r.origlen), Some(42));
        assert_eq!(src.next_raw_packet(3).unwrap().map(|r| r.data[0]), Some(3));
        assert!(src.next_raw_packet(1).is_err());
        assert_eq!(src.next_raw_packet(4).unwrap(), None);
        src.close().unwrap();
        src.close().unwrap();
    }

    #[test]
    fn file_source_without_raw() {
        let f = container(1);
        let mut src = FileSource::new(f.path(), false);
        let _stdin = src.start().unwrap();
        assert_eq!(src.next_raw_packet(1).unwrap(), None);
        src.close().unwrap();
    }

    #[test]
    fn missing_file() {
        let mut src = FileSource::new("/nonexistent/capture.pcap", true);
        assert!(matches!(src.start(), Err(Error::Io(_))));
        src.close().unwrap();
    }

    /// `cat` stands in for the capture tool, and a shell discarding its
    /// input for the decoder
    #[cfg(unix)]
    #[test]
    fn live_source_fans_out() {
        let f = container(3);
        let mut src = LiveSource::new("cat", vec![f.path().display().to_string()])
            .with_batch_size(7);
        let input = src.start().unwrap();
        let mut decoder = Command::new("sh")
            .args(["-c", "cat > /dev/null"])
            .stdin(input)
            .spawn()
            .unwrap();
        src.connect(decoder.stdin.take()).unwrap();
        assert_eq!(src.next_raw_packet(1).unwrap().map(|r| r.ts_sec), Some(101));
        assert_eq!(src.next_raw_packet(3).unwrap().map(|r| r.caplen), Some(43));
        assert_eq!(src.next_raw_packet(4).unwrap(), None);
        src.close().unwrap();
        src.close().unwrap();
        decoder.wait().unwrap();
    }

    #[test]
    fn live_source_missing_tool() {
        let mut src = LiveSource::new("/nonexistent/dumpcap", vec![]);
        assert!(matches!(
            src.start(),
            Err(Error::ToolCrashed { status: None, .. })
        ));
        src.close().unwrap();
    }
}
