//! Raw packet container: a positional binary format made of a 24-byte global
//! header followed by records (16-byte header + payload).
//!
//! This is the legacy pcap format, restricted to microsecond timestamps. Both
//! byte orders are accepted on read; writes are always little-endian.

use crate::error::Error;
use pcap_parser::{LegacyPcapBlock, Linktype, PcapHeader, ToVec};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub const GLOBAL_HEADER_SIZE: usize = 24;
pub const RECORD_HEADER_SIZE: usize = 16;
/// Largest payload a single record may hold
pub const MAX_RECORD_SIZE: usize = 0xffff;
/// Largest record accepted on read (usual maximum snapshot length)
const MAX_READ_RECORD_SIZE: usize = 0x40000;

/// Magic as read little-endian from a little-endian container
const MAGIC_LE: u32 = 0xa1b2_c3d4;
/// Magic as read little-endian from a big-endian container
const MAGIC_BE: u32 = 0xd4c3_b2a1;

/// One captured packet: timestamp, lengths and payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RawRecord {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub caplen: u32,
    pub origlen: u32,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// Bytes requested from the source on each refill
const REFILL_SIZE: usize = 64 * 1024;

/// Append the next bytes available from `reader` to `buffer`. Returns false
/// at end of stream.
fn refill<R: Read>(reader: &mut R, buffer: &mut Vec<u8>) -> Result<bool, Error> {
    let start = buffer.len();
    buffer.resize(start + REFILL_SIZE, 0);
    let res = loop {
        match reader.read(&mut buffer[start..]) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => break other,
        }
    };
    let sz = *res.as_ref().unwrap_or(&0);
    buffer.truncate(start + sz);
    Ok(res? > 0)
}

/// Sequential reader over a raw container
///
/// Records are parsed with the pcap-parser frame parsers from an internal
/// buffer, refilled from the source whenever a parser needs more data.
pub struct RawRecordReader<R: Read> {
    reader: R,
    header: PcapHeader,
    buffer: Vec<u8>,
}

impl<R: Read> RawRecordReader<R> {
    /// Read and check the global header. Blocks until it is complete or the
    /// reader is exhausted.
    pub fn new(mut reader: R) -> Result<Self, Error> {
        let mut buffer = Vec::with_capacity(REFILL_SIZE);
        let header = loop {
            let parsed = match pcap_parser::parse_pcap_header(&buffer) {
                Ok((rem, hdr)) => Some((buffer.len() - rem.len(), hdr)),
                Err(pcap_parser::nom::Err::Incomplete(_)) => None,
                Err(_) => return Err(Error::InvalidFormat("not a pcap file".to_owned())),
            };
            match parsed {
                Some((consumed, hdr)) => {
                    buffer.drain(..consumed);
                    break hdr;
                }
                None => {
                    if !refill(&mut reader, &mut buffer)? {
                        return Err(Error::InvalidFormat(format!(
                            "truncated global header ({} bytes)",
                            buffer.len()
                        )));
                    }
                }
            }
        };
        if header.magic_number != MAGIC_LE && header.magic_number != MAGIC_BE {
            return Err(Error::InvalidFormat(format!(
                "unsupported magic 0x{:08x}",
                header.magic_number
            )));
        }
        debug!(
            "raw container: version {}.{}, snaplen {}, linktype {:?}, bigendian {}",
            header.version_major,
            header.version_minor,
            header.snaplen,
            header.network,
            header.is_bigendian()
        );
        Ok(RawRecordReader {
            reader,
            header,
            buffer,
        })
    }

    pub fn header(&self) -> &PcapHeader {
        &self.header
    }

    pub fn is_bigendian(&self) -> bool {
        self.header.is_bigendian()
    }

    /// Read the next record. Returns `Ok(None)` once the source is exhausted.
    pub fn read_next(&mut self) -> Result<Option<RawRecord>, Error> {
        let bigendian = self.header.is_bigendian();
        loop {
            let res = if bigendian {
                pcap_parser::parse_pcap_frame_be(&self.buffer)
            } else {
                pcap_parser::parse_pcap_frame(&self.buffer)
            };
            let needed = match res {
                Ok((rem, block)) => Ok((
                    self.buffer.len() - rem.len(),
                    RawRecord {
                        ts_sec: block.ts_sec,
                        ts_usec: block.ts_usec,
                        caplen: block.caplen,
                        origlen: block.origlen,
                        data: block.data.to_vec(),
                    },
                )),
                Err(pcap_parser::nom::Err::Incomplete(pcap_parser::nom::Needed::Size(n))) => Err(n.get()),
                Err(pcap_parser::nom::Err::Incomplete(pcap_parser::nom::Needed::Unknown)) => Err(1),
                Err(e) => return Err(Error::InvalidFormat(format!("record: {:?}", e))),
            };
            let needed = match needed {
                Ok((consumed, record)) => {
                    self.buffer.drain(..consumed);
                    trace!(
                        "raw record: ts {}.{:06} caplen {} origlen {}",
                        record.ts_sec,
                        record.ts_usec,
                        record.caplen,
                        record.origlen
                    );
                    return Ok(Some(record));
                }
                Err(n) => n,
            };
            if self.buffer.len() + needed > RECORD_HEADER_SIZE + MAX_READ_RECORD_SIZE {
                return Err(Error::InvalidFormat(format!(
                    "record too large ({} bytes)",
                    self.buffer.len() + needed - RECORD_HEADER_SIZE
                )));
            }
            if !refill(&mut self.reader, &mut self.buffer)? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::InvalidFormat(format!(
                    "truncated record ({} bytes pending)",
                    self.buffer.len()
                )));
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for RawRecordReader<R> {
    type Item = Result<RawRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// Sequential writer of a raw container. The global header is written
/// before the first record, or on `finish` if no record was written.
pub struct RawRecordWriter<W: Write> {
    w: W,
    linktype: Linktype,
    header_written: bool,
}

impl<W: Write> RawRecordWriter<W> {
    pub fn new(w: W) -> Self {
        Self::with_linktype(w, Linktype::ETHERNET)
    }

    pub fn with_linktype(w: W, linktype: Linktype) -> Self {
        RawRecordWriter {
            w,
            linktype,
            header_written: false,
        }
    }

    fn write_header(&mut self) -> Result<(), Error> {
        let mut hdr = PcapHeader::new();
        hdr.snaplen = MAX_RECORD_SIZE as u32;
        hdr.network = self.linktype;
        let s = hdr
            .to_vec_raw()
            .or(Err(Error::Generic("Pcap header serialization failed")))?;
        self.w.write_all(&s)?;
        self.header_written = true;
        Ok(())
    }

    /// Write one record, with `origlen` equal to the payload length
    pub fn write_record(&mut self, data: &[u8], ts_sec: u32, ts_usec: u32) -> Result<(), Error> {
        self.write_block(data, ts_sec, ts_usec, data.len() as u32)
    }

    /// Write a record read from another container, keeping its original length
    pub fn write_raw_record(&mut self, record: &RawRecord) -> Result<(), Error> {
        self.write_block(&record.data, record.ts_sec, record.ts_usec, record.origlen)
    }

    fn write_block(
        &mut self,
        data: &[u8],
        ts_sec: u32,
        ts_usec: u32,
        origlen: u32,
    ) -> Result<(), Error> {
        if data.len() > MAX_RECORD_SIZE {
            return Err(Error::PayloadTooLarge(data.len()));
        }
        if !self.header_written {
            self.write_header()?;
        }
        let record = LegacyPcapBlock {
            ts_sec,
            ts_usec,
            caplen: data.len() as u32,
            origlen,
            data,
        };
        let s = record
            .to_vec_raw()
            .or(Err(Error::Generic("Pcap block serialization failed")))?;
        self.w.write_all(&s)?;
        Ok(())
    }

    /// Write the header if still pending, flush, and return the inner writer
    pub fn finish(mut self) -> Result<W, Error> {
        if !self.header_written {
            self.write_header()?;
        }
        self.w.flush()?;
        Ok(self.w)
    }
}

enum Mode {
    Closed,
    Writing(RawRecordWriter<BufWriter<File>>),
    Reading(RawRecordReader<BufReader<File>>),
}

/// A raw container on disk, open in at most one mode at a time
pub struct RawPacketStore {
    path: PathBuf,
    mode: Mode,
}

impl RawPacketStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        RawPacketStore {
            path: path.as_ref().to_path_buf(),
            mode: Mode::Closed,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.mode, Mode::Closed)
    }

    /// Create (or truncate) the container for writing
    pub fn open_for_write(&mut self) -> Result<(), Error> {
        if self.is_open() {
            return Err(Error::InvalidState("trying to open while already open"));
        }
        let file = File::create(&self.path)?;
        self.mode = Mode::Writing(RawRecordWriter::new(BufWriter::new(file)));
        Ok(())
    }

    /// Open the container for reading and check its global header
    pub fn open_for_read(&mut self) -> Result<(), Error> {
        if self.is_open() {
            return Err(Error::InvalidState("trying to open while already open"));
        }
        let file = File::open(&self.path)?;
        let reader = RawRecordReader::new(BufReader::new(file))?;
        self.mode = Mode::Reading(reader);
        Ok(())
    }

    /// Append one record, opening the container for writing if it is closed
    pub fn write_record(&mut self, data: &[u8], ts_sec: u32, ts_usec: u32) -> Result<(), Error> {
        self.writer()?.write_record(data, ts_sec, ts_usec)
    }

    pub fn write_raw_record(&mut self, record: &RawRecord) -> Result<(), Error> {
        self.writer()?.write_raw_record(record)
    }

    fn writer(&mut self) -> Result<&mut RawRecordWriter<BufWriter<File>>, Error> {
        if let Mode::Closed = self.mode {
            self.open_for_write()?;
        }
        match self.mode {
            Mode::Writing(ref mut w) => Ok(w),
            _ => Err(Error::InvalidState("container is open for reading")),
        }
    }

    /// Read the next record. Returns `Ok(None)` at end of container.
    pub fn read_next(&mut self) -> Result<Option<RawRecord>, Error> {
        match self.mode {
            Mode::Reading(ref mut r) => r.read_next(),
            _ => Err(Error::InvalidState("container is not open for reading")),
        }
    }

    /// Lazily iterate over the remaining records
    pub fn records(&mut self) -> impl Iterator<Item = Result<RawRecord, Error>> + '_ {
        std::iter::from_fn(move || self.read_next().transpose())
    }

    /// Release the underlying handle. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), Error> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Writing(w) => {
                w.finish()?;
            }
            Mode::Reading(_) | Mode::Closed => (),
        }
        Ok(())
    }
}

impl Drop for RawPacketStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

enum IndexState<R: Read> {
    Pending(R),
    Ready(RawRecordReader<R>),
    Failed,
}

/// Forward-only lookup of raw records by 1-based sequence number.
///
/// The global header is read on first lookup, so that building the index
/// never blocks on a source that is not producing yet.
pub struct RawIndex<R: Read> {
    state: IndexState<R>,
    current: u64,
    last: Option<RawRecord>,
}

impl<R: Read> RawIndex<R> {
    pub fn new(reader: R) -> Self {
        RawIndex {
            state: IndexState::Pending(reader),
            current: 0,
            last: None,
        }
    }

    /// Number of the last record read
    pub fn position(&self) -> u64 {
        self.current
    }

    fn reader(&mut self) -> Result<&mut RawRecordReader<R>, Error> {
        if let IndexState::Pending(_) = self.state {
            if let IndexState::Pending(r) = std::mem::replace(&mut self.state, IndexState::Failed)
            {
                self.state = IndexState::Ready(RawRecordReader::new(r)?);
            }
        }
        match self.state {
            IndexState::Ready(ref mut r) => Ok(r),
            _ => Err(Error::InvalidState("raw index source is unusable")),
        }
    }

    /// Fetch record `seq`, skipping the records in between.
    ///
    /// Sequence numbers must be non-decreasing. Returns `Ok(None)` if the
    /// source ends before `seq`.
    pub fn get(&mut self, seq: u64) -> Result<Option<RawRecord>, Error> {
        if seq == 0 || seq < self.current {
            return Err(Error::InvalidState("raw index cannot seek backwards"));
        }
        if seq == self.current {
            return Ok(self.last.clone());
        }
        while self.current < seq {
            let record = self.reader()?.read_next()?;
            match record {
                Some(r) => {
                    self.current += 1;
                    self.last = Some(r);
                }
                None => {
                    self.last = None;
                    return Ok(None);
                }
            }
        }
        Ok(self.last.clone())
    }
}
