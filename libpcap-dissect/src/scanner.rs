//! Incremental extraction of delimited records from a byte stream
//!
//! The decoder writes one `<packet>...</packet>` element per packet on its
//! standard output. Reads from the pipe split those elements at arbitrary
//! points, so the scanner keeps the bytes that do not form a complete record
//! yet and retries when more data arrives.

use crate::error::Error;
use memchr::memmem;
use std::io::{self, Read};
use tracing::trace;

pub const DEFAULT_BATCH_SIZE: usize = 4096;

pub struct StreamTagScanner {
    opening: Vec<u8>,
    closing: Vec<u8>,
    residual: Vec<u8>,
    batch_size: usize,
    eof: bool,
}

impl Default for StreamTagScanner {
    fn default() -> Self {
        StreamTagScanner::new("packet")
    }
}

impl StreamTagScanner {
    /// Build a scanner for elements named `tag_name`
    pub fn new(tag_name: &str) -> Self {
        StreamTagScanner {
            opening: format!("<{tag_name}>").into_bytes(),
            closing: format!("</{tag_name}>").into_bytes(),
            residual: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            eof: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Bytes received but not yet part of a complete record
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }

    /// True once the source reported end of stream
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Locate the first complete record in the buffered data, remove it and
    /// everything before it, and return it.
    ///
    /// The closing delimiter is searched first, then the nearest opening
    /// delimiter before it.
    pub fn extract(&mut self) -> Option<Vec<u8>> {
        let end = memmem::find(&self.residual, &self.closing)? + self.closing.len();
        let start = memmem::rfind(&self.residual[..end], &self.opening).unwrap_or(0);
        let record = self.residual[start..end].to_vec();
        self.residual.drain(..end);
        Some(record)
    }

    /// Append one chunk and return every record completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.residual.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(r) = self.extract() {
            records.push(r);
        }
        records
    }

    /// Return the next complete record, reading from `reader` as needed.
    ///
    /// Returns `Ok(None)` on a zero-length read. If the stream ends in the
    /// middle of a record, `MalformedStream` is returned. There is no
    /// timeout: a record that never closes blocks until the writer exits.
    pub fn next_record<R: Read>(&mut self, reader: &mut R) -> Result<Option<Vec<u8>>, Error> {
        loop {
            if let Some(record) = self.extract() {
                return Ok(Some(record));
            }
            if self.eof {
                return Ok(None);
            }
            let mut chunk = vec![0u8; self.batch_size];
            let sz = match reader.read(&mut chunk) {
                Ok(sz) => sz,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            trace!("scanner: read {} bytes", sz);
            if sz == 0 {
                self.eof = true;
                if memmem::find(&self.residual, &self.opening).is_some() {
                    return Err(Error::MalformedStream(format!(
                        "stream ended inside a record ({} bytes pending)",
                        self.residual.len()
                    )));
                }
                return Ok(None);
            }
            self.residual.extend_from_slice(&chunk[..sz]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: &[u8] = b"<a><record>X</record><record>Y</record><record>Z";

    #[test]
    fn any_split_point() {
        for split in 0..=INPUT.len() {
            let mut scanner = StreamTagScanner::new("record");
            let mut records = scanner.feed(&INPUT[..split]);
            records.extend(scanner.feed(&INPUT[split..]));
            assert_eq!(
                records,
                vec![b"<record>X</record>".to_vec(), b"<record>Y</record>".to_vec()],
                "split at {split}"
            );
            assert_eq!(scanner.residual(), b"<record>Z");
        }
    }

    #[test]
    fn no_record_yet() {
        let mut scanner = StreamTagScanner::new("record");
        assert!(scanner.feed(b"<record>partial").is_empty());
        assert_eq!(scanner.residual(), b"<record>partial");
    }

    /// Reader returning at most `n` bytes per call
    struct Trickle<'a> {
        data: &'a [u8],
        n: usize,
    }

    impl<'a> Read for Trickle<'a> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let sz = self.n.min(buf.len()).min(self.data.len());
            buf[..sz].copy_from_slice(&self.data[..sz]);
            self.data = &self.data[sz..];
            Ok(sz)
        }
    }

    #[test]
    fn pull_from_reader() {
        let data = b"<?xml version=\"1.0\"?>\n<pdml>\n<packet><proto/></packet>\n<packet>2</packet>\n</pdml>\n";
        for n in [1, 3, 7, 4096] {
            let mut reader = Trickle { data, n };
            let mut scanner = StreamTagScanner::default().with_batch_size(5);
            let mut records = Vec::new();
            while let Some(r) = scanner.next_record(&mut reader).expect("next") {
                records.push(r);
            }
            assert_eq!(
                records,
                vec![b"<packet><proto/></packet>".to_vec(), b"<packet>2</packet>".to_vec()]
            );
            assert!(scanner.is_eof());
        }
    }

    #[test]
    fn truncated_stream() {
        let mut reader = Trickle {
            data: b"<packet>1</packet><packet><proto",
            n: 8,
        };
        let mut scanner = StreamTagScanner::default();
        assert!(scanner.next_record(&mut reader).unwrap().is_some());
        assert!(matches!(
            scanner.next_record(&mut reader),
            Err(Error::MalformedStream(_))
        ));
    }
}
