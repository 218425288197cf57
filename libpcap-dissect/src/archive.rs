//! Bounded in-memory byte queue between the fan-out worker and the raw
//! packet index.
//!
//! The writer never blocks: when the bytes queued but not yet read exceed the
//! capacity, the write fails with `BufferOverrun` and the queue is marked as
//! failed. Bytes are never dropped while the reader is alive.

use crate::error::Error;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default archive bound (about 20MB)
pub const DEFAULT_ARCHIVE_MAX_SIZE: usize = 4096 * 5000;

struct Shared {
    capacity: usize,
    in_flight: AtomicUsize,
    overrun: AtomicBool,
    reader_closed: AtomicBool,
}

/// Create a connected writer/reader pair bounded to `capacity` bytes
pub fn archive(capacity: usize) -> (ArchiveWriter, ArchiveReader) {
    let (tx, rx) = unbounded();
    let shared = Arc::new(Shared {
        capacity,
        in_flight: AtomicUsize::new(0),
        overrun: AtomicBool::new(false),
        reader_closed: AtomicBool::new(false),
    });
    let writer = ArchiveWriter {
        tx,
        shared: shared.clone(),
    };
    let reader = ArchiveReader {
        rx,
        shared,
        current: Vec::new(),
        pos: 0,
    };
    (writer, reader)
}

pub struct ArchiveWriter {
    tx: Sender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl ArchiveWriter {
    /// Queue a copy of `data`. Fails if the queue would exceed its capacity.
    /// Once the reader is dropped, data is discarded.
    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        if self.shared.reader_closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let capacity = self.shared.capacity;
        let total = self.shared.in_flight.fetch_add(data.len(), Ordering::SeqCst) + data.len();
        if total > capacity {
            self.shared.overrun.store(true, Ordering::SeqCst);
            return Err(Error::BufferOverrun { capacity });
        }
        if self.tx.send(data.to_vec()).is_err() {
            // reader is gone, nobody will ever ask for these bytes
            self.shared.in_flight.fetch_sub(data.len(), Ordering::SeqCst);
            debug!("archive: reader closed, discarding {} bytes", data.len());
        }
        Ok(())
    }

    /// Bytes written and not yet taken by the reader
    pub fn pending(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }
}

/// Blocking reader half. Returns end of stream once the writer is dropped
/// and every queued byte was read, or the overrun error if the writer failed.
pub struct ArchiveReader {
    rx: Receiver<Vec<u8>>,
    shared: Arc<Shared>,
    current: Vec<u8>,
    pos: usize,
}

impl ArchiveReader {
    pub fn is_overrun(&self) -> bool {
        self.shared.overrun.load(Ordering::SeqCst)
    }
}

impl Read for ArchiveReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.shared.in_flight.fetch_sub(chunk.len(), Ordering::SeqCst);
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) if self.is_overrun() => {
                    let capacity = self.shared.capacity;
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        Error::BufferOverrun { capacity },
                    ));
                }
                Err(_) => return Ok(0),
            }
        }
        let sz = (self.current.len() - self.pos).min(buf.len());
        buf[..sz].copy_from_slice(&self.current[self.pos..self.pos + sz]);
        self.pos += sz;
        Ok(sz)
    }
}

impl Drop for ArchiveReader {
    fn drop(&mut self) {
        self.shared.reader_closed.store(true, Ordering::SeqCst);
    }
}
