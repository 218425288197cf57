use crate::archive::ArchiveWriter;
use crate::error::Error;
use std::io::{self, Read, Write};
use std::thread;
use tracing::{debug, warn};

/// Worker copying a live capture stream to the decoder and to the raw
/// packet archive.
///
/// Both sinks receive chunks in source order. When the source is exhausted,
/// the decoder input is closed so that the decoder sees end of input; the
/// archive stays readable until everything queued has been consumed.
pub struct PipeFanout {
    handler: Option<thread::JoinHandle<Result<u64, Error>>>,
}

impl PipeFanout {
    pub fn spawn<R, W>(
        source: R,
        decoder: W,
        archive: Option<ArchiveWriter>,
        batch_size: usize,
    ) -> Result<Self, Error>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let handler = thread::Builder::new()
            .name("pipe-fanout".to_owned())
            .spawn(move || distribute(source, decoder, archive, batch_size))?;
        Ok(PipeFanout {
            handler: Some(handler),
        })
    }

    /// Wait for the worker to end and return the number of bytes copied.
    /// Calling it again after the first join returns `Ok(0)`.
    pub fn join(&mut self) -> Result<u64, Error> {
        match self.handler.take() {
            Some(h) => h
                .join()
                .map_err(|_| Error::Generic("fan-out worker panicked"))?,
            None => Ok(0),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handler.as_ref().map_or(true, |h| h.is_finished())
    }
}

fn distribute<R: Read, W: Write>(
    mut source: R,
    decoder: W,
    archive: Option<ArchiveWriter>,
    batch_size: usize,
) -> Result<u64, Error> {
    let mut decoder = decoder;
    let mut buf = vec![0u8; batch_size.max(1)];
    let mut total = 0u64;
    loop {
        let sz = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(sz) => sz,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        let chunk = &buf[..sz];
        match decoder.write_all(chunk).and_then(|_| decoder.flush()) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("fan-out: decoder input closed, stopping after {total} bytes");
                return Ok(total);
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(ref a) = archive {
            if let Err(e) = a.write(chunk) {
                warn!("fan-out: {e}");
                return Err(e);
            }
        }
        total += sz as u64;
    }
    debug!("fan-out: source exhausted after {total} bytes");
    // decoder input is closed on return, signaling end of input
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::archive;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn input() -> Vec<u8> {
        (0..10_000u32).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn both_sinks_get_same_bytes() {
        let data = input();
        let sink = SharedSink::default();
        let (w, mut r) = archive(1 << 20);
        let mut fanout =
            PipeFanout::spawn(Cursor::new(data.clone()), sink.clone(), Some(w), 128).unwrap();
        let mut archived = Vec::new();
        r.read_to_end(&mut archived).unwrap();
        assert_eq!(fanout.join().unwrap(), data.len() as u64);
        assert_eq!(fanout.join().unwrap(), 0);
        assert_eq!(*sink.0.lock().unwrap(), data);
        assert_eq!(archived, data);
    }

    #[test]
    fn stalled_archive_overruns() {
        let data = input();
        let (w, r) = archive(1000);
        let mut fanout =
            PipeFanout::spawn(Cursor::new(data), SharedSink::default(), Some(w), 256).unwrap();
        assert!(matches!(
            fanout.join(),
            Err(Error::BufferOverrun { capacity: 1000 })
        ));
        assert!(r.is_overrun());
    }

    #[test]
    fn decoder_gone() {
        let mut fanout = PipeFanout::spawn(Cursor::new(input()), ClosedPipe, None, 64).unwrap();
        assert_eq!(fanout.join().unwrap(), 0);
        assert!(fanout.is_finished());
    }
}
