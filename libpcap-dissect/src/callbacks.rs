//! Stock packet handlers, and helpers built on them

use crate::config::Config;
use crate::context::CaptureContext;
use crate::engine::{Capture, InMemPacket};
use crate::error::Error;
use crate::handler::PacketHandler;
use crate::packet::Packet;
use crate::raw_store::RawPacketStore;
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Print every packet in full, layer by layer
pub struct PrintPacket<W: Write> {
    out: W,
}

impl PrintPacket<io::Stdout> {
    pub fn stdout() -> Self {
        PrintPacket { out: io::stdout() }
    }
}

impl<W: Write> PrintPacket<W> {
    pub fn new(out: W) -> Self {
        PrintPacket { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> PacketHandler for PrintPacket<W> {
    fn handle_packet(&mut self, packet: Packet, _ctx: &CaptureContext) -> Result<(), Error> {
        writeln!(self.out, "{}", packet)?;
        Ok(())
    }

    fn teardown(&mut self) {
        let _ = self.out.flush();
    }
}

/// Print one line per packet, such as `<UDP/DNS Packet>`
pub struct PrintSummary<W: Write> {
    out: W,
}

impl PrintSummary<io::Stdout> {
    pub fn stdout() -> Self {
        PrintSummary { out: io::stdout() }
    }
}

impl<W: Write> PrintSummary<W> {
    pub fn new(out: W) -> Self {
        PrintSummary { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> PacketHandler for PrintSummary<W> {
    fn handle_packet(&mut self, packet: Packet, _ctx: &CaptureContext) -> Result<(), Error> {
        writeln!(self.out, "{}", packet.summary())?;
        Ok(())
    }

    fn teardown(&mut self) {
        let _ = self.out.flush();
    }
}

/// Keep every packet
#[derive(Default)]
pub struct PacketCollector {
    packets: Vec<Packet>,
}

impl PacketCollector {
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
}

impl PacketHandler for PacketCollector {
    fn handle_packet(&mut self, packet: Packet, _ctx: &CaptureContext) -> Result<(), Error> {
        self.packets.push(packet);
        Ok(())
    }
}

/// Save the raw bytes of every packet to a raw container. Packets decoded
/// without raw bytes are skipped.
pub struct PcapSaver {
    store: RawPacketStore,
    saved: u64,
    skipped: u64,
}

impl PcapSaver {
    /// Create (or truncate) the container at `path`
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut store = RawPacketStore::new(path);
        store.open_for_write()?;
        Ok(PcapSaver {
            store,
            saved: 0,
            skipped: 0,
        })
    }

    pub fn saved(&self) -> u64 {
        self.saved
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Flush and close the container
    pub fn close(&mut self) -> Result<(), Error> {
        self.store.close()
    }
}

impl PacketHandler for PcapSaver {
    fn handle_packet(&mut self, packet: Packet, _ctx: &CaptureContext) -> Result<(), Error> {
        match packet.raw_record() {
            Some(record) => {
                self.store.write_raw_record(record)?;
                self.saved += 1;
            }
            None => {
                warn!("packet {} has no raw bytes, not saved", packet.number());
                self.skipped += 1;
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        debug!(
            "{}: {} packets saved, {} skipped",
            self.store.path().display(),
            self.saved,
            self.skipped
        );
        if let Err(e) = self.store.close() {
            warn!("could not close {}: {}", self.store.path().display(), e);
        }
    }
}

/// Decode `packets` and return those matching `display_filter`
pub fn filter_packets<I>(packets: I, display_filter: &str, config: &Config) -> Result<Vec<Packet>, Error>
where
    I: IntoIterator<Item = InMemPacket>,
{
    let mut capture = Capture::in_memory(packets, config)?.display_filter(display_filter);
    let mut collector = PacketCollector::default();
    capture.apply_on_packets(&mut collector, None, None)?;
    Ok(collector.into_packets())
}

/// Capture up to `packet_count` packets on `interface`, for at most
/// `timeout` seconds
pub fn sample_packets(
    interface: &str,
    timeout: u32,
    packet_count: usize,
    config: &Config,
) -> Result<Vec<Packet>, Error> {
    let mut capture = Capture::live(vec![interface.to_owned()], None, config)?;
    let mut collector = PacketCollector::default();
    capture.apply_on_packets(&mut collector, Some(timeout), Some(packet_count))?;
    Ok(collector.into_packets())
}
