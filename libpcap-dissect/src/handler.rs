use crate::context::CaptureContext;
use crate::error::Error;
use crate::packet::Packet;

/// Common trait for packet handlers (the per-packet callback of a capture)
///
/// Closures taking `(Packet, &CaptureContext)` are handlers too.
pub trait PacketHandler {
    /// Initialization function, called before the first packet (optional)
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Callback function for every decoded packet. Returning an error stops
    /// the capture.
    fn handle_packet(&mut self, packet: Packet, ctx: &CaptureContext) -> Result<(), Error>;

    /// Teardown function, called after the last packet (optional)
    fn teardown(&mut self) {}
}

impl<F> PacketHandler for F
where
    F: FnMut(Packet, &CaptureContext) -> Result<(), Error>,
{
    fn handle_packet(&mut self, packet: Packet, ctx: &CaptureContext) -> Result<(), Error> {
        self(packet, ctx)
    }
}
