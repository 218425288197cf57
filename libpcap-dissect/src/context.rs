use crate::duration::Duration;

/// Capture context, given to the packet handler with every packet
#[derive(Clone, Debug, Default)]
pub struct CaptureContext {
    /// Index of current packet in the session (1-based)
    pub pcap_index: u64,
    /// Timestamp of first packet seen
    pub first_packet_ts: Duration,
    /// Timestamp of current packet, relative to the first one
    pub rel_ts: Duration,
}

impl CaptureContext {
    /// Account for a new packet, captured at `ts` if known
    pub(crate) fn advance(&mut self, ts: Option<Duration>) {
        self.pcap_index += 1;
        match ts {
            Some(ts) => {
                if self.first_packet_ts.is_null() {
                    self.first_packet_ts = ts;
                }
                // an underflow is weird but not critical
                self.rel_ts = ts - self.first_packet_ts;
            }
            None => self.rel_ts = Duration::default(),
        }
    }
}
