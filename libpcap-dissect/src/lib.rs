//! Drive an external dissector (tshark) over captured packets, and turn its
//! PDML output into navigable packet trees.
//!
//! Packets come from a capture file, a live capture (dumpcap), or an
//! in-memory list. Each decoded [`Packet`] is handed to a [`PacketHandler`],
//! optionally with its raw bytes attached.

mod archive;
pub mod callbacks;
mod config;
mod context;
mod duration;
mod engine;
mod error;
mod fanout;
mod field_types;
mod handler;
mod node;
mod packet;
pub mod pdml;
mod raw_store;
mod scanner;
mod source;
pub mod tshark;

pub use archive::{archive, ArchiveReader, ArchiveWriter, DEFAULT_ARCHIVE_MAX_SIZE};
pub use callbacks::{filter_packets, sample_packets, PacketCollector, PcapSaver, PrintPacket, PrintSummary};
pub use config::Config;
pub use context::CaptureContext;
pub use duration::Duration;
pub use engine::{drive, Capture, InMemPacket};
pub use error::Error;
pub use fanout::PipeFanout;
pub use field_types::{FieldType, FieldTypes, FieldValue};
pub use handler::PacketHandler;
pub use node::{field_name, make_name, Attributes, FieldGroup, Node, Role, Walk};
pub use packet::{Packet, TRANSPORT_LAYERS};
pub use raw_store::{RawIndex, RawPacketStore, RawRecord, RawRecordReader, RawRecordWriter};
pub use scanner::{StreamTagScanner, DEFAULT_BATCH_SIZE};
pub use source::{FileSource, LiveSource, PacketsSource};
pub use tshark::{Decryption, DecoderOptions, EncryptionStandard, Tshark};
