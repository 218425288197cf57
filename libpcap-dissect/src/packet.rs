use crate::duration::Duration;
use crate::error::Error;
use crate::field_types::FieldTypes;
use crate::node::Node;
use crate::pdml::{self, Element};
use crate::raw_store::RawRecord;
use serde::Serialize;
use std::fmt;

/// Layer names checked, in order, to find the transport layer
pub const TRANSPORT_LAYERS: &[&str] = &["tcp", "udp"];

/// A decoded packet: general information, frame and protocol layers, plus
/// the raw bytes if they were tracked for this capture.
#[derive(Clone, Debug, Serialize)]
pub struct Packet {
    number: u64,
    length: u32,
    captured_length: u32,
    sniff_timestamp: Option<String>,
    interface_captured: Option<String>,
    geninfo: Node,
    frame: Node,
    layers: Vec<Node>,
    raw: Option<RawRecord>,
}

fn required_u64(geninfo: &Node, name: &str) -> Result<u64, Error> {
    geninfo
        .get(name)
        .and_then(|f| f.value())
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| Error::Pdml(format!("missing or invalid general information field {name}")))
}

fn required_u32(geninfo: &Node, name: &str) -> Result<u32, Error> {
    let v = required_u64(geninfo, name)?;
    u32::try_from(v)
        .map_err(|_| Error::Pdml(format!("general information field {name} out of range: {v}")))
}

impl Packet {
    /// Build a packet from one complete decoded record
    pub fn from_pdml(record: &[u8], types: &FieldTypes) -> Result<Packet, Error> {
        let elt = pdml::parse_record(record)?;
        Packet::from_element(&elt, types)
    }

    pub fn from_element(elt: &Element, types: &FieldTypes) -> Result<Packet, Error> {
        let mut protos = elt.children_named("proto").map(|p| Node::layer(p, types));
        let (geninfo, frame) = match (protos.next(), protos.next()) {
            (Some(g), Some(f)) => (g, f),
            _ => {
                return Err(Error::Pdml(
                    "record must start with general information and frame".to_owned(),
                ))
            }
        };
        let layers: Vec<Node> = protos.collect();
        let number = required_u64(&geninfo, "num")?;
        let length = required_u32(&geninfo, "len")?;
        let captured_length = required_u32(&geninfo, "caplen")?;
        let sniff_timestamp = geninfo
            .get("timestamp")
            .and_then(|f| f.attrs().value.clone());
        let interface_captured = frame
            .get("interface_id")
            .and_then(|f| f.value())
            .map(str::to_owned);
        Ok(Packet {
            number,
            length,
            captured_length,
            sniff_timestamp,
            interface_captured,
            geninfo,
            frame,
            layers,
            raw: None,
        })
    }

    /// Packet number assigned by the decoder (1-based, in capture order)
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Length of the packet on the wire
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Number of bytes actually captured
    pub fn captured_length(&self) -> u32 {
        self.captured_length
    }

    /// Capture time as printed by the decoder (seconds since the epoch)
    pub fn sniff_timestamp(&self) -> Option<&str> {
        self.sniff_timestamp.as_deref()
    }

    /// Id of the interface the packet was captured on
    pub fn interface_captured(&self) -> Option<&str> {
        self.interface_captured.as_deref()
    }

    pub fn geninfo(&self) -> &Node {
        &self.geninfo
    }

    pub fn frame(&self) -> &Node {
        &self.frame
    }

    /// Protocol layers, lowest first
    pub fn layers(&self) -> &[Node] {
        &self.layers
    }

    pub fn layer_at(&self, idx: usize) -> Option<&Node> {
        self.layers.get(idx)
    }

    /// Lowest layer with this name (case-insensitive)
    pub fn layer(&self, name: &str) -> Option<&Node> {
        let name = name.to_lowercase();
        self.layers.iter().find(|l| l.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layer(name).is_some()
    }

    /// Upper-cased name of the last layer (`FRAME` if there are no layers)
    pub fn highest_layer(&self) -> String {
        self.layers
            .last()
            .unwrap_or(&self.frame)
            .name()
            .to_uppercase()
    }

    pub fn transport_layer(&self) -> Option<&'static str> {
        TRANSPORT_LAYERS.iter().copied().find(|l| self.contains(l))
    }

    /// Parsed capture time. A negative fractional part is discarded.
    pub fn sniff_time(&self) -> Option<Duration> {
        self.sniff_timestamp.as_deref().and_then(Duration::parse_secs)
    }

    /// Attach raw bytes. This can be done only once.
    pub fn attach_raw(&mut self, record: RawRecord) -> Result<(), Error> {
        if self.raw.is_some() {
            return Err(Error::InvalidState("raw bytes already attached"));
        }
        self.raw = Some(record);
        Ok(())
    }

    pub fn has_raw(&self) -> bool {
        self.raw.is_some()
    }

    pub fn raw_record(&self) -> Option<&RawRecord> {
        self.raw.as_ref()
    }

    /// All raw bytes of the packet, or `None` if raw bytes were not tracked
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_ref().map(|r| r.data.as_slice())
    }

    /// Raw bytes covered by a layer or field of this packet.
    ///
    /// Returns `None` if raw bytes were not tracked, if the node has no
    /// position or size, or if the range is outside the captured bytes.
    pub fn raw_of(&self, node: &Node) -> Option<&[u8]> {
        let range = node.raw_range()?;
        self.raw()?.get(range)
    }

    /// Short description, such as `<UDP/DNS Packet>`
    pub fn summary(&self) -> String {
        let highest = self.highest_layer();
        match self.transport_layer() {
            Some(t) if !t.eq_ignore_ascii_case(&highest) => {
                format!("<{}/{} Packet>", t.to_uppercase(), highest)
            }
            _ => format!("<{} Packet>", highest),
        }
    }

    /// Names of the fields of every layer, as a tree
    pub fn tree_string(&self, show_hidden: bool) -> String {
        let mut s = String::new();
        for layer in &self.layers {
            s.push_str("Layer: ");
            s.push_str(layer.name());
            s.push('\n');
            for line in layer.tree_string(show_hidden).lines() {
                s.push('\t');
                s.push_str(line);
                s.push('\n');
            }
        }
        s
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Packet (Length: {})", self.length)?;
        for layer in &self.layers {
            write!(f, "{}", layer)?;
        }
        Ok(())
    }
}

/// Decoded record of an Ethernet/IPv4/UDP/DNS packet, `len` bytes long
#[cfg(test)]
pub(crate) fn test_record(num: u64, len: u32) -> String {
    format!(
        r#"<packet>
  <proto name="geninfo" pos="0" showname="General information" size="{len}">
    <field name="num" pos="0" show="{num}" showname="Number" value="{num:x}" size="{len}"/>
    <field name="len" pos="0" show="{len}" showname="Frame Length" value="{len:x}" size="{len}"/>
    <field name="caplen" pos="0" show="{len}" showname="Captured Length" value="{len:x}" size="{len}"/>
    <field name="timestamp" pos="0" show="Jan  1, 2020 00:00:00.000000000 UTC" showname="Captured Time" value="{ts}.{num:06}" size="{len}"/>
  </proto>
  <proto name="frame" showname="Frame {num}: {len} bytes on wire" size="{len}" pos="0">
    <field name="frame.interface_id" showname="Interface id: 0 (eth0)" show="0" size="0" pos="0"/>
    <field name="frame.len" showname="Frame Length: {len} bytes" show="{len}" size="0" pos="0"/>
  </proto>
  <proto name="eth" showname="Ethernet II" size="14" pos="0">
    <field name="eth.dst" showname="Destination: ff:ff:ff:ff:ff:ff" size="6" pos="0" show="ff:ff:ff:ff:ff:ff" value="ffffffffffff"/>
    <field name="eth.type" showname="Type: IPv4 (0x0800)" size="2" pos="12" show="0x0800" value="0800"/>
  </proto>
  <proto name="ip" showname="Internet Protocol Version 4" size="20" pos="14">
    <field name="ip.version" showname="0100 .... = Version: 4" size="1" pos="14" show="4" value="45"/>
  </proto>
  <proto name="udp" showname="User Datagram Protocol" size="8" pos="34">
    <field name="udp.srcport" showname="Source Port: 53" size="2" pos="34" show="53" value="0035"/>
  </proto>
  <proto name="dns" showname="Domain Name System (query)" size="12" pos="42"/>
</packet>"#,
        num = num,
        len = len,
        ts = 1_577_836_800u64 + num,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet::from_pdml(test_record(3, 60).as_bytes(), &FieldTypes::new()).expect("packet")
    }

    fn raw_record() -> RawRecord {
        let data: Vec<u8> = (0..60u8).collect();
        RawRecord {
            ts_sec: 1_577_836_803,
            ts_usec: 3,
            caplen: 60,
            origlen: 60,
            data,
        }
    }

    #[test]
    fn metadata() {
        let p = sample();
        assert_eq!(p.number(), 3);
        assert_eq!(p.length(), 60);
        assert_eq!(p.captured_length(), 60);
        assert_eq!(p.interface_captured(), Some("0"));
        assert_eq!(p.sniff_timestamp(), Some("1577836803.000003"));
        assert_eq!(p.sniff_time(), Some(Duration::new(1_577_836_803, 3)));
        let names: Vec<_> = p.layers().iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["eth", "ip", "udp", "dns"]);
        assert_eq!(p.geninfo().name(), "geninfo");
        assert_eq!(p.frame().name(), "frame");
    }

    #[test]
    fn layer_access() {
        let p = sample();
        assert!(p.contains("UDP"));
        assert!(!p.contains("tcp"));
        assert_eq!(p.layer("Ip").map(|l| l.name()), Some("ip"));
        assert_eq!(p.layer_at(0).map(|l| l.name()), Some("eth"));
        assert!(p.layer_at(4).is_none());
        assert_eq!(p.highest_layer(), "DNS");
        assert_eq!(p.transport_layer(), Some("udp"));
        assert_eq!(p.summary(), "<UDP/DNS Packet>");
    }

    #[test]
    fn raw_addressing() {
        let mut p = sample();
        let field = Node::field(
            &pdml::parse_record(br#"<field name="x" pos="14" size="2"/>"#).unwrap(),
            "",
            &FieldTypes::new(),
        );
        assert_eq!(p.raw(), None);
        assert_eq!(p.raw_of(&field), None);
        p.attach_raw(raw_record()).unwrap();
        assert_eq!(p.raw_of(&field), Some(&[14u8, 15][..]));
        let ip = p.layer("ip").unwrap();
        assert_eq!(p.raw_of(ip).map(|b| b.len()), Some(20));
        let out_of_range = Node::field(
            &pdml::parse_record(br#"<field name="x" pos="59" size="2"/>"#).unwrap(),
            "",
            &FieldTypes::new(),
        );
        assert_eq!(p.raw_of(&out_of_range), None);
        assert!(matches!(
            p.attach_raw(raw_record()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn rendering() {
        let p = sample();
        let s = p.to_string();
        assert!(s.starts_with("Packet (Length: 60)\nLayer ETH:\n\tDestination: ff:ff:ff:ff:ff:ff\n"));
        assert!(s.contains("Layer UDP:\n\tSource Port: 53\n"));
        assert!(s.ends_with("Layer DNS:\n"));
        assert!(p.tree_string(false).starts_with("Layer: eth\n\tdst\n\ttype\n"));
    }

    #[test]
    fn json_export() {
        let mut p = sample();
        p.attach_raw(raw_record()).unwrap();
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["number"], 3);
        assert_eq!(v["sniff_timestamp"], "1577836803.000003");
        assert_eq!(v["layers"][0]["name"], "eth");
        assert_eq!(v["layers"][0]["role"], "layer");
        assert_eq!(v["layers"][2]["children"][0]["attrs"]["show"], "53");
        assert_eq!(v["raw"]["caplen"], 60);
        assert!(v["raw"].get("data").is_none());
    }

    #[test]
    fn invalid_records() {
        let types = FieldTypes::new();
        assert!(matches!(
            Packet::from_pdml(b"<packet><proto name=\"geninfo\"/></packet>", &types),
            Err(Error::Pdml(_))
        ));
        assert!(matches!(
            Packet::from_pdml(
                b"<packet><proto name=\"geninfo\"/><proto name=\"frame\"/></packet>",
                &types
            ),
            Err(Error::Pdml(_))
        ));
        assert!(Packet::from_pdml(b"<packet><proto", &types).is_err());
    }

    #[test]
    fn length_out_of_range() {
        let types = FieldTypes::new();
        let record = test_record(1, 60).replace(
            r#"show="60" showname="Frame Length""#,
            r#"show="4294967296" showname="Frame Length""#,
        );
        match Packet::from_pdml(record.as_bytes(), &types) {
            Err(Error::Pdml(msg)) => assert!(msg.contains("len"), "{}", msg),
            other => panic!("unexpected result {:?}", other.map(|p| p.length())),
        }
        let record = test_record(1, 60).replace(
            r#"show="60" showname="Captured Length""#,
            r#"show="4294967356" showname="Captured Length""#,
        );
        assert!(matches!(
            Packet::from_pdml(record.as_bytes(), &types),
            Err(Error::Pdml(_))
        ));
    }
}
