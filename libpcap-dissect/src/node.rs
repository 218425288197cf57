//! Decoded protocol tree: one node type for layers and fields
//!
//! A node keeps its children in source order, and an index from resolved
//! name to the positions of every child sharing that name. Looking a name up
//! returns the first occurrence; [`Node::group`] gives all of them.

use crate::field_types::{FieldTypes, FieldValue};
use crate::pdml::Element;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::ops::Range;

/// Name of the layer holding bytes no protocol was recognized for
pub const DATA_LAYER: &str = "data";
/// Prefix of the names of fields marked hidden by the decoder
pub const HIDDEN_PREFIX: &str = "_hid_";
/// Prefix added to names that do not start with a letter or `_`
pub const FIELD_PREFIX: &str = "field_";

const DATA_WRAPPER: &str = "fake-field-wrapper";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Layer,
    Field,
}

/// Attributes of a decoded element. Absent attributes are `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Attributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub showname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    pub hide: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unmaskedvalue: Option<String>,
}

impl Attributes {
    pub fn from_element(elt: &Element) -> Self {
        let text = |k: &str| elt.attr(k).map(str::to_owned);
        let number = |k: &str| elt.attr(k).and_then(|s| s.parse().ok());
        Attributes {
            name: text("name"),
            showname: text("showname"),
            show: text("show"),
            value: text("value"),
            pos: number("pos"),
            size: number("size"),
            hide: elt.attr("hide") == Some("yes"),
            unmaskedvalue: text("unmaskedvalue"),
        }
    }
}

/// Turn arbitrary text into an identifier: runs of characters that are not
/// alphanumeric become one `_`, leading ones are dropped. Returns `None` if
/// the text has no alphanumeric character.
pub fn make_name(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut last_alnum = false;
    for c in s.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_alnum = true;
        } else {
            if last_alnum {
                out.push('_');
            }
            last_alnum = false;
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Remove the parent name from a raw field name (`ip.flags.df` in `flags`
/// gives `.df`). Underscores in the parent name stand for dots.
fn strip_parent<'a>(raw: &'a str, parent: &str) -> &'a str {
    if parent.is_empty() {
        return raw;
    }
    let parent = parent.replace('_', ".");
    match raw.find(&parent) {
        Some(idx) => {
            let rest = &raw[idx + parent.len()..];
            match rest.find(&parent) {
                Some(end) => &rest[..end],
                None => rest,
            }
        }
        None => raw,
    }
}

fn opt_display(v: Option<usize>) -> String {
    v.map_or_else(|| "none".to_owned(), |v| v.to_string())
}

/// Resolve the name of a field below `parent`.
///
/// The first usable of: raw name without the parent prefix, text of `show`
/// before the first `:`, `showname`, then `pos_<pos>_size_<size>`. Hidden
/// fields are then prefixed with `_hid_`, and names that do not start with a
/// letter or `_` with `field_`.
pub fn field_name(attrs: &Attributes, parent: &str) -> String {
    let mut name = attrs
        .name
        .as_deref()
        .and_then(|raw| make_name(strip_parent(raw, parent)))
        .or_else(|| {
            attrs
                .show
                .as_deref()
                .and_then(|s| make_name(s.split(':').next().unwrap_or_default()))
        })
        .or_else(|| attrs.showname.as_deref().and_then(make_name))
        .unwrap_or_else(|| {
            format!(
                "pos_{}_size_{}",
                opt_display(attrs.pos),
                opt_display(attrs.size)
            )
        });
    if attrs.hide {
        name.insert_str(0, HIDDEN_PREFIX);
    }
    if !name.starts_with(|c: char| c.is_alphabetic() || c == '_') {
        name.insert_str(0, FIELD_PREFIX);
    }
    name
}

/// Indent every line of `s` by one tab
fn indent(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(s.len() + 8);
    out.push('\t');
    out.push_str(&s.replace('\n', "\n\t"));
    out.pop();
    out
}

#[derive(Clone, Debug, Serialize)]
pub struct Node {
    name: String,
    role: Role,
    attrs: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    typed: Option<FieldValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<Node>,
    #[serde(skip)]
    index: IndexMap<String, Vec<usize>>,
}

impl Node {
    /// Build a layer from a top-level protocol element
    pub fn layer(elt: &Element, types: &FieldTypes) -> Node {
        let attrs = Attributes::from_element(elt);
        let name = match attrs.name.as_deref() {
            Some(DATA_WRAPPER) => DATA_LAYER.to_owned(),
            Some(n) => n.to_owned(),
            None => String::new(),
        };
        Node::build(name, Role::Layer, attrs, elt, types)
    }

    /// Build a field below a node named `parent`
    pub fn field(elt: &Element, parent: &str, types: &FieldTypes) -> Node {
        let attrs = Attributes::from_element(elt);
        let name = field_name(&attrs, parent);
        Node::build(name, Role::Field, attrs, elt, types)
    }

    fn build(name: String, role: Role, attrs: Attributes, elt: &Element, types: &FieldTypes) -> Node {
        let typed = attrs
            .name
            .as_deref()
            .and_then(|n| types.convert(n, attrs.show.as_deref(), attrs.value.as_deref()));
        let mut node = Node {
            name,
            role,
            attrs,
            typed,
            children: Vec::new(),
            index: IndexMap::new(),
        };
        // a protocol is sometimes nested inside a field, keep it as a field
        for child in elt
            .children
            .iter()
            .filter(|c| c.name == "field" || c.name == "proto")
        {
            let f = Node::field(child, &node.name, types);
            node.push(f);
        }
        node
    }

    fn push(&mut self, child: Node) {
        let idx = self.children.len();
        self.index.entry(child.name.clone()).or_default().push(idx);
        self.children.push(child);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    /// Value converted according to the declared field type, if known
    pub fn typed(&self) -> Option<&FieldValue> {
        self.typed.as_ref()
    }

    pub fn is_hidden(&self) -> bool {
        self.attrs.hide
    }

    /// Field value: the first non-empty of `show`, `value`, `showname`
    pub fn value(&self) -> Option<&str> {
        [&self.attrs.show, &self.attrs.value, &self.attrs.showname]
            .into_iter()
            .filter_map(|s| s.as_deref())
            .find(|s| !s.is_empty())
    }

    /// All children, in source order
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// First child named `name`
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.index
            .get(name)
            .and_then(|idx| idx.first())
            .map(|&i| &self.children[i])
    }

    /// Every child named `name`
    pub fn group(&self, name: &str) -> Option<FieldGroup<'_>> {
        self.index.get(name).map(|indices| FieldGroup {
            parent: self,
            indices,
        })
    }

    /// Follow a path of names separated by `.`, taking the first occurrence
    /// at each level
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        path.split('.').try_fold(self, |node, name| node.get(name))
    }

    /// Distinct child names, in order of first appearance
    pub fn field_names(&self, show_hidden: bool) -> impl Iterator<Item = &str> + '_ {
        self.index
            .keys()
            .map(String::as_str)
            .filter(move |name| show_hidden || !name.starts_with(HIDDEN_PREFIX))
    }

    /// Children grouped by name: names in order of first appearance, then
    /// the occurrences of each name in source order
    pub fn fields(&self, show_hidden: bool) -> impl Iterator<Item = &Node> + '_ {
        self.index
            .iter()
            .filter(move |(name, _)| show_hidden || !name.starts_with(HIDDEN_PREFIX))
            .flat_map(move |(_, indices)| indices.iter().map(move |&i| &self.children[i]))
    }

    /// Depth-first traversal of the sub-tree, not including `self`
    pub fn walk(&self, show_hidden: bool) -> Walk<'_> {
        let mut stack: Vec<&Node> = self.fields(show_hidden).collect();
        stack.reverse();
        Walk { stack, show_hidden }
    }

    /// Children (or descendants, if `recursive`) whose name contains `pattern`
    pub fn search(&self, pattern: &str, recursive: bool, show_hidden: bool) -> Vec<&Node> {
        if recursive {
            self.walk(show_hidden)
                .filter(|n| n.name.contains(pattern))
                .collect()
        } else {
            self.fields(show_hidden)
                .filter(|n| n.name.contains(pattern))
                .collect()
        }
    }

    /// Names of the sub-tree, one per line, indented by depth
    pub fn tree_string(&self, show_hidden: bool) -> String {
        let mut s = String::new();
        for field in self.fields(show_hidden) {
            s.push_str(&field.name);
            s.push('\n');
            s.push_str(&indent(&field.tree_string(show_hidden)));
        }
        s
    }

    /// Byte range covered in the packet, if position and size are known
    pub fn raw_range(&self) -> Option<Range<usize>> {
        match (self.attrs.pos, self.attrs.size) {
            (Some(pos), Some(size)) => Some(pos..pos.saturating_add(size)),
            _ => None,
        }
    }

    fn fmt_children(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for child in &self.children {
            f.write_str(&indent(&child.to_string()))?;
        }
        Ok(())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.role {
            Role::Layer if self.name == DATA_LAYER => f.write_str("DATA"),
            Role::Layer => {
                writeln!(f, "Layer {}:", self.name.to_uppercase())?;
                self.fmt_children(f)
            }
            Role::Field if self.attrs.hide => Ok(()),
            Role::Field => {
                match (&self.attrs.showname, &self.attrs.show) {
                    (Some(s), _) | (None, Some(s)) => writeln!(f, "{}", s)?,
                    (None, None) => writeln!(
                        f,
                        "{}:\t{}",
                        self.name,
                        self.attrs.value.as_deref().unwrap_or_default()
                    )?,
                }
                self.fmt_children(f)
            }
        }
    }
}

/// All the children of a node sharing one name. Never empty.
#[derive(Clone, Copy)]
pub struct FieldGroup<'a> {
    parent: &'a Node,
    indices: &'a [usize],
}

impl<'a> FieldGroup<'a> {
    pub fn first(&self) -> &'a Node {
        &self.parent.children[self.indices[0]]
    }

    pub fn get(&self, n: usize) -> Option<&'a Node> {
        self.indices.get(n).map(|&i| &self.parent.children[i])
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Node> + 'a {
        let (parent, indices) = (self.parent, self.indices);
        indices.iter().map(move |&i| &parent.children[i])
    }
}

impl<'a> IntoIterator for FieldGroup<'a> {
    type Item = &'a Node;
    type IntoIter = Box<dyn Iterator<Item = &'a Node> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Depth-first iterator over a sub-tree
pub struct Walk<'a> {
    stack: Vec<&'a Node>,
    show_hidden: bool,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<&'a Node> {
        let node = self.stack.pop()?;
        let start = self.stack.len();
        self.stack.extend(node.fields(self.show_hidden));
        self.stack[start..].reverse();
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdml::parse_record;

    fn layer(xml: &str) -> Node {
        let elt = parse_record(xml.as_bytes()).expect("pdml");
        Node::layer(&elt, &FieldTypes::new())
    }

    #[test]
    fn name_collisions_are_grouped() {
        let l = layer(
            r#"<proto name="tcp">
                <field name="option" show="mss"/>
                <field name="tcp.srcport" show="80"/>
                <field name="option" show="nop"/>
                <field name="option" show="sack"/>
            </proto>"#,
        );
        assert_eq!(l.field_names(false).collect::<Vec<_>>(), vec!["option", "srcport"]);
        let group = l.group("option").expect("group");
        assert_eq!(group.len(), 3);
        let shows: Vec<_> = group.iter().filter_map(|f| f.value()).collect();
        assert_eq!(shows, vec!["mss", "nop", "sack"]);
        assert_eq!(l.get("option").and_then(|f| f.value()), Some("mss"));
        let all: Vec<_> = l.fields(false).map(|f| f.value().unwrap_or_default()).collect();
        assert_eq!(all, vec!["mss", "nop", "sack", "80"]);
    }

    #[test]
    fn hidden_and_identifier_prefixes() {
        let l = layer(
            r#"<proto name="eth">
                <field name="eth.lg" show="0" hide="yes"/>
                <field show="802.1Q Virtual LAN"/>
                <field show="1 byte" hide="yes"/>
                <field name="eth.type" show="0x0800"/>
            </proto>"#,
        );
        let names: Vec<_> = l.field_names(true).collect();
        assert_eq!(
            names,
            vec!["_hid_lg", "field_802_1Q_Virtual_LAN", "_hid_1_byte", "type"]
        );
        let visible: Vec<_> = l.field_names(false).collect();
        assert_eq!(visible, vec!["field_802_1Q_Virtual_LAN", "type"]);
    }

    #[test]
    fn name_fallbacks() {
        let attrs = |name: Option<&str>, show: Option<&str>, showname: Option<&str>| Attributes {
            name: name.map(str::to_owned),
            show: show.map(str::to_owned),
            showname: showname.map(str::to_owned),
            pos: Some(14),
            size: Some(2),
            ..Default::default()
        };
        assert_eq!(field_name(&attrs(Some("ip.src"), None, None), "ip"), "src");
        assert_eq!(
            field_name(&attrs(Some(""), Some("Flags: 0x02"), None), "tcp"),
            "Flags"
        );
        assert_eq!(
            field_name(&attrs(Some("ip"), None, Some("Internet Protocol")), "ip"),
            "Internet_Protocol"
        );
        assert_eq!(field_name(&attrs(None, Some("::"), Some("--")), "ip"), "pos_14_size_2");
        assert_eq!(
            field_name(&attrs(Some("ip.flags.df"), None, None), "flags"),
            "df"
        );
        assert_eq!(
            field_name(&attrs(Some("ssl.record.content_type"), None, None), "record"),
            "content_type"
        );
        assert_eq!(make_name("..a..b.."), Some("a_b_".to_owned()));
        assert_eq!(make_name("-- "), None);
    }

    #[test]
    fn nested_fields() {
        let l = layer(
            r#"<proto name="ip" pos="14" size="20">
                <field name="ip.flags" showname="Flags: 0x02" show="0x02" pos="20" size="1">
                    <field name="ip.flags.rb" showname="0... = Reserved bit: Not set" show="0" pos="20" size="1"/>
                    <field name="ip.flags.df" showname=".1.. = Don't fragment: Set" show="1" pos="20" size="1"/>
                </field>
                <field name="ip.ttl" showname="Time to live: 64" show="64" pos="22" size="1"/>
            </proto>"#,
        );
        assert_eq!(l.lookup("flags.df").and_then(|f| f.value()), Some("1"));
        let walked: Vec<_> = l.walk(false).map(|n| n.name()).collect();
        assert_eq!(walked, vec!["flags", "rb", "df", "ttl"]);
        let found: Vec<_> = l.search("f", true, false).iter().map(|n| n.name()).collect();
        assert_eq!(found, vec!["flags", "df"]);
        assert_eq!(l.search("f", false, false).len(), 1);
        assert_eq!(l.tree_string(false), "flags\n\trb\n\tdf\nttl\n");
        assert_eq!(
            l.to_string(),
            "Layer IP:\n\tFlags: 0x02\n\t\t0... = Reserved bit: Not set\n\t\t.1.. = Don't fragment: Set\n\tTime to live: 64\n"
        );
        assert_eq!(l.get("ttl").and_then(|f| f.raw_range()), Some(22..23));
    }

    #[test]
    fn data_layer_and_values() {
        let l = layer(
            r#"<proto name="fake-field-wrapper">
                <field name="data" value="0102" show="" showname="Data (2 bytes)"/>
                <field name="data.len" show="2" hide="yes"/>
            </proto>"#,
        );
        assert_eq!(l.name(), DATA_LAYER);
        assert_eq!(l.to_string(), "DATA");
        // the field repeats the layer name, so its name comes from showname
        assert_eq!(l.get("Data_2_bytes_").and_then(|f| f.value()), Some("0102"));
        let hidden = l.get("_hid_len").expect("hidden field");
        assert_eq!(hidden.to_string(), "");
        let plain = Node::field(
            &parse_record(br#"<field name="x.y" value="ab"/>"#).unwrap(),
            "x",
            &FieldTypes::new(),
        );
        assert_eq!(plain.to_string(), "y:\tab\n");
    }

    #[test]
    fn typed_values() {
        let elt = parse_record(
            br#"<proto name="geninfo">
                <field name="num" show="7" value="7"/>
                <field name="caplen" show="60" value="3c"/>
                <field name="other" show="x"/>
            </proto>"#,
        )
        .unwrap();
        let l = Node::layer(&elt, &FieldTypes::with_overrides());
        assert_eq!(l.get("num").and_then(|f| f.typed()), Some(&FieldValue::UInt(7)));
        assert_eq!(l.get("caplen").and_then(|f| f.typed()), Some(&FieldValue::UInt(60)));
        assert_eq!(l.get("other").and_then(|f| f.typed()), None);
    }
}
