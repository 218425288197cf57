//! Minimal parser for the tagged records produced by the decoder (PDML)
//!
//! Only the subset actually emitted for a `<packet>` element is supported:
//! nested elements with quoted attributes, self-closing elements, ignored
//! text, comments and processing instructions, and the predefined and
//! numeric character references.

use crate::error::Error;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_till, take_until, take_while1};
use nom::character::complete::{char, multispace0, multispace1};
use nom::multi::many0;
use nom::sequence::{delimited, preceded, tuple};
use nom::IResult;
use std::borrow::Cow;

/// A generic element of a decoded record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// Parse one complete record (for ex. `<packet>...</packet>`)
pub fn parse_record(input: &[u8]) -> Result<Element, Error> {
    let s = String::from_utf8_lossy(input);
    let (rem, _) = misc(&s).map_err(|e| Error::Pdml(format!("{e:?}")))?;
    match element(rem) {
        Ok((_, e)) => Ok(e),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let offset = s.len() - e.input.len();
            Err(Error::Pdml(format!("{:?} at offset {}", e.code, offset)))
        }
        Err(nom::Err::Incomplete(_)) => Err(Error::Pdml("incomplete record".to_owned())),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

fn name(i: &str) -> IResult<&str, &str> {
    take_while1(is_name_char)(i)
}

fn quoted(i: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_till(|c| c == '"'), char('"')),
        delimited(char('\''), take_till(|c| c == '\''), char('\'')),
    ))(i)
}

fn attribute(i: &str) -> IResult<&str, (String, String)> {
    let (i, (k, _, _, _, v)) = tuple((name, multispace0, char('='), multispace0, quoted))(i)?;
    Ok((i, (k.to_owned(), unescape(v).into_owned())))
}

/// Skip text, comments and processing instructions up to the next tag
fn misc(mut i: &str) -> IResult<&str, ()> {
    loop {
        let (rest, _) = take_till(|c| c == '<')(i)?;
        i = rest;
        if i.starts_with("<!--") {
            let (rest, _) = delimited(tag("<!--"), take_until("-->"), tag("-->"))(i)?;
            i = rest;
        } else if i.starts_with("<?") {
            let (rest, _) = delimited(tag("<?"), take_until("?>"), tag("?>"))(i)?;
            i = rest;
        } else {
            return Ok((i, ()));
        }
    }
}

fn closing<'a>(i: &'a str, expected: &str) -> IResult<&'a str, ()> {
    let (i, _) = tuple((tag("</"), tag(expected), multispace0, char('>')))(i)?;
    Ok((i, ()))
}

fn element(i: &str) -> IResult<&str, Element> {
    let (i, _) = char('<')(i)?;
    let (i, name) = name(i)?;
    let (i, attrs) = many0(preceded(multispace1, attribute))(i)?;
    let (i, _) = multispace0(i)?;
    let mut elt = Element {
        name: name.to_owned(),
        attrs,
        children: Vec::new(),
    };
    if let Ok((i, _)) = tag::<_, _, nom::error::Error<&str>>("/>")(i) {
        return Ok((i, elt));
    }
    let (mut i, _) = char('>')(i)?;
    loop {
        let (rest, _) = misc(i)?;
        if let Ok((rest, _)) = closing(rest, name) {
            return Ok((rest, elt));
        }
        let (rest, child) = element(rest)?;
        elt.children.push(child);
        i = rest;
    }
}

/// Replace character references by their value
pub fn unescape(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let decoded = rest.find(';').and_then(|end| {
            let entity = &rest[1..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ if entity.starts_with("#x") || entity.starts_with("#X") => {
                    u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32)
                }
                _ if entity.starts_with('#') => {
                    entity[1..].parse::<u32>().ok().and_then(char::from_u32)
                }
                _ => None,
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}
