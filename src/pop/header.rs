//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Popsync.
//
// Popsync is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Popsync is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Popsync. If not, see <http://www.gnu.org/licenses/>.

//! Just enough RFC 5322 header parsing to describe a message in a listing.

use std::io::{self, BufRead};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::MessageFlags;

lazy_static! {
    static ref REPLY_PREFIX: Regex =
        Regex::new(r"(?i)^(re(\[[0-9]+\])*|aw):[ \t]*").unwrap();
}

/// The header fields shown in a message listing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub subject: Option<String>,
    /// `subject` without any reply prefix.
    pub real_subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub date: Option<String>,
    pub message_id: Option<String>,
}

impl Envelope {
    fn set(&mut self, name: &str, value: String) {
        let slot = if name.eq_ignore_ascii_case("subject") {
            &mut self.subject
        } else if name.eq_ignore_ascii_case("from") {
            &mut self.from
        } else if name.eq_ignore_ascii_case("to") {
            &mut self.to
        } else if name.eq_ignore_ascii_case("date") {
            &mut self.date
        } else if name.eq_ignore_ascii_case("message-id") {
            &mut self.message_id
        } else {
            return;
        };

        // The first occurrence wins.
        if slot.is_none() {
            *slot = Some(value);
        }
    }
}

/// Everything known about a message without fetching its body. This is what
/// goes into the header cache.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub envelope: Envelope,
    /// Byte offset of the body in the retrieved message.
    pub offset: u64,
    /// Length of the body in bytes.
    pub length: u64,
    /// Number of lines in the body, 0 until the body was retrieved.
    pub lines: u32,
    pub flags: MessageFlags,
}

/// The result of `parse_header()`.
#[derive(Clone, Debug, Default)]
pub struct ParsedHeader {
    pub envelope: Envelope,
    /// Bytes consumed, including the blank separator line.
    pub offset: u64,
    /// Lines consumed, including the blank separator line.
    pub lines: u32,
}

/// Strip one reply prefix such as `Re:` or `Re[2]:` from `subject`.
pub fn real_subject(subject: &str) -> &str {
    match REPLY_PREFIX.find(subject) {
        Some(m) => &subject[m.end()..],
        None => subject,
    }
}

/// Read the header block from `reader`, leaving it positioned at the start
/// of the body.
///
/// Folded fields are joined with a single space. The block ends at the
/// first empty line or at end of input.
pub fn parse_header(reader: &mut impl BufRead) -> io::Result<ParsedHeader> {
    let mut parsed = ParsedHeader::default();
    let mut current: Option<(String, String)> = None;
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let n = reader.read_until(b'\n', &mut raw)?;
        if 0 == n {
            break;
        }
        parsed.offset += n as u64;
        parsed.lines += 1;

        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.is_empty() {
            break;
        }

        if line.starts_with(&[' ', '\t'][..]) {
            if let Some((_, ref mut value)) = current {
                value.push(' ');
                value.push_str(line.trim_start());
            }
            continue;
        }

        if let Some((name, value)) = current.take() {
            parsed.envelope.set(&name, value);
        }

        // Lines without a colon are not fields; ignore them.
        if let Some(colon) = line.find(':') {
            current = Some((
                line[..colon].trim_end().to_owned(),
                line[colon + 1..].trim().to_owned(),
            ));
        }
    }

    if let Some((name, value)) = current {
        parsed.envelope.set(&name, value);
    }

    parsed.envelope.real_subject = parsed
        .envelope
        .subject
        .as_deref()
        .map(|s| real_subject(s).to_owned());
    Ok(parsed)
}

/// Count the lines remaining in `reader`. A final line without terminator
/// counts.
pub fn count_lines(reader: &mut impl BufRead) -> io::Result<u32> {
    let mut lines = 0u32;
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if 0 == reader.read_until(b'\n', &mut raw)? {
            return Ok(lines);
        }
        lines += 1;
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;
    use crate::test_data::{HEADER_ONLY_MESSAGE, SIMPLE_MESSAGE};

    #[test]
    fn parse_simple_message() {
        let mut reader = Cursor::new(SIMPLE_MESSAGE.as_bytes());
        let parsed = parse_header(&mut reader).unwrap();

        assert_eq!(
            Some("Re: Lunch plans"),
            parsed.envelope.subject.as_deref()
        );
        assert_eq!(
            Some("Lunch plans"),
            parsed.envelope.real_subject.as_deref()
        );
        assert_eq!(
            Some("Alice <alice@example.com>"),
            parsed.envelope.from.as_deref()
        );
        assert_eq!(
            Some("<lunch-1@example.com>"),
            parsed.envelope.message_id.as_deref()
        );
        assert_eq!(7, parsed.lines);

        let body_start = SIMPLE_MESSAGE.find("Noon").unwrap();
        assert_eq!(body_start as u64, parsed.offset);
        assert_eq!(2, count_lines(&mut reader).unwrap());
    }

    #[test]
    fn header_without_body() {
        let mut reader = Cursor::new(HEADER_ONLY_MESSAGE.as_bytes());
        let parsed = parse_header(&mut reader).unwrap();
        assert_eq!(Some("Ping"), parsed.envelope.subject.as_deref());
        assert_eq!(HEADER_ONLY_MESSAGE.len() as u64, parsed.offset);
        assert_eq!(0, count_lines(&mut reader).unwrap());
    }

    #[test]
    fn unterminated_header() {
        let mut reader = Cursor::new(&b"Subject: cut\nFrom: x"[..]);
        let parsed = parse_header(&mut reader).unwrap();
        assert_eq!(Some("cut"), parsed.envelope.subject.as_deref());
        assert_eq!(Some("x"), parsed.envelope.from.as_deref());
        assert_eq!(2, parsed.lines);
    }

    #[test]
    fn reply_prefixes() {
        assert_eq!("hello", real_subject("Re: hello"));
        assert_eq!("hello", real_subject("RE[3]:hello"));
        assert_eq!("hello", real_subject("aw:  hello"));
        assert_eq!("Re: hello", real_subject("Re: Re: hello"));
        assert_eq!("Regarding: x", real_subject("Regarding: x"));
    }

    #[test]
    fn first_field_wins() {
        let mut reader =
            Cursor::new(&b"Subject: one\r\nsubject: two\r\n\r\nbody"[..]);
        let parsed = parse_header(&mut reader).unwrap();
        assert_eq!(Some("one"), parsed.envelope.subject.as_deref());
    }
}
