//! Request line and header block parsing.
//!
//! [`RequestHead::parse`] consumes the `"\r\n\r\n"`-terminated head view
//! exactly once per request. Header lines are kept as raw `"Name: Value"`
//! byte strings in arrival order, sliced zero-copy out of the shared head
//! block; name case is preserved on store and ignored on lookup.

use bytes::Bytes;

use crate::ensure;
use crate::protocol::ParseError;

/// The parsed head of a request: the request line triple plus the raw
/// header lines.
#[derive(Debug, Default)]
pub struct RequestHead {
    method: String,
    uri: String,
    protocol: String,
    headers: Vec<Bytes>,
}

impl RequestHead {
    /// Parses a head view ending in `"\r\n\r\n"`.
    ///
    /// The request line is everything before the first `"\r\n"`; the rest
    /// splits into header lines, with empty lines ignored.
    pub fn parse(head: &Bytes) -> Result<Self, ParseError> {
        let line_end = find_crlf(head).ok_or(ParseError::MalformedRequest)?;
        let (method, uri, protocol) = split_request_line(&head[..line_end])?;

        let mut headers = Vec::new();
        let mut at = line_end + 2;
        while at < head.len() {
            let end = find_crlf(&head[at..]).map(|i| at + i).unwrap_or(head.len());
            if end > at {
                headers.push(head.slice(at..end));
            }
            at = end + 2;
        }

        Ok(Self { method, uri, protocol, headers })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The raw header lines in arrival order.
    pub fn headers(&self) -> &[Bytes] {
        &self.headers
    }

    /// Looks a header value up by field name, ignoring name case.
    ///
    /// A matching line must continue with optional spaces and a colon after
    /// the name; the value is the remainder with leading spaces skipped. A
    /// line whose value is empty is passed over and scanning continues.
    pub fn header_value(&self, key: &str) -> Option<&str> {
        if key.is_empty() {
            return None;
        }
        self.headers.iter().find_map(|line| match_header_line(line, key.as_bytes()))
    }
}

/// Splits a request line into its method, URI and protocol, per the rule
/// that the protocol is the rightmost whitespace-delimited token and the
/// URI is everything between it and the method.
fn split_request_line(line: &[u8]) -> Result<(String, String, String), ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::MalformedRequest)?;
    let line = line.trim_start_matches([' ', '\t']);

    let method_end = line.find([' ', '\t']).ok_or(ParseError::MalformedRequest)?;
    let method = &line[..method_end];
    let rest = line[method_end..].trim_start_matches([' ', '\t']);

    let last_ws = rest.rfind([' ', '\t']).ok_or(ParseError::MalformedRequest)?;
    let protocol = &rest[last_ws + 1..];
    let uri = rest[..last_ws].trim_end_matches([' ', '\t']);

    ensure!(
        !method.is_empty() && !uri.is_empty() && !protocol.is_empty(),
        ParseError::MalformedRequest
    );

    Ok((method.to_owned(), uri.to_owned(), protocol.to_owned()))
}

fn match_header_line<'a>(line: &'a [u8], key: &[u8]) -> Option<&'a str> {
    if line.len() < key.len() || !line[..key.len()].eq_ignore_ascii_case(key) {
        return None;
    }
    let mut at = key.len();
    while at < line.len() && line[at] == b' ' {
        at += 1;
    }
    if at == line.len() || line[at] != b':' {
        return None;
    }
    at += 1;
    while at < line.len() && line[at] == b' ' {
        at += 1;
    }
    if at == line.len() {
        return None;
    }
    std::str::from_utf8(&line[at..]).ok()
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|window| window == b"\r\n")
}
