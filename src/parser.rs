//! The streaming request parser.
//!
//! A [`RequestParser`] is fed raw connection bytes in whatever pieces the
//! transport produces. Internally it registers demands against a
//! [`ByteReader`](crate::reader::ByteReader) for the next protocol element
//! (the head through `"\r\n\r\n"`, a counted body, a chunk size line) and
//! steps its state machine each time a demand is answered. At every protocol boundary the
//! group's hooks fire synchronously from inside [`RequestParser::parse`]:
//! `on_headers` once the head is parsed, `on_body_chunk` per chunk when
//! registered, and exactly one of `on_request_end` or `on_parsing_error` to
//! terminate the request.
//!
//! Parsers are handed out by a [`ParserGroup`](crate::group::ParserGroup)
//! and return to its pool when dropped.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::ensure;
use crate::group::GroupShared;
use crate::protocol::{hex_val, FormData, ParamLocation, ParseError, RequestHead};
use crate::reader::ByteReader;

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// First-use capacity of the chunk accumulation buffer.
const CHUNK_CACHE_CAPACITY: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingHeaders,
    ReadingWholeBody,
    ReadingChunkSize,
    ReadingChunkData,
    ReadingFooters,
    Complete,
}

/// Per-request parser state, recycled through the group's pool.
pub(crate) struct ParserCore {
    reader: ByteReader,
    state: State,
    head: Option<RequestHead>,
    body: Option<Bytes>,
    /// Accumulates chunk payloads when no `on_body_chunk` hook is set.
    chunk_cache: Option<BytesMut>,
    query_form: Option<FormData>,
    body_form: Option<FormData>,
    body_form_checked: bool,
    error: Option<ParseError>,
    arg: Option<Box<dyn Any + Send>>,
    started_at: Instant,
    pool_member: bool,
}

impl ParserCore {
    pub(crate) fn new(pool_member: bool) -> Box<Self> {
        let mut core = Box::new(Self {
            reader: ByteReader::new(),
            state: State::Complete,
            head: None,
            body: None,
            chunk_cache: None,
            query_form: None,
            body_form: None,
            body_form_checked: false,
            error: None,
            arg: None,
            started_at: Instant::now(),
            pool_member,
        });
        core.arm();
        core
    }

    /// Puts the core into its initial listening state: waiting for a full
    /// request head.
    pub(crate) fn arm(&mut self) {
        self.state = State::ReadingHeaders;
        self.started_at = Instant::now();
        self.reader.require_until(HEAD_END);
    }

    /// Drops everything belonging to the finished request so the core can
    /// go back on the free list.
    pub(crate) fn reset(&mut self) {
        self.reader.clear();
        self.head = None;
        self.body = None;
        self.chunk_cache = None;
        self.query_form = None;
        self.body_form = None;
        self.body_form_checked = false;
        self.error = None;
        self.arg = None;
    }

    pub(crate) fn is_pool_member(&self) -> bool {
        self.pool_member
    }
}

/// A per-connection HTTP/1.x request parser.
///
/// Owned by exactly one caller at a time. Dropping the parser releases it
/// back to the group that produced it.
pub struct RequestParser {
    core: Option<Box<ParserCore>>,
    shared: Arc<GroupShared>,
}

impl RequestParser {
    pub(crate) fn assemble(core: Box<ParserCore>, shared: Arc<GroupShared>) -> Self {
        Self { core: Some(core), shared }
    }

    fn core(&self) -> &ParserCore {
        // the core is only detached by Drop
        self.core.as_ref().unwrap()
    }

    fn core_mut(&mut self) -> &mut ParserCore {
        self.core.as_mut().unwrap()
    }

    /// Feeds connection bytes into the parser.
    ///
    /// Hooks fire synchronously from inside this call as protocol
    /// boundaries are crossed. Feeding a parser whose request already
    /// terminated fires `on_parsing_error`.
    pub fn parse(&mut self, data: &[u8]) {
        if self.core().state == State::Complete {
            self.fail(ParseError::RequestComplete);
            return;
        }
        self.core_mut().reader.feed(data);
        self.drive();
    }

    fn drive(&mut self) {
        while self.core().state != State::Complete {
            let Some(view) = self.core_mut().reader.poll() else {
                return;
            };
            if let Err(err) = self.step(view) {
                self.fail(err);
                return;
            }
        }
    }

    fn step(&mut self, view: Bytes) -> Result<(), ParseError> {
        match self.core().state {
            State::ReadingHeaders => self.on_head(view),
            State::ReadingWholeBody => {
                self.on_whole_body(view);
                Ok(())
            }
            State::ReadingChunkSize => self.on_chunk_size(view),
            State::ReadingChunkData => {
                self.on_chunk_data(view);
                Ok(())
            }
            State::ReadingFooters => {
                self.on_footer(view);
                Ok(())
            }
            State::Complete => Ok(()),
        }
    }

    fn on_head(&mut self, view: Bytes) -> Result<(), ParseError> {
        let head = RequestHead::parse(&view)?;
        trace!(
            method = head.method(),
            uri = head.uri(),
            headers = head.headers().len(),
            "parsed request head"
        );
        self.core_mut().head = Some(head);

        let hook = Arc::clone(&self.shared.hooks.on_headers);
        (*hook)(self);

        let content_length = self
            .header_param("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let chunked = self
            .header_param("Transfer-Encoding")
            .is_some_and(|value| value.eq_ignore_ascii_case("chunked"));

        if content_length > 0 {
            trace!(content_length, "reading length-delimited body");
            let core = self.core_mut();
            core.state = State::ReadingWholeBody;
            core.reader.require_bytes(usize::try_from(content_length).unwrap_or(usize::MAX));
        } else if chunked {
            trace!("reading chunked body");
            let core = self.core_mut();
            core.state = State::ReadingChunkSize;
            core.reader.require_until(CRLF);
        } else {
            self.finish(None);
        }
        Ok(())
    }

    fn on_whole_body(&mut self, view: Bytes) {
        trace!(len = view.len(), "whole body read");
        self.finish(Some(view));
    }

    fn on_chunk_size(&mut self, view: Bytes) -> Result<(), ParseError> {
        let size = parse_chunk_size(&view)?;
        if size > 0 {
            // the payload carries its own trailing CRLF
            let demand = size.checked_add(2).ok_or(ParseError::MalformedChunkSize)?;
            let core = self.core_mut();
            core.state = State::ReadingChunkData;
            core.reader.require_bytes(demand);
        } else {
            let core = self.core_mut();
            core.state = State::ReadingFooters;
            core.reader.require_until(CRLF);
        }
        Ok(())
    }

    fn on_chunk_data(&mut self, view: Bytes) {
        let payload = view.slice(..view.len() - 2);
        trace!(len = payload.len(), "read body chunk");

        if let Some(hook) = self.shared.hooks.on_body_chunk.clone() {
            (*hook)(self, Some(&payload));
        } else {
            self.core_mut()
                .chunk_cache
                .get_or_insert_with(|| BytesMut::with_capacity(CHUNK_CACHE_CAPACITY))
                .extend_from_slice(&payload);
        }

        let core = self.core_mut();
        core.state = State::ReadingChunkSize;
        core.reader.require_until(CRLF);
    }

    fn on_footer(&mut self, view: Bytes) {
        if view.len() == 2 {
            // empty footer line closes the request
            let body = self.core_mut().chunk_cache.take().map(BytesMut::freeze);
            self.finish(body);
        } else {
            trace!(len = view.len() - 2, "discarding trailer line");
            self.core_mut().reader.require_until(CRLF);
        }
    }

    fn finish(&mut self, body: Option<Bytes>) {
        let core = self.core_mut();
        core.state = State::Complete;
        core.body = body.clone();

        let hook = Arc::clone(&self.shared.hooks.on_request_end);
        (*hook)(self, body.as_ref());
    }

    fn fail(&mut self, err: ParseError) {
        debug!(%err, "request parsing failed");
        let core = self.core_mut();
        core.state = State::Complete;
        core.error = Some(err);

        let hook = Arc::clone(&self.shared.hooks.on_parsing_error);
        (*hook)(self);
    }

    /// The request method, present once `on_headers` has fired.
    pub fn method(&self) -> Option<&str> {
        self.core().head.as_ref().map(RequestHead::method)
    }

    /// The request URI, present once `on_headers` has fired.
    pub fn uri(&self) -> Option<&str> {
        self.core().head.as_ref().map(RequestHead::uri)
    }

    /// The protocol token of the request line, present once `on_headers`
    /// has fired.
    pub fn protocol(&self) -> Option<&str> {
        self.core().head.as_ref().map(RequestHead::protocol)
    }

    /// The raw `"Name: Value"` header lines in arrival order.
    pub fn headers(&self) -> &[Bytes] {
        self.core().head.as_ref().map(RequestHead::headers).unwrap_or(&[])
    }

    /// The request body, once the request ended with one.
    pub fn body(&self) -> Option<&Bytes> {
        self.core().body.as_ref()
    }

    /// Looks up a single-valued request parameter.
    ///
    /// `Header` scans the raw header lines (field name case ignored).
    /// `Query` decodes the URI's query string on first use. `Body` decodes
    /// the body on first use, but only when `Content-Type` starts with
    /// `application/x-www-form-urlencoded`.
    pub fn param(&mut self, location: ParamLocation, key: &str) -> Option<&str> {
        if key.is_empty() {
            return None;
        }
        match location {
            ParamLocation::Header => self.header_param(key),
            ParamLocation::Query => self.query_form().get(key),
            ParamLocation::Body => self.body_form().and_then(|form| form.get(key)),
        }
    }

    /// Looks up every value recorded for a key.
    ///
    /// Headers are single-valued here, so `Header` always yields an empty
    /// slice.
    pub fn params(&mut self, location: ParamLocation, key: &str) -> &[String] {
        if key.is_empty() {
            return &[];
        }
        match location {
            ParamLocation::Header => &[],
            ParamLocation::Query => self.query_form().get_all(key),
            ParamLocation::Body => {
                self.body_form().map(|form| form.get_all(key)).unwrap_or(&[])
            }
        }
    }

    fn header_param(&self, key: &str) -> Option<&str> {
        self.core().head.as_ref().and_then(|head| head.header_value(key))
    }

    fn query_form(&mut self) -> &FormData {
        let core = self.core_mut();
        if core.query_form.is_none() {
            let form = {
                let query = core
                    .head
                    .as_ref()
                    .and_then(|head| head.uri().split_once('?'))
                    .map(|(_, query)| query)
                    .unwrap_or("");
                FormData::parse(query)
            };
            core.query_form = Some(form);
        }
        core.query_form.as_ref().unwrap()
    }

    fn body_form(&mut self) -> Option<&FormData> {
        let core = self.core_mut();
        if !core.body_form_checked {
            core.body_form_checked = true;
            let form_typed = core
                .head
                .as_ref()
                .and_then(|head| head.header_value("Content-Type"))
                .is_some_and(|value| starts_with_ignore_case(value, FORM_CONTENT_TYPE));
            if form_typed {
                let form = core
                    .body
                    .as_ref()
                    .filter(|body| !body.is_empty())
                    .and_then(|body| std::str::from_utf8(body).ok())
                    .map(FormData::parse);
                core.body_form = form;
            }
        }
        core.body_form.as_ref()
    }

    /// Attaches an opaque per-connection argument, available to the hooks.
    pub fn set_arg(&mut self, arg: Box<dyn Any + Send>) {
        self.core_mut().arg = Some(arg);
    }

    pub fn arg(&self) -> Option<&(dyn Any + Send)> {
        self.core().arg.as_deref()
    }

    pub fn arg_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.core_mut().arg.as_deref_mut()
    }

    pub fn take_arg(&mut self) -> Option<Box<dyn Any + Send>> {
        self.core_mut().arg.take()
    }

    /// True once a terminal hook has fired for this request.
    pub fn is_complete(&self) -> bool {
        self.core().state == State::Complete
    }

    /// The error recorded when `on_parsing_error` fired.
    pub fn error(&self) -> Option<ParseError> {
        self.core().error
    }

    /// When this parser was (re)armed for the current request.
    pub fn session_start(&self) -> Instant {
        self.core().started_at
    }

    /// Returns the parser to its group. Equivalent to dropping it.
    pub fn release(self) {}
}

impl Drop for RequestParser {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            self.shared.recycle(core);
        }
    }
}

/// Parses the leading hex digits of a chunk size line. Extensions after
/// `;` and the closing CRLF are discarded.
fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let mut size: u64 = 0;
    let mut digits = 0usize;
    for &b in line {
        let Some(value) = hex_val(b) else {
            break;
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(value as u64))
            .ok_or(ParseError::MalformedChunkSize)?;
        digits += 1;
    }
    ensure!(digits > 0, ParseError::MalformedChunkSize);
    usize::try_from(size).map_err(|_| ParseError::MalformedChunkSize)
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
