//! Incremental, event-driven HTTP/1 message parser.
//!
//! One parser handles one message direction (requests on a server
//! connection, responses on a client one). Bytes are consumed from the
//! endpoint's read buffer; semantic events go to an
//! [`HttpListener`](crate::listener::HttpListener). After
//! `on_message_end` the parser rewinds itself, so pipelined messages
//! parse back-to-back out of the same buffer.

use bytes::BytesMut;
use http::{StatusCode, Version};

use crate::error::{Error, Parse, Result};
use crate::listener::{HttpListener, StartLine};

/// Hard caps enforced while a message head is being read.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_uri_length: usize,
    /// Cap on the total head (start-line plus headers) in bytes.
    pub max_head_length: usize,
}

impl Default for ParserLimits {
    fn default() -> ParserLimits {
        ParserLimits {
            max_uri_length: 8 * 1024,
            max_head_length: 64 * 1024,
        }
    }
}

/// What a `parse` call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Need more bytes.
    Partial,
    /// One full message was delivered; unconsumed bytes belong to the
    /// next one.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    Body,
    Poisoned,
}

/// Body framing decided at header-end.
#[derive(Debug, Clone, PartialEq)]
enum BodyKind {
    None,
    Length(u64),
    Chunked(ChunkedState, u64),
    /// Response body delimited by connection close.
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    End,
}

pub struct Parser {
    kind: Kind,
    state: State,
    limits: ParserLimits,
    head_bytes: usize,
    /// Header waiting for possible folded continuation lines.
    pending_header: Option<(Vec<u8>, Vec<u8>)>,
    content_length: Option<u64>,
    chunked: bool,
    body: BodyKind,
    /// Chunked trailers are parsed with the same folding rules.
    in_trailers: bool,
}

impl Parser {
    pub fn new_request(limits: ParserLimits) -> Parser {
        Parser::new(Kind::Request, limits)
    }

    pub fn new_response(limits: ParserLimits) -> Parser {
        Parser::new(Kind::Response, limits)
    }

    fn new(kind: Kind, limits: ParserLimits) -> Parser {
        Parser {
            kind,
            state: State::StartLine,
            limits,
            head_bytes: 0,
            pending_header: None,
            content_length: None,
            chunked: false,
            body: BodyKind::None,
            in_trailers: false,
        }
    }

    /// True while no byte of the current message has arrived.
    pub fn is_at_message_boundary(&self) -> bool {
        self.state == State::StartLine && self.head_bytes == 0
    }

    /// Parses as much of one message as `buf` allows.
    pub fn parse(
        &mut self,
        buf: &mut BytesMut,
        listener: &mut dyn HttpListener,
    ) -> Result<Progress> {
        match self.parse_inner(buf, listener) {
            Ok(progress) => Ok(progress),
            Err(err) => {
                self.state = State::Poisoned;
                listener.on_error(&err);
                Err(err)
            }
        }
    }

    /// The transport hit EOF; close-delimited response bodies end here.
    pub fn on_eof(&mut self, listener: &mut dyn HttpListener) -> Result<()> {
        if self.state == State::Body && self.body == BodyKind::Eof {
            self.finish_message(listener)?;
            return Ok(());
        }
        if self.is_at_message_boundary() {
            return Ok(());
        }
        let err = Error::new_incomplete();
        self.state = State::Poisoned;
        listener.on_error(&err);
        Err(err)
    }

    fn parse_inner(
        &mut self,
        buf: &mut BytesMut,
        listener: &mut dyn HttpListener,
    ) -> Result<Progress> {
        loop {
            match self.state {
                State::Poisoned => return Err(Error::new_incomplete()),
                State::StartLine => {
                    consume_leading_lines(buf);
                    let line = match self.take_line(buf)? {
                        Some(line) => line,
                        None => return Ok(Progress::Partial),
                    };
                    self.parse_start_line(&line, listener)?;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let line = match self.take_line(buf)? {
                        Some(line) => line,
                        None => return Ok(Progress::Partial),
                    };
                    if line.is_empty() {
                        self.flush_pending_header(listener)?;
                        if self.in_trailers {
                            return self.finish_message(listener);
                        }
                        self.on_head_complete(listener)?;
                        match self.body {
                            BodyKind::None => return self.finish_message(listener),
                            _ => self.state = State::Body,
                        }
                    } else {
                        self.parse_header_line(line, listener)?;
                    }
                }
                State::Body => match self.parse_body(buf, listener)? {
                    BodyProgress::More => return Ok(Progress::Partial),
                    BodyProgress::Complete => return Ok(Progress::Complete),
                    BodyProgress::Trailers => {
                        self.in_trailers = true;
                        self.state = State::Headers;
                    }
                },
            }
        }
    }

    /// Extracts one CRLF-terminated line, enforcing head limits.
    fn take_line(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
        match find_crlf(buf) {
            Some(pos) => {
                let line = buf.split_to(pos + 2);
                self.head_bytes += line.len();
                if self.head_bytes > self.limits.max_head_length {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                Ok(Some(line[..pos].to_vec()))
            }
            None => {
                if self.head_bytes + buf.len() > self.limits.max_head_length {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                Ok(None)
            }
        }
    }

    fn parse_start_line(&mut self, line: &[u8], listener: &mut dyn HttpListener) -> Result<()> {
        match self.kind {
            Kind::Request => {
                let mut parts = line.splitn(3, |&b| b == b' ');
                let method = parts.next().filter(|m| is_token(m)).ok_or_else(|| {
                    Error::new_parse(Parse::Method)
                })?;
                let target = parts
                    .next()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| Error::new_parse(Parse::Uri))?;
                if target.len() > self.limits.max_uri_length {
                    return Err(Error::new_parse(Parse::UriTooLong));
                }
                if target.contains(&0) {
                    return Err(Error::new_parse(Parse::Uri));
                }
                let version = parse_version(
                    parts.next().ok_or_else(|| Error::new_parse(Parse::Version))?,
                )?;
                listener.on_message_begin(&StartLine::Request {
                    method,
                    target,
                    version,
                })
            }
            Kind::Response => {
                let mut parts = line.splitn(3, |&b| b == b' ');
                let version = parse_version(
                    parts.next().ok_or_else(|| Error::new_parse(Parse::Version))?,
                )?;
                let status = parts
                    .next()
                    .and_then(|s| std::str::from_utf8(s).ok())
                    .and_then(|s| s.parse::<u16>().ok())
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or_else(|| Error::new_parse(Parse::Status))?;
                let reason = parts.next().unwrap_or(b"");
                listener.on_message_begin(&StartLine::Response {
                    version,
                    status,
                    reason,
                })
            }
        }
    }

    fn parse_header_line(
        &mut self,
        line: Vec<u8>,
        listener: &mut dyn HttpListener,
    ) -> Result<()> {
        if line[0] == b' ' || line[0] == b'\t' {
            // obs-fold: the line continues the previous field value
            let (_, value) = self
                .pending_header
                .as_mut()
                .ok_or_else(|| Error::new_parse(Parse::Header))?;
            value.push(b' ');
            value.extend_from_slice(trim(&line));
            return Ok(());
        }
        self.flush_pending_header(listener)?;
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| Error::new_parse(Parse::Header))?;
        let name = &line[..colon];
        if name.is_empty() || !is_token(name) {
            return Err(Error::new_parse(Parse::Header));
        }
        let value = trim(&line[colon + 1..]);
        self.pending_header = Some((name.to_vec(), value.to_vec()));
        Ok(())
    }

    fn flush_pending_header(&mut self, listener: &mut dyn HttpListener) -> Result<()> {
        let (name, value) = match self.pending_header.take() {
            Some(pair) => pair,
            None => return Ok(()),
        };
        if !self.in_trailers {
            self.note_framing_header(&name, &value)?;
        }
        listener.on_message_header(&name, &value)
    }

    /// Tracks `Content-Length` and `Transfer-Encoding` for framing.
    fn note_framing_header(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
        if name.eq_ignore_ascii_case(b"content-length") {
            let text =
                std::str::from_utf8(value).map_err(|_| Error::new_parse(Parse::ContentLengthInvalid))?;
            let parsed: u64 = text
                .trim()
                .parse()
                .map_err(|_| Error::new_parse(Parse::ContentLengthInvalid))?;
            if let Some(existing) = self.content_length {
                if existing != parsed {
                    return Err(Error::new_parse(Parse::ContentLengthInvalid));
                }
            }
            self.content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if value.eq_ignore_ascii_case(b"chunked") {
                self.chunked = true;
            } else {
                return Err(Error::new_parse(Parse::TransferEncodingInvalid));
            }
        }
        Ok(())
    }

    fn on_head_complete(&mut self, listener: &mut dyn HttpListener) -> Result<()> {
        if self.chunked && self.content_length.is_some() {
            // smuggling vector: refuse rather than pick a winner
            return Err(Error::new_parse(Parse::TransferEncodingConflict));
        }
        self.body = if self.chunked {
            BodyKind::Chunked(ChunkedState::Size, 0)
        } else if let Some(n) = self.content_length {
            if n == 0 {
                BodyKind::None
            } else {
                BodyKind::Length(n)
            }
        } else if self.kind == Kind::Response {
            BodyKind::Eof
        } else {
            BodyKind::None
        };
        listener.on_message_header_end()
    }

    fn parse_body(
        &mut self,
        buf: &mut BytesMut,
        listener: &mut dyn HttpListener,
    ) -> Result<BodyProgress> {
        match self.body {
            BodyKind::None => unreachable!("no body state for BodyKind::None"),
            BodyKind::Length(ref mut remaining) => {
                if buf.is_empty() {
                    return Ok(BodyProgress::More);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                let chunk = buf.split_to(take);
                *remaining -= take as u64;
                let done = *remaining == 0;
                listener.on_message_content(&chunk)?;
                if done {
                    self.finish_message(listener)?;
                    Ok(BodyProgress::Complete)
                } else {
                    Ok(BodyProgress::More)
                }
            }
            BodyKind::Eof => {
                if buf.is_empty() {
                    return Ok(BodyProgress::More);
                }
                let chunk = buf.split_to(buf.len());
                listener.on_message_content(&chunk)?;
                Ok(BodyProgress::More)
            }
            BodyKind::Chunked(..) => self.parse_chunked(buf, listener),
        }
    }

    /// The chunked-coding byte machine.
    fn parse_chunked(
        &mut self,
        buf: &mut BytesMut,
        listener: &mut dyn HttpListener,
    ) -> Result<BodyProgress> {
        loop {
            let (state, size) = match self.body {
                BodyKind::Chunked(state, size) => (state, size),
                _ => unreachable!(),
            };
            match state {
                ChunkedState::Size | ChunkedState::SizeLws | ChunkedState::Extension => {
                    let byte = match first(buf) {
                        Some(b) => b,
                        None => return Ok(BodyProgress::More),
                    };
                    match (state, byte) {
                        (ChunkedState::Size, b'0'..=b'9')
                        | (ChunkedState::Size, b'a'..=b'f')
                        | (ChunkedState::Size, b'A'..=b'F') => {
                            let digit = hex_digit(byte);
                            let next = size
                                .checked_mul(16)
                                .and_then(|s| s.checked_add(digit))
                                .ok_or_else(|| Error::new_parse(Parse::Chunked))?;
                            let _ = buf.split_to(1);
                            self.body = BodyKind::Chunked(ChunkedState::Size, next);
                        }
                        (ChunkedState::Size, b' ') | (ChunkedState::SizeLws, b' ') => {
                            let _ = buf.split_to(1);
                            self.body = BodyKind::Chunked(ChunkedState::SizeLws, size);
                        }
                        (_, b';') | (ChunkedState::Extension, _) if byte != b'\r' => {
                            let _ = buf.split_to(1);
                            self.body = BodyKind::Chunked(ChunkedState::Extension, size);
                        }
                        (_, b'\r') => {
                            let _ = buf.split_to(1);
                            self.body = BodyKind::Chunked(ChunkedState::SizeLf, size);
                        }
                        _ => return Err(Error::new_parse(Parse::Chunked)),
                    }
                }
                ChunkedState::SizeLf => {
                    match first(buf) {
                        Some(b'\n') => {
                            let _ = buf.split_to(1);
                            if size == 0 {
                                self.body = BodyKind::Chunked(ChunkedState::Trailer, 0);
                            } else {
                                self.body = BodyKind::Chunked(ChunkedState::Body, size);
                            }
                        }
                        Some(_) => return Err(Error::new_parse(Parse::Chunked)),
                        None => return Ok(BodyProgress::More),
                    }
                }
                ChunkedState::Body => {
                    if buf.is_empty() {
                        return Ok(BodyProgress::More);
                    }
                    let take = size.min(buf.len() as u64) as usize;
                    let chunk = buf.split_to(take);
                    let remaining = size - take as u64;
                    self.body = BodyKind::Chunked(
                        if remaining == 0 {
                            ChunkedState::BodyCr
                        } else {
                            ChunkedState::Body
                        },
                        remaining,
                    );
                    listener.on_message_content(&chunk)?;
                }
                ChunkedState::BodyCr => match first(buf) {
                    Some(b'\r') => {
                        let _ = buf.split_to(1);
                        self.body = BodyKind::Chunked(ChunkedState::BodyLf, 0);
                    }
                    Some(_) => return Err(Error::new_parse(Parse::Chunked)),
                    None => return Ok(BodyProgress::More),
                },
                ChunkedState::BodyLf => match first(buf) {
                    Some(b'\n') => {
                        let _ = buf.split_to(1);
                        self.body = BodyKind::Chunked(ChunkedState::Size, 0);
                    }
                    Some(_) => return Err(Error::new_parse(Parse::Chunked)),
                    None => return Ok(BodyProgress::More),
                },
                ChunkedState::Trailer => {
                    // hand trailer lines to the header machinery
                    self.body = BodyKind::Chunked(ChunkedState::End, 0);
                    return Ok(BodyProgress::Trailers);
                }
                ChunkedState::End => unreachable!("chunked End is terminal"),
            }
        }
    }

    fn finish_message(&mut self, listener: &mut dyn HttpListener) -> Result<Progress> {
        listener.on_message_end()?;
        let kind = self.kind;
        let limits = self.limits;
        *self = Parser::new(kind, limits);
        Ok(Progress::Complete)
    }
}

enum BodyProgress {
    More,
    Complete,
    Trailers,
}

fn first(buf: &BytesMut) -> Option<u8> {
    buf.first().copied()
}

fn hex_digit(b: u8) -> u64 {
    match b {
        b'0'..=b'9' => (b - b'0') as u64,
        b'a'..=b'f' => (b - b'a' + 10) as u64,
        _ => (b - b'A' + 10) as u64,
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn consume_leading_lines(buf: &mut BytesMut) {
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'\r' | b'\n' => i += 1,
            _ => break,
        }
    }
    if i > 0 {
        let _ = buf.split_to(i);
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map(|p| p + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

fn parse_version(bytes: &[u8]) -> Result<Version> {
    match bytes {
        b"HTTP/1.1" => Ok(Version::HTTP_11),
        b"HTTP/1.0" => Ok(Version::HTTP_10),
        b"HTTP/0.9" => Ok(Version::HTTP_09),
        _ => Err(Error::new_parse(Parse::Version)),
    }
}

/// tchar per RFC 7230 §3.2.6.
fn is_token(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && bytes.iter().all(|&b| {
            matches!(b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
        })
}
