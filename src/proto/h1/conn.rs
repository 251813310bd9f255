//! The HTTP/1 connection state machine.

use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use http::Version;

use crate::channel::{ChannelState, HttpChannel};
use crate::error::Error;
use crate::net::connection::{Connection, ConnectionCx, ConnectionFactory};
use crate::net::endpoint::FlushStatus;
use crate::worker::WorkerCtx;

use super::generator::{BodyFraming, Generator};
use super::parser::{Parser, ParserLimits, Progress};

/// Per-connection HTTP/1 behaviour knobs, derived from server config.
#[derive(Debug, Clone)]
pub struct Http1Settings {
    pub limits: ParserLimits,
    pub keep_alive_enabled: bool,
    pub max_keep_alive_requests: usize,
    pub keep_alive_timeout_secs: u64,
}

impl Default for Http1Settings {
    fn default() -> Http1Settings {
        Http1Settings {
            limits: ParserLimits::default(),
            keep_alive_enabled: true,
            max_keep_alive_requests: 100,
            keep_alive_timeout_secs: 60,
        }
    }
}

pub struct Http1Connection {
    parser: Parser,
    channel: HttpChannel,
    generator: Generator,
    settings: Http1Settings,
    framing: BodyFraming,
    head_sent: bool,
    /// Body terminator (chunked tail / trailers) has been queued.
    tail_queued: bool,
    keep_alive: bool,
    requests_handled: usize,
    parse_failed: bool,
    read_closed: bool,
}

impl Http1Connection {
    pub fn new(worker: &Rc<WorkerCtx>, settings: Http1Settings) -> Http1Connection {
        Http1Connection {
            parser: Parser::new_request(settings.limits),
            channel: HttpChannel::new(Arc::clone(&worker.server)),
            generator: Generator::new(
                settings.keep_alive_timeout_secs,
                settings.max_keep_alive_requests,
            ),
            settings,
            framing: BodyFraming::None,
            head_sent: false,
            tail_queued: false,
            keep_alive: false,
            requests_handled: 0,
            parse_failed: false,
            read_closed: false,
        }
    }

    /// Parses whatever is buffered, then pushes response bytes out.
    fn process(&mut self, cx: &mut ConnectionCx<'_>) {
        while !cx.endpoint.read_buf().is_empty() {
            // a pipelined request stays buffered until the current
            // exchange recycles the channel
            if self.parser.is_at_message_boundary()
                && self.channel.state() != ChannelState::Reading
            {
                break;
            }
            match self.parser.parse(cx.endpoint.read_buf(), &mut self.channel) {
                Ok(Progress::Partial) => break,
                Ok(Progress::Complete) => {
                    // response side decides when the next message parses
                    break;
                }
                Err(err) => {
                    tracing::debug!("h1 parse error: {}", err);
                    self.parse_failed = true;
                    break;
                }
            }
        }
        self.pump(cx);
    }

    /// Moves staged channel output onto the endpoint and flushes.
    fn pump(&mut self, cx: &mut ConnectionCx<'_>) {
        if self.channel.take_continue_pending() && !self.head_sent {
            let mut interim = Vec::new();
            self.generator.continue_head(&mut interim);
            cx.endpoint.write_bytes(Bytes::from(interim));
        }

        if !self.head_sent && self.channel.response().is_committed() {
            self.keep_alive = self.negotiate_keep_alive();
            let mut head = Vec::new();
            self.framing = self.generator.response_head(
                self.channel.response(),
                self.channel.is_head_request(),
                self.keep_alive,
                &mut head,
            );
            let head_len = head.len() as u64;
            cx.endpoint.write_bytes(Bytes::from(head));
            self.channel.response_mut().add_bytes_transmitted(head_len);
            self.head_sent = true;
        }

        if self.head_sent {
            let staged = self.channel.take_output();
            if !staged.is_empty() {
                let mut framed = Vec::new();
                for chunk in staged {
                    self.generator.body_chunk(self.framing, chunk, &mut framed);
                }
                let mut total = 0u64;
                for chunk in framed {
                    total += chunk.len();
                    cx.endpoint.write(chunk);
                }
                self.channel.response_mut().add_bytes_transmitted(total);
            }
            if self.channel.state() == ChannelState::SendingLast && !self.tail_queued {
                let mut framed = Vec::new();
                self.generator.finish_body(
                    self.framing,
                    self.channel.response().trailers(),
                    &mut framed,
                );
                for chunk in framed {
                    cx.endpoint.write(chunk);
                }
                self.tail_queued = true;
            }
        }

        match cx.endpoint.flush() {
            Ok((FlushStatus::Done, _)) => {
                if self.tail_queued {
                    self.finish_request(cx);
                } else {
                    self.arm_read(cx);
                }
            }
            Ok((FlushStatus::Blocked, _)) => {
                if let Err(err) = cx.want_flush() {
                    tracing::debug!("want_flush failed: {}", err);
                    cx.defer_close();
                }
            }
            Err(err) => {
                tracing::debug!("h1 flush error: {}", err);
                cx.defer_close();
            }
        }
    }

    /// Arms the read interest when the connection still expects bytes.
    /// Reached only with the wire drained; a dead read side means the
    /// exchange cannot progress any further.
    fn arm_read(&mut self, cx: &mut ConnectionCx<'_>) {
        if self.read_closed || self.parse_failed {
            cx.defer_close();
            return;
        }
        match self.channel.state() {
            ChannelState::Reading | ChannelState::Handling => {
                if let Err(err) = cx.want_fill() {
                    tracing::debug!("want_fill failed: {}", err);
                    cx.defer_close();
                }
            }
            _ => {}
        }
    }

    /// The response fully hit the wire: account it and either recycle
    /// for the next request or close.
    fn finish_request(&mut self, cx: &mut ConnectionCx<'_>) {
        self.channel.finish();
        cx.worker.note_request();
        self.requests_handled += 1;

        let aborted = self.channel.is_aborted() || self.parse_failed;
        // an unconsumed request body would alias the next message
        let clean_boundary = self.parser.is_at_message_boundary();
        if self.keep_alive && !aborted && clean_boundary && !self.read_closed {
            tracing::trace!(handled = self.requests_handled, "h1 keep-alive recycle");
            self.channel.recycle();
            self.head_sent = false;
            self.tail_queued = false;
            self.framing = BodyFraming::None;
            if !cx.endpoint.read_buf().is_empty() {
                // pipelined request already buffered
                self.process(cx);
            } else {
                self.arm_read(cx);
            }
        } else {
            cx.defer_close();
        }
    }

    fn negotiate_keep_alive(&self) -> bool {
        if !self.settings.keep_alive_enabled
            || self.parse_failed
            || self.channel.is_aborted()
            || self.read_closed
        {
            return false;
        }
        if self.requests_handled + 1 >= self.settings.max_keep_alive_requests {
            return false;
        }
        let request = match self.channel.request() {
            Some(r) => r,
            None => return false,
        };
        let connection = request.headers.get("Connection");
        let wants = |token: &str| {
            connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };
        match request.version() {
            Version::HTTP_11 => !wants("close"),
            Version::HTTP_10 => wants("keep-alive"),
            _ => false,
        }
    }
}

impl Connection for Http1Connection {
    fn on_open(&mut self, cx: &mut ConnectionCx<'_>, data_ready: bool) {
        tracing::trace!(fd = cx.endpoint.fd(), "h1 open");
        if data_ready {
            self.on_fillable(cx);
        } else if let Err(err) = cx.want_fill() {
            tracing::debug!("want_fill failed: {}", err);
            cx.defer_close();
        }
    }

    fn on_fillable(&mut self, cx: &mut ConnectionCx<'_>) {
        match cx.endpoint.fill() {
            Ok(0) if cx.endpoint.is_eof() => {
                self.read_closed = true;
                if self.parser.is_at_message_boundary()
                    && self.channel.state() == ChannelState::Reading
                    && cx.endpoint.pending() == 0
                {
                    cx.defer_close();
                    return;
                }
                // mid-message EOF poisons the parser; a committed
                // response may still drain to the peer's read side
                if self.parser.on_eof(&mut self.channel).is_err() {
                    self.parse_failed = true;
                }
                self.pump(cx);
            }
            Ok(_) => self.process(cx),
            Err(err) => {
                tracing::debug!("h1 read error: {}", err);
                cx.defer_close();
            }
        }
    }

    fn on_flushable(&mut self, cx: &mut ConnectionCx<'_>) {
        // also the resume path for deferred handler completion
        self.pump(cx);
    }

    fn on_interest_failure(&mut self, cx: &mut ConnectionCx<'_>, error: Error) {
        tracing::debug!(fd = cx.endpoint.fd(), "h1 interest failure: {}", error);
        cx.defer_close();
    }
}

/// Builds HTTP/1 connections; registered under `"http/1.1"`.
pub struct Http1Factory {
    settings: Http1Settings,
}

impl Http1Factory {
    pub fn new(settings: Http1Settings) -> Http1Factory {
        Http1Factory { settings }
    }

    pub fn from_config(config: &crate::server::ServerConfig) -> Http1Factory {
        Http1Factory::new(Http1Settings {
            limits: ParserLimits {
                max_uri_length: config.max_request_uri_length,
                max_head_length: config.max_request_header_size,
            },
            keep_alive_enabled: true,
            max_keep_alive_requests: config.max_keep_alive_requests,
            keep_alive_timeout_secs: config.keep_alive_timeout.as_secs(),
        })
    }
}

impl Default for Http1Factory {
    fn default() -> Http1Factory {
        Http1Factory::new(Http1Settings::default())
    }
}

impl ConnectionFactory for Http1Factory {
    fn protocol(&self) -> &'static str {
        "http/1.1"
    }

    fn create(&self, worker: &Rc<WorkerCtx>) -> Box<dyn Connection> {
        Box::new(Http1Connection::new(worker, self.settings.clone()))
    }
}
