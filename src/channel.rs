//! HttpChannel: one request/response pair in flight.
//!
//! The channel sits between a protocol engine and handler code. The
//! engine feeds it [`HttpListener`] events; the handler mutates the
//! response and sends body chunks through it; the engine drains the
//! staged output and puts it on the wire in whatever framing the
//! protocol requires.

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};

use std::sync::Arc;

use crate::error::{Error, Parse, Result, User};
use crate::handler::{BodyMode, HttpHandler, Program};
use crate::listener::{HttpListener, StartLine};
use crate::net::endpoint::{Chunk, FileView};
use crate::request::HttpRequestInfo;
use crate::response::HttpResponse;
use crate::server::ServerShared;

/// Channel lifecycle. `SendingLast` means the handler completed and
/// only wire draining remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Reading,
    Handling,
    Sending,
    SendingLast,
    Done,
}

/// A body transformer in the outbound chain. Each call may yield zero
/// or more chunks; the final call passes an empty chunk with `eos`.
pub trait Filter: 'static {
    fn apply(&mut self, chunk: &[u8], eos: bool) -> Vec<Bytes>;
}

/// Staged outbound chunks, queued until the engine drains them.
#[derive(Default)]
pub struct EndPointWriter {
    chunks: Vec<Chunk>,
}

impl EndPointWriter {
    fn push(&mut self, chunk: Chunk) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.chunks)
    }
}

pub struct HttpChannel {
    state: ChannelState,
    server: Arc<ServerShared>,
    request: Option<HttpRequestInfo>,
    response: HttpResponse,
    filters: Vec<Box<dyn Filter>>,
    writer: EndPointWriter,
    /// Buffered-mode handler waiting for the full body.
    pending_handler: Option<HttpHandler>,
    /// Keeps the dispatching program alive for the request lifetime.
    program: Option<Arc<Program>>,
    body: BytesMut,
    is_head: bool,
    expect_continue: bool,
    continue_pending: bool,
    completed: bool,
    aborted: bool,
    completion_listeners: Vec<Box<dyn FnOnce()>>,
}

impl HttpChannel {
    pub fn new(server: Arc<ServerShared>) -> HttpChannel {
        HttpChannel {
            state: ChannelState::Reading,
            server,
            request: None,
            response: HttpResponse::new(Version::HTTP_11),
            filters: Vec::new(),
            writer: EndPointWriter::default(),
            pending_handler: None,
            program: None,
            body: BytesMut::new(),
            is_head: false,
            expect_continue: false,
            continue_pending: false,
            completed: false,
            aborted: false,
            completion_listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn request(&self) -> Option<&HttpRequestInfo> {
        self.request.as_ref()
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut HttpResponse {
        &mut self.response
    }

    /// Accumulated request body bytes.
    pub fn take_body(&mut self) -> Bytes {
        self.body.split().freeze()
    }

    /// Appends a filter to the outbound chain.
    pub fn add_filter(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Sends a body chunk. The first chunk commits the response head
    /// and moves the channel to `Sending`; header mutation fails from
    /// then on.
    pub fn send_data(&mut self, data: Bytes) -> Result<()> {
        self.start_sending()?;
        self.response.add_content_bytes(data.len() as u64)?;
        if self.is_head || self.response.is_content_forbidden() {
            return Ok(());
        }
        if self.filters.is_empty() {
            self.writer.push(Chunk::Data(data));
        } else {
            for out in run_filters(&mut self.filters, &data, false) {
                self.writer.push(Chunk::Data(out));
            }
        }
        Ok(())
    }

    /// Sends a file region. With filters active the region is pulled
    /// through memory; otherwise it stays zero-copy.
    pub fn send_file(&mut self, mut view: FileView) -> Result<()> {
        self.start_sending()?;
        self.response.add_content_bytes(view.len())?;
        if self.is_head || self.response.is_content_forbidden() {
            return Ok(());
        }
        if self.filters.is_empty() {
            self.writer.push(Chunk::File(view));
        } else {
            while !view.is_empty() {
                let chunk = view.read_chunk(64 * 1024).map_err(Error::new_io)?;
                if chunk.is_empty() {
                    break;
                }
                for out in run_filters(&mut self.filters, &chunk, false) {
                    self.writer.push(Chunk::Data(out));
                }
            }
        }
        Ok(())
    }

    /// Convenience: declare the length, send one buffer, complete.
    pub fn respond(&mut self, status: StatusCode, body: Bytes) -> Result<()> {
        self.response.set_status(status)?;
        self.response.set_content_length(Some(body.len() as u64))?;
        if !body.is_empty() {
            self.send_data(body)?;
        }
        self.completed()
    }

    /// Finishes the response: commits the head if needed, runs the
    /// filter chain's end-of-stream pass, and hands the channel to the
    /// engine for final draining.
    pub fn completed(&mut self) -> Result<()> {
        if self.completed {
            return Err(Error::new_user(User::AlreadyCompleted));
        }
        match self.state {
            ChannelState::Handling | ChannelState::Sending => {}
            _ => return Err(Error::new_user(User::IllegalState)),
        }
        self.completed = true;
        if !self.response.is_committed() {
            // bodyless completion: declare what was (not) sent
            if self.response.content_length().is_none() {
                let len = self.response.actual_content_length();
                self.response.set_content_length(Some(len))?;
            }
            self.response.commit();
        }
        if !self.filters.is_empty() {
            for out in run_filters(&mut self.filters, b"", true) {
                self.writer.push(Chunk::Data(out));
            }
        }
        self.state = ChannelState::SendingLast;
        let server = Arc::clone(&self.server);
        server.hooks.post_process(self);
        Ok(())
    }

    /// Interim `100 Continue`, legal only when the client asked for it.
    pub fn send_100_continue(&mut self) -> Result<()> {
        if !self.expect_continue {
            return Err(Error::new_user(User::IllegalState));
        }
        self.continue_pending = true;
        Ok(())
    }

    pub fn expects_continue(&self) -> bool {
        self.expect_continue
    }

    /// Error response with a default body where the status permits one.
    pub fn send_error(&mut self, status: StatusCode) -> Result<()> {
        if self.response.is_committed() {
            self.aborted = true;
            return Ok(());
        }
        self.response.set_status(status)?;
        let body = if crate::response::status_forbids_body(status) || self.is_head {
            Bytes::new()
        } else {
            let page = error_page(status);
            self.response
                .headers_mut()?
                .overwrite("Content-Type", "text/html")?;
            Bytes::from(page)
        };
        if self.state == ChannelState::Reading {
            // head-only failure: the handler never ran
            self.state = ChannelState::Handling;
        }
        self.respond(status, body)
    }

    /// Registers a callback run once the response hit the wire.
    pub fn on_response_end(&mut self, listener: impl FnOnce() + 'static) {
        self.completion_listeners.push(Box::new(listener));
    }

    // ===== engine-facing surface =====

    /// Drains staged output chunks for wire framing.
    pub(crate) fn take_output(&mut self) -> Vec<Chunk> {
        self.writer.drain()
    }

    pub(crate) fn has_output(&self) -> bool {
        !self.writer.is_empty()
    }

    /// Takes the pending interim-100 flag.
    pub(crate) fn take_continue_pending(&mut self) -> bool {
        std::mem::replace(&mut self.continue_pending, false)
    }

    pub(crate) fn is_head_request(&self) -> bool {
        self.is_head
    }

    /// The wire is fully drained: run completion listeners and hooks.
    pub(crate) fn finish(&mut self) {
        debug_assert_eq!(self.state, ChannelState::SendingLast);
        self.state = ChannelState::Done;
        for listener in self.completion_listeners.drain(..) {
            listener();
        }
        let server = Arc::clone(&self.server);
        if let Some(ref request) = self.request {
            server.hooks.request_done(request, &self.response);
        }
    }

    /// Resets for the next request on a kept-alive connection.
    pub(crate) fn recycle(&mut self) {
        self.state = ChannelState::Reading;
        self.request = None;
        self.response.recycle(Version::HTTP_11);
        self.filters.clear();
        self.writer = EndPointWriter::default();
        self.pending_handler = None;
        self.program = None;
        self.body.clear();
        self.is_head = false;
        self.expect_continue = false;
        self.continue_pending = false;
        self.completed = false;
        self.aborted = false;
        self.completion_listeners.clear();
    }

    fn start_sending(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Handling => {
                if !self.response.is_committed() {
                    self.response.commit();
                }
                self.state = ChannelState::Sending;
                Ok(())
            }
            ChannelState::Sending => Ok(()),
            _ => Err(Error::new_user(User::IllegalState)),
        }
    }

    fn run_handler(&mut self, handler: HttpHandler) {
        handler(self);
    }
}

fn run_filters(filters: &mut [Box<dyn Filter>], chunk: &[u8], eos: bool) -> Vec<Bytes> {
    let mut current: Vec<Bytes> = vec![Bytes::copy_from_slice(chunk)];
    for filter in filters.iter_mut() {
        let mut next = Vec::new();
        for buf in &current {
            next.extend(filter.apply(buf, false));
        }
        if eos {
            next.extend(filter.apply(b"", true));
        }
        current = next;
    }
    if eos && filters.is_empty() {
        current.clear();
    }
    current
}

fn error_page(status: StatusCode) -> String {
    let reason = status.canonical_reason().unwrap_or("Error");
    format!(
        "<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1></body></html>",
        code = status.as_u16(),
        reason = reason
    )
}

impl HttpListener for HttpChannel {
    fn on_message_begin(&mut self, start: &StartLine<'_>) -> Result<()> {
        let (method, target, version) = match *start {
            StartLine::Request {
                method,
                target,
                version,
            } => (method, target, version),
            StartLine::Response { .. } => {
                return Err(Error::new_user(User::IllegalState));
            }
        };
        debug_assert_eq!(self.state, ChannelState::Reading);
        let method = Method::from_bytes(method).map_err(|_| Error::new_parse(Parse::Method))?;
        let target =
            std::str::from_utf8(target).map_err(|_| Error::new_parse(Parse::Uri))?;
        self.is_head = method == Method::HEAD;
        let request = HttpRequestInfo::new(method, target, version)?;
        tracing::debug!(method = %request.method(), path = %request.path(), "request begin");
        self.response.recycle(version);
        self.request = Some(request);
        Ok(())
    }

    fn on_message_header(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
        let request = match self.request {
            Some(ref mut r) => r,
            None => return Err(Error::new_user(User::IllegalState)),
        };
        if request.headers.len() >= self.server.config.max_request_header_count {
            return Err(Error::new_parse(Parse::TooLarge));
        }
        let name =
            std::str::from_utf8(name).map_err(|_| Error::new_parse(Parse::Header))?;
        let value = String::from_utf8_lossy(value).into_owned();
        request.headers.push_unchecked(name, value);
        Ok(())
    }

    fn on_message_header_end(&mut self) -> Result<()> {
        self.state = ChannelState::Handling;
        {
            let request = self
                .request
                .as_ref()
                .ok_or_else(|| Error::new_user(User::IllegalState))?;
            self.expect_continue = request
                .headers
                .get("Expect")
                .eq_ignore_ascii_case("100-continue");
        }
        let server = Arc::clone(&self.server);
        server.hooks.pre_process(self);
        if self.completed {
            // a pre-process hook answered the request outright
            return Ok(());
        }
        let program = server.program();
        let (handler, mode) = {
            let request = self.request.as_ref().expect("request set above");
            program.select(request)
        };
        self.program = Some(program);
        match mode {
            BodyMode::Immediate => self.run_handler(handler),
            BodyMode::Buffered => self.pending_handler = Some(handler),
        }
        Ok(())
    }

    fn on_message_content(&mut self, chunk: &[u8]) -> Result<()> {
        let total = self.body.len() as u64 + chunk.len() as u64;
        if total > self.server.config.max_request_body_size {
            return Err(Error::new_parse(Parse::BodyTooLarge));
        }
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn on_message_end(&mut self) -> Result<()> {
        if let Some(handler) = self.pending_handler.take() {
            self.run_handler(handler);
        }
        Ok(())
    }

    fn on_error(&mut self, err: &Error) {
        tracing::debug!("channel error: {}", err);
        match err.surface_status() {
            Some(status) if !self.response.is_committed() && !self.completed => {
                if self.send_error(status).is_err() {
                    self.aborted = true;
                }
            }
            _ => self.aborted = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;

    fn test_channel(factory: Option<Arc<dyn crate::handler::HandlerFactory>>) -> HttpChannel {
        let mut builder = Server::builder();
        if let Some(factory) = factory {
            builder = builder.handler_factory(factory);
        }
        HttpChannel::new(builder.build_shared())
    }

    fn drive_simple_request(channel: &mut HttpChannel) {
        channel
            .on_message_begin(&StartLine::Request {
                method: b"GET",
                target: b"/hello",
                version: Version::HTTP_11,
            })
            .unwrap();
        channel.on_message_header(b"Host", b"example").unwrap();
        channel.on_message_header_end().unwrap();
        channel.on_message_end().unwrap();
    }

    #[test]
    fn handler_runs_and_completes() {
        let factory: Arc<dyn crate::handler::HandlerFactory> = Arc::new(
            |_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
                (
                    Arc::new(|channel: &mut HttpChannel| {
                        channel
                            .respond(StatusCode::OK, Bytes::from_static(b"hello"))
                            .unwrap();
                    }),
                    BodyMode::Immediate,
                )
            },
        );
        let mut channel = test_channel(Some(factory));
        drive_simple_request(&mut channel);
        assert_eq!(channel.state(), ChannelState::SendingLast);
        assert!(channel.response().is_committed());
        assert_eq!(channel.response().content_length(), Some(5));
        let output = channel.take_output();
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn mutation_after_first_send_fails() {
        let factory: Arc<dyn crate::handler::HandlerFactory> = Arc::new(
            |_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
                (
                    Arc::new(|channel: &mut HttpChannel| {
                        channel.send_data(Bytes::from_static(b"x")).unwrap();
                        assert!(channel
                            .response_mut()
                            .set_status(StatusCode::ACCEPTED)
                            .unwrap_err()
                            .is_user());
                        channel.completed().unwrap();
                    }),
                    BodyMode::Immediate,
                )
            },
        );
        let mut channel = test_channel(Some(factory));
        drive_simple_request(&mut channel);
        assert_eq!(channel.state(), ChannelState::SendingLast);
    }

    #[test]
    fn double_complete_fails() {
        let factory: Arc<dyn crate::handler::HandlerFactory> = Arc::new(
            |_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
                (
                    Arc::new(|channel: &mut HttpChannel| {
                        channel.completed().unwrap();
                        assert!(channel.completed().unwrap_err().is_user());
                    }),
                    BodyMode::Immediate,
                )
            },
        );
        let mut channel = test_channel(Some(factory));
        drive_simple_request(&mut channel);
    }

    #[test]
    fn buffered_handler_sees_full_body() {
        let factory: Arc<dyn crate::handler::HandlerFactory> = Arc::new(
            |_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
                (
                    Arc::new(|channel: &mut HttpChannel| {
                        let body = channel.take_body();
                        channel.respond(StatusCode::OK, body).unwrap();
                    }),
                    BodyMode::Buffered,
                )
            },
        );
        let mut channel = test_channel(Some(factory));
        channel
            .on_message_begin(&StartLine::Request {
                method: b"POST",
                target: b"/upload",
                version: Version::HTTP_11,
            })
            .unwrap();
        channel.on_message_header_end().unwrap();
        assert_eq!(channel.state(), ChannelState::Handling);
        channel.on_message_content(b"part one, ").unwrap();
        channel.on_message_content(b"part two").unwrap();
        channel.on_message_end().unwrap();
        assert_eq!(channel.response().content_length(), Some(18));
    }

    #[test]
    fn head_suppresses_body_bytes() {
        let factory: Arc<dyn crate::handler::HandlerFactory> = Arc::new(
            |_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
                (
                    Arc::new(|channel: &mut HttpChannel| {
                        channel
                            .respond(StatusCode::OK, Bytes::from_static(b"hidden"))
                            .unwrap();
                    }),
                    BodyMode::Immediate,
                )
            },
        );
        let mut channel = test_channel(Some(factory));
        channel
            .on_message_begin(&StartLine::Request {
                method: b"HEAD",
                target: b"/",
                version: Version::HTTP_11,
            })
            .unwrap();
        channel.on_message_header_end().unwrap();
        // length still declared, body omitted
        assert_eq!(channel.response().content_length(), Some(6));
        assert!(!channel.has_output());
    }

    #[test]
    fn filter_chain_sees_eos() {
        struct Upper;
        impl Filter for Upper {
            fn apply(&mut self, chunk: &[u8], eos: bool) -> Vec<Bytes> {
                if eos {
                    vec![Bytes::from_static(b"!")]
                } else if chunk.is_empty() {
                    vec![]
                } else {
                    vec![Bytes::from(chunk.to_ascii_uppercase())]
                }
            }
        }
        let factory: Arc<dyn crate::handler::HandlerFactory> = Arc::new(
            |_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
                (
                    Arc::new(|channel: &mut HttpChannel| {
                        channel.add_filter(Box::new(Upper));
                        channel.send_data(Bytes::from_static(b"abc")).unwrap();
                        channel.completed().unwrap();
                    }),
                    BodyMode::Immediate,
                )
            },
        );
        let mut channel = test_channel(Some(factory));
        drive_simple_request(&mut channel);
        let output = channel.take_output();
        let flat: Vec<u8> = output
            .iter()
            .flat_map(|c| match c {
                Chunk::Data(b) => b.to_vec(),
                Chunk::File(_) => panic!("unexpected file chunk"),
            })
            .collect();
        assert_eq!(flat, b"ABC!");
    }

    #[test]
    fn expectation_gates_interim_continue() {
        let factory: Arc<dyn crate::handler::HandlerFactory> = Arc::new(
            |_req: &HttpRequestInfo| -> (HttpHandler, BodyMode) {
                (
                    Arc::new(|channel: &mut HttpChannel| {
                        if channel.expects_continue() {
                            channel.send_100_continue().unwrap();
                        } else {
                            assert!(channel.send_100_continue().is_err());
                        }
                        channel.respond(StatusCode::OK, Bytes::new()).unwrap();
                    }),
                    BodyMode::Immediate,
                )
            },
        );
        let mut channel = test_channel(Some(factory.clone()));
        channel
            .on_message_begin(&StartLine::Request {
                method: b"POST",
                target: b"/",
                version: Version::HTTP_11,
            })
            .unwrap();
        channel
            .on_message_header(b"Expect", b"100-continue")
            .unwrap();
        channel.on_message_header_end().unwrap();
        assert!(channel.take_continue_pending());

        let mut plain = test_channel(Some(factory));
        drive_simple_request(&mut plain);
        assert!(!plain.take_continue_pending());
    }

    #[test]
    fn parse_error_generates_error_response() {
        let mut channel = test_channel(None);
        let err = Error::new_parse(Parse::UriTooLong);
        channel.on_error(&err);
        assert!(channel.is_completed());
        assert_eq!(
            channel.response().status(),
            StatusCode::URI_TOO_LONG
        );
    }
}
