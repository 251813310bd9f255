//! The FastCGI connection machine (responder role, multiplexed).

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;

use crate::channel::{ChannelState, HttpChannel};
use crate::error::Error;
use crate::listener::HttpListener;
use crate::net::connection::{Connection, ConnectionCx, ConnectionFactory};
use crate::net::endpoint::{Chunk, FlushStatus};
use crate::server::ServerShared;
use crate::worker::WorkerCtx;

use super::generator::Generator;
use super::parser::{FastcgiListener, RequestParser};
use super::ProtocolStatus;

struct ChannelSlot {
    channel: HttpChannel,
    keep_conn: bool,
    head_sent: bool,
}

/// Adapter handing parser callbacks to the per-request channels.
struct Sink<'a> {
    server: &'a Arc<ServerShared>,
    channels: &'a mut HashMap<u16, ChannelSlot>,
    /// Records produced by management / error handling, queued for the
    /// endpoint after parsing.
    control_out: &'a mut Vec<Bytes>,
}

impl<'a> FastcgiListener for Sink<'a> {
    fn on_request_begin(&mut self, request_id: u16, keep_conn: bool) -> bool {
        self.channels.insert(
            request_id,
            ChannelSlot {
                channel: HttpChannel::new(Arc::clone(self.server)),
                keep_conn,
                head_sent: false,
            },
        );
        true
    }

    fn channel(&mut self, request_id: u16) -> Option<&mut dyn HttpListener> {
        self.channels
            .get_mut(&request_id)
            .map(|slot| &mut slot.channel as &mut dyn HttpListener)
    }

    fn on_request_abort(&mut self, request_id: u16) {
        if self.channels.remove(&request_id).is_some() {
            self.control_out.push(Generator::end_request(
                request_id,
                0,
                ProtocolStatus::RequestComplete,
            ));
        }
    }

    fn on_unknown_role(&mut self, request_id: u16) {
        self.control_out.push(Generator::end_request(
            request_id,
            0,
            ProtocolStatus::UnknownRole,
        ));
    }

    fn on_get_values(&mut self, names: Vec<Vec<u8>>) {
        let mut values: Vec<(&[u8], &[u8])> = Vec::new();
        for name in &names {
            match name.as_slice() {
                b"FCGI_MAX_CONNS" => values.push((b"FCGI_MAX_CONNS", b"1024")),
                b"FCGI_MAX_REQS" => values.push((b"FCGI_MAX_REQS", b"1024")),
                b"FCGI_MPXS_CONNS" => values.push((b"FCGI_MPXS_CONNS", b"1")),
                _ => {}
            }
        }
        self.control_out.push(Generator::get_values_result(&values));
    }

    fn on_unknown_record(&mut self, record_type: u8) {
        self.control_out.push(Generator::unknown_type(record_type));
    }
}

pub struct FastcgiConnection {
    server: Arc<ServerShared>,
    parser: RequestParser,
    channels: HashMap<u16, ChannelSlot>,
    control_out: Vec<Bytes>,
    parse_failed: bool,
}

impl FastcgiConnection {
    pub fn new(worker: &Rc<WorkerCtx>) -> FastcgiConnection {
        FastcgiConnection {
            server: Arc::clone(&worker.server),
            parser: RequestParser::new(),
            channels: HashMap::new(),
            control_out: Vec::new(),
            parse_failed: false,
        }
    }

    fn process(&mut self, cx: &mut ConnectionCx<'_>) {
        let result = {
            let mut sink = Sink {
                server: &self.server,
                channels: &mut self.channels,
                control_out: &mut self.control_out,
            };
            self.parser.parse(cx.endpoint.read_buf(), &mut sink)
        };
        if let Err(err) = result {
            tracing::debug!("fastcgi parse error: {}", err);
            self.parse_failed = true;
        }
        self.pump(cx);
    }

    /// Drains management records and every responding channel.
    fn pump(&mut self, cx: &mut ConnectionCx<'_>) {
        for record in self.control_out.drain(..) {
            cx.endpoint.write_bytes(record);
        }

        let ids: Vec<u16> = self.channels.keys().copied().collect();
        let mut done: Vec<(u16, bool)> = Vec::new();
        for id in ids {
            let slot = self.channels.get_mut(&id).expect("slot present");
            if slot.channel.is_aborted() {
                // no response could be staged; the web server still gets
                // a completion record for this one request
                cx.endpoint.write_bytes(Generator::end_request(
                    id,
                    1,
                    ProtocolStatus::RequestComplete,
                ));
                done.push((id, slot.keep_conn));
                continue;
            }
            if !slot.channel.response().is_committed() {
                continue;
            }
            if !slot.head_sent {
                let mut head = Vec::new();
                Generator::response_head(slot.channel.response(), &mut head);
                let mut records = Vec::new();
                Generator::stdout(id, &head, &mut records);
                for record in records {
                    cx.endpoint.write_bytes(record);
                }
                slot.head_sent = true;
            }
            for chunk in slot.channel.take_output() {
                let mut records = Vec::new();
                match chunk {
                    Chunk::Data(data) => Generator::stdout(id, &data, &mut records),
                    Chunk::File(mut view) => {
                        // records carry explicit lengths, so file chunks
                        // are pulled through memory here
                        while !view.is_empty() {
                            match view.read_chunk(0xfff8) {
                                Ok(data) if !data.is_empty() => {
                                    Generator::stdout(id, &data, &mut records)
                                }
                                _ => break,
                            }
                        }
                    }
                }
                for record in records {
                    cx.endpoint.write_bytes(record);
                }
            }
            if slot.channel.state() == ChannelState::SendingLast && !slot.channel.has_output() {
                cx.endpoint.write_bytes(Generator::stdout_end(id));
                cx.endpoint.write_bytes(Generator::end_request(
                    id,
                    0,
                    ProtocolStatus::RequestComplete,
                ));
                slot.channel.finish();
                cx.worker.note_request();
                done.push((id, slot.keep_conn));
            }
        }

        let mut keep = true;
        for (id, keep_conn) in done {
            self.channels.remove(&id);
            keep &= keep_conn;
            tracing::trace!(request = id, "fastcgi request done");
        }

        match cx.endpoint.flush() {
            Ok((FlushStatus::Done, _)) => {
                let idle =
                    self.channels.is_empty() && self.parser.active_requests() == 0;
                if self.parse_failed || cx.endpoint.is_eof() || (idle && !keep) {
                    cx.defer_close();
                    return;
                }
                if let Err(err) = cx.want_fill() {
                    tracing::debug!("fastcgi want_fill failed: {}", err);
                    cx.defer_close();
                }
            }
            Ok((FlushStatus::Blocked, _)) => {
                if let Err(err) = cx.want_flush() {
                    tracing::debug!("fastcgi want_flush failed: {}", err);
                    cx.defer_close();
                }
            }
            Err(err) => {
                tracing::debug!("fastcgi flush error: {}", err);
                cx.defer_close();
            }
        }
    }
}

impl Connection for FastcgiConnection {
    fn on_open(&mut self, cx: &mut ConnectionCx<'_>, data_ready: bool) {
        tracing::trace!(fd = cx.endpoint.fd(), "fastcgi open");
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
                self.process(cx);
            }
            Ok(_) => self.process(cx),
            Err(err) => {
                tracing::debug!("fastcgi read error: {}", err);
                cx.defer_close();
            }
        }
    }

    fn on_flushable(&mut self, cx: &mut ConnectionCx<'_>) {
        self.pump(cx);
    }

    fn on_interest_failure(&mut self, cx: &mut ConnectionCx<'_>, error: Error) {
        tracing::debug!(fd = cx.endpoint.fd(), "fastcgi interest failure: {}", error);
        // unfinished requests still owe the web server a completion
        let ids: Vec<u16> = self.channels.keys().copied().collect();
        for id in ids {
            cx.endpoint.write_bytes(Generator::end_request(
                id,
                1,
                ProtocolStatus::RequestComplete,
            ));
        }
        let _ = cx.endpoint.flush();
        cx.defer_close();
    }
}

/// Builds FastCGI connections; registered under `"fastcgi"`.
#[derive(Default)]
pub struct FastcgiFactory;

impl ConnectionFactory for FastcgiFactory {
    fn protocol(&self) -> &'static str {
        "fastcgi"
    }

    fn create(&self, worker: &Rc<WorkerCtx>) -> Box<dyn Connection> {
        Box::new(FastcgiConnection::new(worker))
    }
}
