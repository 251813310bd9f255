//! The HTTP/2 server connection driver.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Version;

use crate::channel::{ChannelState, HttpChannel};
use crate::error::Error;
use crate::listener::HttpListener;
use crate::net::connection::{Connection, ConnectionCx, ConnectionFactory};
use crate::net::endpoint::{Chunk, FlushStatus};
use crate::worker::WorkerCtx;

use super::flow::FlowWindow;
use super::frame::{
    self, flags, FrameHead, FrameKind, Priority, Reason, Settings, StreamId,
    CONNECTION_STREAM, FRAME_HEADER_LEN,
};
use super::hpack::{Decoder, Encoder};
use super::stream::{StreamState, StreamTree};
use super::PREFACE;

/// Our advertised SETTINGS, derived from server config.
#[derive(Debug, Clone)]
pub struct Http2Settings {
    pub max_concurrent_streams: u32,
    pub header_table_size: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Http2Settings {
    fn default() -> Http2Settings {
        Http2Settings {
            max_concurrent_streams: 100,
            header_table_size: frame::DEFAULT_SETTINGS_HEADER_TABLE_SIZE,
            initial_window_size: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Preface,
    FrameHead,
    FramePayload,
}

struct PendingHeaders {
    stream_id: StreamId,
    end_stream: bool,
    priority: Option<Priority>,
    fragment: Vec<u8>,
}

struct StreamSlot {
    state: StreamState,
    channel: HttpChannel,
    send_window: FlowWindow,
    recv_window: FlowWindow,
    queued: VecDeque<Chunk>,
    head_sent: bool,
    end_sent: bool,
    finished: bool,
}

impl StreamSlot {
    fn new(channel: HttpChannel, send_initial: u32, recv_initial: u32) -> StreamSlot {
        StreamSlot {
            state: StreamState::Open,
            channel,
            send_window: FlowWindow::new(send_initial),
            recv_window: FlowWindow::new(recv_initial),
            queued: VecDeque::new(),
            head_sent: false,
            end_sent: false,
            finished: false,
        }
    }
}

pub struct Http2Connection {
    server: Arc<crate::server::ServerShared>,
    settings: Http2Settings,
    read_state: ReadState,
    frame_head: Option<FrameHead>,
    decoder: Decoder,
    encoder: Encoder,
    streams: StreamTree<StreamSlot>,
    pending_headers: Option<PendingHeaders>,
    conn_send_window: FlowWindow,
    conn_recv_window: FlowWindow,
    peer_initial_window: u32,
    peer_max_frame_size: u32,
    last_stream_id: StreamId,
    settings_sent: bool,
    goaway_sent: bool,
    goaway_received: bool,
}

impl Http2Connection {
    pub fn new(worker: &Rc<WorkerCtx>, settings: Http2Settings) -> Http2Connection {
        let decoder = Decoder::new(
            settings.header_table_size as usize,
            settings.max_header_list_size as usize,
        );
        Http2Connection {
            server: Arc::clone(&worker.server),
            decoder,
            encoder: Encoder::new(frame::DEFAULT_SETTINGS_HEADER_TABLE_SIZE as usize),
            streams: StreamTree::new(),
            pending_headers: None,
            conn_send_window: FlowWindow::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            conn_recv_window: FlowWindow::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            peer_initial_window: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            peer_max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            last_stream_id: 0,
            read_state: ReadState::Preface,
            frame_head: None,
            settings_sent: false,
            goaway_sent: false,
            goaway_received: false,
            settings,
        }
    }

    fn send_initial_settings(&mut self, cx: &mut ConnectionCx<'_>) {
        debug_assert!(!self.settings_sent);
        let mut ours = Settings::default();
        ours.header_table_size = Some(self.settings.header_table_size);
        ours.max_concurrent_streams = Some(self.settings.max_concurrent_streams);
        ours.initial_window_size = Some(self.settings.initial_window_size);
        ours.max_frame_size = Some(self.settings.max_frame_size);
        ours.max_header_list_size = Some(self.settings.max_header_list_size);
        ours.enable_push = Some(false);
        cx.endpoint.write_bytes(ours.encode());
        self.settings_sent = true;
    }

    /// Consumes frames out of the read buffer until it runs dry or the
    /// connection dies.
    fn process(&mut self, cx: &mut ConnectionCx<'_>) {
        loop {
            match self.read_state {
                ReadState::Preface => {
                    let buf = cx.endpoint.read_buf();
                    if buf.len() < PREFACE.len() {
                        break;
                    }
                    let preface = buf.split_to(PREFACE.len());
                    if &preface[..] != PREFACE {
                        tracing::debug!("bad h2 preface");
                        self.connection_error(cx, Reason::Protocol);
                        return;
                    }
                    self.read_state = ReadState::FrameHead;
                }
                ReadState::FrameHead => {
                    let buf = cx.endpoint.read_buf();
                    if buf.len() < FRAME_HEADER_LEN {
                        break;
                    }
                    let head = FrameHead::parse(&buf.split_to(FRAME_HEADER_LEN));
                    if head.length > self.settings.max_frame_size {
                        self.connection_error(cx, Reason::FrameSize);
                        return;
                    }
                    self.frame_head = Some(head);
                    self.read_state = ReadState::FramePayload;
                }
                ReadState::FramePayload => {
                    let head = self.frame_head.expect("head parsed");
                    let buf = cx.endpoint.read_buf();
                    if buf.len() < head.length as usize {
                        break;
                    }
                    let payload = buf.split_to(head.length as usize).freeze();
                    self.read_state = ReadState::FrameHead;
                    self.frame_head = None;
                    if let Err(reason) = self.dispatch(cx, head, payload) {
                        self.connection_error(cx, reason);
                        return;
                    }
                }
            }
        }
        self.pump(cx);
    }

    fn dispatch(
        &mut self,
        cx: &mut ConnectionCx<'_>,
        head: FrameHead,
        payload: Bytes,
    ) -> Result<(), Reason> {
        tracing::trace!(kind = ?head.kind, stream = head.stream_id, len = payload.len(), "h2 frame");
        // CONTINUATION must directly follow its HEADERS
        if self.pending_headers.is_some() && head.kind != FrameKind::Continuation {
            return Err(Reason::Protocol);
        }
        match head.kind {
            FrameKind::Settings => self.on_settings(cx, head, &payload),
            FrameKind::Ping => self.on_ping(cx, head, &payload),
            FrameKind::WindowUpdate => self.on_window_update(head, &payload),
            FrameKind::Headers => self.on_headers(cx, head, payload),
            FrameKind::Continuation => self.on_continuation(cx, head, &payload),
            FrameKind::Data => self.on_data(cx, head, payload),
            FrameKind::Priority => self.on_priority(head, &payload),
            FrameKind::Reset => self.on_reset(head, &payload),
            FrameKind::PushPromise => Err(Reason::Protocol),
            FrameKind::GoAway => {
                self.goaway_received = true;
                Ok(())
            }
            FrameKind::Unknown(_) => Ok(()),
        }
    }

    fn on_settings(
        &mut self,
        cx: &mut ConnectionCx<'_>,
        head: FrameHead,
        payload: &[u8],
    ) -> Result<(), Reason> {
        if head.stream_id != CONNECTION_STREAM {
            return Err(Reason::Protocol);
        }
        if head.is_flag(flags::ACK) {
            if !payload.is_empty() {
                return Err(Reason::FrameSize);
            }
            return Ok(());
        }
        let peer = Settings::load(payload)?;
        if let Some(size) = peer.header_table_size {
            self.encoder.set_max_table_size(size as usize);
        }
        if let Some(size) = peer.max_frame_size {
            self.peer_max_frame_size = size;
        }
        if let Some(initial) = peer.initial_window_size {
            let delta = initial as i64 - self.peer_initial_window as i64;
            self.peer_initial_window = initial;
            for id in self.streams.ids() {
                if let Some(slot) = self.streams.get_mut(id) {
                    slot.send_window.adjust(delta)?;
                }
            }
        }
        cx.endpoint.write_bytes(Settings::ack());
        Ok(())
    }

    fn on_ping(
        &mut self,
        cx: &mut ConnectionCx<'_>,
        head: FrameHead,
        payload: &[u8],
    ) -> Result<(), Reason> {
        if head.stream_id != CONNECTION_STREAM || payload.len() != 8 {
            return Err(Reason::FrameSize);
        }
        if !head.is_flag(flags::ACK) {
            let mut data = [0u8; 8];
            data.copy_from_slice(payload);
            cx.endpoint.write_bytes(frame::encode_ping(true, &data));
        }
        Ok(())
    }

    fn on_window_update(&mut self, head: FrameHead, payload: &[u8]) -> Result<(), Reason> {
        if payload.len() != 4 {
            return Err(Reason::FrameSize);
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
        if head.stream_id == CONNECTION_STREAM {
            self.conn_send_window.grow(increment)?;
        } else if let Some(slot) = self.streams.get_mut(head.stream_id) {
            slot.send_window.grow(increment)?;
        }
        Ok(())
    }

    fn on_headers(
        &mut self,
        cx: &mut ConnectionCx<'_>,
        head: FrameHead,
        payload: Bytes,
    ) -> Result<(), Reason> {
        if head.stream_id == CONNECTION_STREAM {
            return Err(Reason::Protocol);
        }
        let mut fragment = strip_padding(&head, &payload)?;
        let priority = if head.is_flag(flags::PRIORITY) {
            if fragment.len() < 5 {
                return Err(Reason::FrameSize);
            }
            let parsed = Priority::load(&fragment[..5])?;
            fragment = &fragment[5..];
            Some(parsed)
        } else {
            None
        };
        let pending = PendingHeaders {
            stream_id: head.stream_id,
            end_stream: head.is_flag(flags::END_STREAM),
            priority,
            fragment: fragment.to_vec(),
        };
        if head.is_flag(flags::END_HEADERS) {
            self.finish_header_block(cx, pending)
        } else {
            self.pending_headers = Some(pending);
            Ok(())
        }
    }

    fn on_continuation(
        &mut self,
        cx: &mut ConnectionCx<'_>,
        head: FrameHead,
        payload: &[u8],
    ) -> Result<(), Reason> {
        let mut pending = self.pending_headers.take().ok_or(Reason::Protocol)?;
        if pending.stream_id != head.stream_id {
            return Err(Reason::Protocol);
        }
        pending.fragment.extend_from_slice(payload);
        if pending.fragment.len() > self.settings.max_header_list_size as usize * 2 {
            return Err(Reason::EnhanceYourCalm);
        }
        if head.is_flag(flags::END_HEADERS) {
            self.finish_header_block(cx, pending)
        } else {
            self.pending_headers = Some(pending);
            Ok(())
        }
    }

    fn finish_header_block(
        &mut self,
        cx: &mut ConnectionCx<'_>,
        pending: PendingHeaders,
    ) -> Result<(), Reason> {
        let headers = self
            .decoder
            .decode(&pending.fragment)
            .map_err(|_| Reason::Compression)?;

        if self.streams.contains(pending.stream_id) {
            // trailers on an open stream
            let slot = self
                .streams
                .get_mut(pending.stream_id)
                .expect("stream checked");
            if !slot.state.can_recv() {
                return Err(Reason::StreamClosed);
            }
            for (name, value) in &headers {
                if name.starts_with(b":") {
                    return Err(Reason::Protocol);
                }
                let _ = slot.channel.on_message_header(name, value);
            }
            if pending.end_stream {
                let _ = slot.channel.on_message_end();
                slot.state = slot.state.recv_close();
            }
            return Ok(());
        }

        // new peer-initiated stream: odd id, strictly increasing
        if pending.stream_id % 2 == 0 || pending.stream_id <= self.last_stream_id {
            return Err(Reason::Protocol);
        }
        if self.goaway_sent || self.goaway_received {
            return Ok(());
        }
        if self.streams.len() >= self.settings.max_concurrent_streams as usize {
            self.reset_stream_frame(cx, pending.stream_id, Reason::RefusedStream);
            return Ok(());
        }
        self.last_stream_id = pending.stream_id;

        let mut method: Option<Vec<u8>> = None;
        let mut path: Option<Vec<u8>> = None;
        let mut authority: Option<Vec<u8>> = None;
        let mut regular: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (name, value) in headers {
            match name.as_slice() {
                b":method" => method = Some(value),
                b":path" => path = Some(value),
                b":authority" => authority = Some(value),
                b":scheme" => {}
                other if other.starts_with(b":") => return Err(Reason::Protocol),
                _ => regular.push((name, value)),
            }
        }
        let method = method.ok_or(Reason::Protocol)?;
        let path = path.ok_or(Reason::Protocol)?;

        let mut channel = HttpChannel::new(Arc::clone(&self.server));
        let (exclusive, dependency, weight) = match pending.priority {
            Some(p) => (p.exclusive, p.dependency, p.weight),
            None => (false, 0, 16),
        };

        let deliver = (|| -> crate::Result<()> {
            channel.on_message_begin(&crate::listener::StartLine::Request {
                method: &method,
                target: &path,
                version: Version::HTTP_2,
            })?;
            if let Some(authority) = authority {
                channel.on_message_header(b"Host", &authority)?;
            }
            for (name, value) in &regular {
                channel.on_message_header(name, value)?;
            }
            channel.on_message_header_end()?;
            if pending.end_stream {
                channel.on_message_end()?;
            }
            Ok(())
        })();

        if let Err(ref err) = deliver {
            // lets the channel stage an error response for this stream
            tracing::debug!(stream = pending.stream_id, "h2 request rejected: {}", err);
            channel.on_error(err);
        }
        let mut slot = StreamSlot::new(
            channel,
            self.peer_initial_window,
            self.settings.initial_window_size,
        );
        if pending.end_stream {
            slot.state = slot.state.recv_close();
        }
        self.streams
            .insert(pending.stream_id, dependency, exclusive, weight, slot)
            .map_err(|_| Reason::Protocol)?;
        Ok(())
    }

    fn on_data(
        &mut self,
        cx: &mut ConnectionCx<'_>,
        head: FrameHead,
        payload: Bytes,
    ) -> Result<(), Reason> {
        if head.stream_id == CONNECTION_STREAM {
            return Err(Reason::Protocol);
        }
        let len = payload.len() as u32;
        let data = strip_padding(&head, &payload)?.to_vec();
        // account against both receive windows, then replenish
        if (self.conn_recv_window.sendable() as u64) < len as u64 {
            return Err(Reason::FlowControl);
        }
        self.conn_recv_window.consume(len as u64);
        let recv_ok = self
            .streams
            .get(head.stream_id)
            .map(|slot| slot.state.can_recv())
            .unwrap_or(false);
        if !recv_ok {
            // stream-scoped: reset just this stream, replenish the
            // connection window the payload consumed
            self.conn_recv_window.grow(len).ok();
            cx.endpoint
                .write_bytes(frame::encode_rst_stream(head.stream_id, Reason::StreamClosed));
            return Ok(());
        }
        let slot = self
            .streams
            .get_mut(head.stream_id)
            .expect("stream checked above");
        if (slot.recv_window.sendable() as u64) < len as u64 {
            return Err(Reason::FlowControl);
        }
        slot.recv_window.consume(len as u64);
        if !data.is_empty() {
            let _ = slot.channel.on_message_content(&data);
        }
        let end_stream = head.is_flag(flags::END_STREAM);
        if end_stream {
            let _ = slot.channel.on_message_end();
            slot.state = slot.state.recv_close();
        } else if len > 0 {
            slot.recv_window.grow(len)?;
            cx.endpoint
                .write_bytes(frame::encode_window_update(head.stream_id, len));
        }
        if len > 0 {
            // the connection window replenishes even for final frames
            self.conn_recv_window.grow(len)?;
            cx.endpoint
                .write_bytes(frame::encode_window_update(CONNECTION_STREAM, len));
        }
        Ok(())
    }

    fn on_priority(&mut self, head: FrameHead, payload: &[u8]) -> Result<(), Reason> {
        if head.stream_id == CONNECTION_STREAM {
            return Err(Reason::Protocol);
        }
        let priority = Priority::load(payload)?;
        if priority.dependency == head.stream_id {
            return Err(Reason::Protocol);
        }
        if self.streams.contains(head.stream_id) {
            self.streams
                .reparent(head.stream_id, priority.dependency, priority.exclusive)
                .ok();
            self.streams.set_weight(head.stream_id, priority.weight);
        }
        Ok(())
    }

    fn on_reset(&mut self, head: FrameHead, payload: &[u8]) -> Result<(), Reason> {
        if payload.len() != 4 {
            return Err(Reason::FrameSize);
        }
        let reason = Reason::from_u32(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]));
        tracing::debug!(stream = head.stream_id, %reason, "peer reset");
        // aborts the stream's channel outright
        self.streams.remove(head.stream_id);
        Ok(())
    }

    /// Sends everything every stream can legally send, then flushes.
    fn pump(&mut self, cx: &mut ConnectionCx<'_>) {
        if !self.settings_sent {
            self.send_initial_settings(cx);
        }
        let mut finished: Vec<StreamId> = Vec::new();
        for id in self.streams.ids() {
            self.pump_stream(cx, id);
            if let Some(slot) = self.streams.get(id) {
                if slot.finished && slot.state.is_closed() {
                    finished.push(id);
                }
            }
        }
        for id in finished {
            cx.worker.note_request();
            self.streams.remove(id);
            tracing::trace!(stream = id, "h2 stream done");
        }

        match cx.endpoint.flush() {
            Ok((FlushStatus::Done, _)) => {
                if self.goaway_sent && self.streams.is_empty() {
                    cx.defer_close();
                    return;
                }
                if cx.endpoint.is_eof() {
                    cx.defer_close();
                    return;
                }
                if let Err(err) = cx.want_fill() {
                    tracing::debug!("h2 want_fill failed: {}", err);
                    cx.defer_close();
                }
            }
            Ok((FlushStatus::Blocked, _)) => {
                if let Err(err) = cx.want_flush() {
                    tracing::debug!("h2 want_flush failed: {}", err);
                    cx.defer_close();
                }
            }
            Err(err) => {
                tracing::debug!("h2 flush error: {}", err);
                cx.defer_close();
            }
        }
    }

    fn pump_stream(&mut self, cx: &mut ConnectionCx<'_>, id: StreamId) {
        // response head
        let needs_head = {
            let slot = match self.streams.get(id) {
                Some(s) => s,
                None => return,
            };
            !slot.head_sent && slot.channel.response().is_committed()
        };
        if needs_head {
            let block = {
                let slot = self.streams.get(id).expect("stream present");
                let response = slot.channel.response();
                let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
                fields.push((
                    b":status".to_vec(),
                    response.status().as_u16().to_string().into_bytes(),
                ));
                if let Some(len) = response.content_length() {
                    if !response.is_content_forbidden() {
                        fields.push((b"content-length".to_vec(), len.to_string().into_bytes()));
                    }
                }
                for field in response.headers() {
                    if crate::headers::HeaderFieldList::is_connection_field(&field.name) {
                        continue;
                    }
                    fields.push((
                        field.name.to_ascii_lowercase().into_bytes(),
                        field.value.clone().into_bytes(),
                    ));
                }
                self.encoder.encode(&fields)
            };
            let slot = self.streams.get_mut(id).expect("stream present");
            let no_body = slot.channel.state() == ChannelState::SendingLast
                && !slot.channel.has_output()
                && slot.channel.response().trailers().is_empty();
            let mut head_flags = flags::END_HEADERS;
            if no_body {
                head_flags |= flags::END_STREAM;
                slot.end_sent = true;
                slot.state = slot.state.send_close();
            }
            cx.endpoint
                .write_bytes(frame::encode_frame(FrameKind::Headers, head_flags, id, &block));
            let slot = self.streams.get_mut(id).expect("stream present");
            slot.head_sent = true;
        }

        // body
        loop {
            let slot = match self.streams.get_mut(id) {
                Some(s) => s,
                None => return,
            };
            if !slot.head_sent || slot.end_sent {
                break;
            }
            for chunk in slot.channel.take_output() {
                slot.queued.push_back(chunk);
            }
            let front_len = match slot.queued.front() {
                Some(chunk) => chunk.len(),
                None => break,
            };
            let budget = slot
                .send_window
                .sendable()
                .min(self.conn_send_window.sendable())
                .min(self.peer_max_frame_size as u64);
            if budget == 0 {
                // blocked on flow control; WINDOW_UPDATE resumes us
                break;
            }
            let take = front_len.min(budget);
            let payload: Chunk = {
                let front = slot.queued.front_mut().expect("non-empty");
                split_chunk(front, take)
            };
            // file views may come up short; the frame head must carry
            // the actual payload length
            let actual = payload.len();
            if slot
                .queued
                .front()
                .map(|c| c.is_empty())
                .unwrap_or(false)
            {
                slot.queued.pop_front();
            }
            if actual == 0 {
                continue;
            }
            slot.send_window.consume(actual);
            self.conn_send_window.consume(actual);
            let mut head_buf = BytesMut::with_capacity(FRAME_HEADER_LEN);
            FrameHead::new(FrameKind::Data, 0, id, actual as u32).encode(&mut head_buf);
            cx.endpoint.write_bytes(head_buf.freeze());
            cx.endpoint.write(payload);
        }

        // end of stream: trailers or an empty END_STREAM DATA frame
        let slot = match self.streams.get_mut(id) {
            Some(s) => s,
            None => return,
        };
        if slot.head_sent
            && !slot.end_sent
            && slot.queued.is_empty()
            && !slot.channel.has_output()
            && slot.channel.state() == ChannelState::SendingLast
        {
            let trailers: Vec<(Vec<u8>, Vec<u8>)> = slot
                .channel
                .response()
                .trailers()
                .iter()
                .map(|f| {
                    (
                        f.name.to_ascii_lowercase().into_bytes(),
                        f.value.clone().into_bytes(),
                    )
                })
                .collect();
            if trailers.is_empty() {
                let mut head_buf = BytesMut::with_capacity(FRAME_HEADER_LEN);
                FrameHead::new(FrameKind::Data, flags::END_STREAM, id, 0).encode(&mut head_buf);
                cx.endpoint.write_bytes(head_buf.freeze());
            } else {
                let block = self.encoder.encode(&trailers);
                cx.endpoint.write_bytes(frame::encode_frame(
                    FrameKind::Headers,
                    flags::END_HEADERS | flags::END_STREAM,
                    id,
                    &block,
                ));
            }
            let slot = self.streams.get_mut(id).expect("stream present");
            slot.end_sent = true;
            slot.state = slot.state.send_close();
        }

        let slot = match self.streams.get_mut(id) {
            Some(s) => s,
            None => return,
        };
        if slot.end_sent && !slot.finished {
            if slot.channel.state() == ChannelState::SendingLast {
                slot.channel.finish();
            }
            slot.finished = true;
            // a fully answered stream the peer never closed is reset
            if !slot.state.is_closed() {
                self.reset_stream_frame(cx, id, Reason::NoError);
                let slot = self.streams.get_mut(id).expect("stream present");
                slot.state = StreamState::Closed;
            }
        }
    }

    fn reset_stream_frame(&self, cx: &mut ConnectionCx<'_>, id: StreamId, reason: Reason) {
        cx.endpoint
            .write_bytes(frame::encode_rst_stream(id, reason));
    }

    /// Connection-scoped failure: GOAWAY then teardown.
    fn connection_error(&mut self, cx: &mut ConnectionCx<'_>, reason: Reason) {
        if !self.goaway_sent {
            tracing::debug!(%reason, last = self.last_stream_id, "h2 goaway");
            cx.endpoint
                .write_bytes(frame::encode_goaway(self.last_stream_id, reason));
            self.goaway_sent = true;
        }
        let _ = cx.endpoint.flush();
        cx.defer_close();
    }
}

impl Connection for Http2Connection {
    fn on_open(&mut self, cx: &mut ConnectionCx<'_>, data_ready: bool) {
        tracing::trace!(fd = cx.endpoint.fd(), "h2 open");
        self.send_initial_settings(cx);
        if data_ready {
            self.on_fillable(cx);
        } else {
            self.pump(cx);
        }
    }

    fn on_fillable(&mut self, cx: &mut ConnectionCx<'_>) {
        match cx.endpoint.fill() {
            Ok(0) if cx.endpoint.is_eof() => {
                self.process(cx);
            }
            Ok(_) => self.process(cx),
            Err(err) => {
                tracing::debug!("h2 read error: {}", err);
                cx.defer_close();
            }
        }
    }

    fn on_flushable(&mut self, cx: &mut ConnectionCx<'_>) {
        self.pump(cx);
    }

    fn on_interest_failure(&mut self, cx: &mut ConnectionCx<'_>, error: Error) {
        tracing::debug!(fd = cx.endpoint.fd(), "h2 interest failure: {}", error);
        self.connection_error(cx, Reason::NoError);
    }

    fn on_close(&mut self, cx: &mut ConnectionCx<'_>) {
        if !self.goaway_sent && self.settings_sent {
            cx.endpoint
                .write_bytes(frame::encode_goaway(self.last_stream_id, Reason::NoError));
            let _ = cx.endpoint.flush();
            self.goaway_sent = true;
        }
    }
}

/// Strips PADDED framing from a DATA/HEADERS payload.
fn strip_padding<'a>(head: &FrameHead, payload: &'a [u8]) -> Result<&'a [u8], Reason> {
    if !head.is_flag(flags::PADDED) {
        return Ok(payload);
    }
    let pad = *payload.first().ok_or(Reason::FrameSize)? as usize;
    if pad + 1 > payload.len() {
        return Err(Reason::Protocol);
    }
    Ok(&payload[1..payload.len() - pad])
}

/// Takes up to `n` bytes off the front of a chunk.
fn split_chunk(chunk: &mut Chunk, n: u64) -> Chunk {
    match chunk {
        Chunk::Data(bytes) => {
            let take = (n as usize).min(bytes.len());
            Chunk::Data(bytes.split_to(take))
        }
        Chunk::File(view) => {
            // bounded read keeps the frame length exact
            match view.read_chunk(n as usize) {
                Ok(data) if !data.is_empty() => Chunk::Data(data),
                _ => {
                    view.exhaust();
                    Chunk::Data(Bytes::new())
                }
            }
        }
    }
}

/// Builds HTTP/2 connections; registered under `"h2"`.
pub struct Http2Factory {
    settings: Http2Settings,
}

impl Http2Factory {
    pub fn new(settings: Http2Settings) -> Http2Factory {
        Http2Factory { settings }
    }

    pub fn from_config(config: &crate::server::ServerConfig) -> Http2Factory {
        Http2Factory::new(Http2Settings {
            max_concurrent_streams: config.http2_max_concurrent_streams,
            header_table_size: config.http2_header_table_size,
            initial_window_size: config.http2_initial_window_size,
            max_frame_size: config.http2_max_frame_size,
            max_header_list_size: config.http2_max_header_list_size,
        })
    }
}

impl Default for Http2Factory {
    fn default() -> Http2Factory {
        Http2Factory::new(Http2Settings::default())
    }
}

impl ConnectionFactory for Http2Factory {
    fn protocol(&self) -> &'static str {
        "h2"
    }

    fn create(&self, worker: &Rc<WorkerCtx>) -> Box<dyn Connection> {
        Box::new(Http2Connection::new(worker, self.settings.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preface_has_rfc_length() {
        assert_eq!(PREFACE.len(), 24);
        assert!(PREFACE.starts_with(b"PRI * HTTP/2.0"));
    }

    #[test]
    fn strip_padding_handles_bounds() {
        let head = FrameHead::new(FrameKind::Data, flags::PADDED, 1, 5);
        assert_eq!(strip_padding(&head, &[2, b'h', b'i', 0, 0]).unwrap(), b"hi");
        assert_eq!(
            strip_padding(&head, &[9, 0, 0]).unwrap_err(),
            Reason::Protocol
        );
        let unpadded = FrameHead::new(FrameKind::Data, 0, 1, 2);
        assert_eq!(strip_padding(&unpadded, b"hi").unwrap(), b"hi");
    }

    #[test]
    fn split_chunk_takes_prefix() {
        let mut chunk = Chunk::Data(Bytes::from_static(b"abcdef"));
        let taken = split_chunk(&mut chunk, 4);
        match taken {
            Chunk::Data(b) => assert_eq!(&b[..], b"abcd"),
            _ => panic!(),
        }
        assert_eq!(chunk.len(), 2);
    }
}
