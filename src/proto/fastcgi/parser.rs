//! FastCGI record parsing and CGI-to-HTTP translation.

use std::collections::HashMap;

use bytes::BytesMut;
use http::Version;

use crate::error::{Error, Parse, Result};
use crate::listener::{HttpListener, StartLine};

use super::{RecordType, Role, RECORD_HEADER_LEN, VERSION_1};

/// Connection-level callbacks the parser raises besides the per-request
/// [`HttpListener`] events.
pub trait FastcgiListener {
    /// A request began; returns false to refuse it (multiplex limits).
    fn on_request_begin(&mut self, request_id: u16, keep_conn: bool) -> bool;

    /// The HTTP-listener for an admitted request.
    fn channel(&mut self, request_id: u16) -> Option<&mut dyn HttpListener>;

    /// The web server aborted the request.
    fn on_request_abort(&mut self, request_id: u16);

    /// A BeginRequest named a role we do not implement.
    fn on_unknown_role(&mut self, request_id: u16);

    /// FCGI_GET_VALUES management query.
    fn on_get_values(&mut self, names: Vec<Vec<u8>>);

    /// An unrecognised record type arrived.
    fn on_unknown_record(&mut self, record_type: u8);
}

#[derive(Default)]
struct StreamState {
    /// Param bytes may split across records; pairs decode only once the
    /// stream terminates.
    params_buf: Vec<u8>,
    params_done: bool,
    body_started: bool,
}

/// Parses a record-multiplexed byte stream, one instance per socket.
pub struct RequestParser {
    streams: HashMap<u16, StreamState>,
}

impl RequestParser {
    pub fn new() -> RequestParser {
        RequestParser {
            streams: HashMap::new(),
        }
    }

    /// Live (begun, not yet ended) request count.
    pub fn active_requests(&self) -> usize {
        self.streams.len()
    }

    /// Consumes whole records out of `buf`.
    pub fn parse(
        &mut self,
        buf: &mut BytesMut,
        listener: &mut dyn FastcgiListener,
    ) -> Result<()> {
        loop {
            if buf.len() < RECORD_HEADER_LEN {
                return Ok(());
            }
            let content_length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            let padding_length = buf[6] as usize;
            let total = RECORD_HEADER_LEN + content_length + padding_length;
            if buf.len() < total {
                return Ok(());
            }
            let record = buf.split_to(total);
            if record[0] != VERSION_1 {
                return Err(Error::new_parse(Parse::Record));
            }
            let record_type = RecordType::from_u8(record[1]);
            let request_id = u16::from_be_bytes([record[2], record[3]]);
            let content = &record[RECORD_HEADER_LEN..RECORD_HEADER_LEN + content_length];
            tracing::trace!(?record_type, request_id, len = content_length, "fcgi record");
            self.dispatch(record_type, request_id, content, listener)?;
        }
    }

    fn dispatch(
        &mut self,
        record_type: RecordType,
        request_id: u16,
        content: &[u8],
        listener: &mut dyn FastcgiListener,
    ) -> Result<()> {
        match record_type {
            RecordType::BeginRequest => {
                if content.len() != 8 {
                    return Err(Error::new_parse(Parse::Record));
                }
                if self.streams.contains_key(&request_id) || request_id == 0 {
                    return Err(Error::new_parse(Parse::Record));
                }
                let role = Role::from_u16(u16::from_be_bytes([content[0], content[1]]));
                let keep_conn = content[2] & super::FLAG_KEEP_CONN != 0;
                if role != Role::Responder {
                    listener.on_unknown_role(request_id);
                    return Ok(());
                }
                if listener.on_request_begin(request_id, keep_conn) {
                    self.streams.insert(request_id, StreamState::default());
                }
                Ok(())
            }
            RecordType::AbortRequest => {
                self.streams.remove(&request_id);
                listener.on_request_abort(request_id);
                Ok(())
            }
            RecordType::Params => {
                let done = {
                    let state = match self.streams.get_mut(&request_id) {
                        Some(state) => state,
                        None => return Ok(()),
                    };
                    if content.is_empty() {
                        state.params_done = true;
                        true
                    } else {
                        state.params_buf.extend_from_slice(content);
                        false
                    }
                };
                if done {
                    self.finish_params(request_id, listener);
                }
                Ok(())
            }
            RecordType::StdIn => {
                let params_done = {
                    match self.streams.get_mut(&request_id) {
                        Some(state) => {
                            state.body_started = true;
                            state.params_done
                        }
                        None => return Ok(()),
                    }
                };
                if !params_done {
                    // body before the params stream terminated
                    self.fail_request(request_id, listener, Error::new_parse(Parse::Record));
                    return Ok(());
                }
                if content.is_empty() {
                    self.streams.remove(&request_id);
                    if let Some(channel) = listener.channel(request_id) {
                        if let Err(err) = channel.on_message_end() {
                            channel.on_error(&err);
                        }
                    }
                } else {
                    let failed = match listener.channel(request_id) {
                        Some(channel) => match channel.on_message_content(content) {
                            Ok(()) => false,
                            Err(err) => {
                                channel.on_error(&err);
                                true
                            }
                        },
                        None => false,
                    };
                    if failed {
                        self.streams.remove(&request_id);
                    }
                }
                Ok(())
            }
            // filter-role data; responder ignores it
            RecordType::Data => Ok(()),
            RecordType::GetValues => {
                let names = decode_pairs(content)?
                    .into_iter()
                    .map(|(name, _)| name)
                    .collect();
                listener.on_get_values(names);
                Ok(())
            }
            RecordType::StdOut
            | RecordType::StdErr
            | RecordType::EndRequest
            | RecordType::GetValuesResult
            | RecordType::UnknownType => {
                // server-to-web-server record types arriving here are a
                // peer bug; drop them
                Ok(())
            }
            RecordType::Unknown(raw) => {
                listener.on_unknown_record(raw);
                Ok(())
            }
        }
    }

    /// Decodes accumulated params and synthesises the request head.
    /// Failures stay scoped to this request id; sibling multiplexed
    /// requests on the connection are untouched.
    fn finish_params(&mut self, request_id: u16, listener: &mut dyn FastcgiListener) {
        let raw = {
            let state = self
                .streams
                .get_mut(&request_id)
                .expect("stream present in finish_params");
            std::mem::take(&mut state.params_buf)
        };

        let deliver = (|| -> Result<()> {
            let pairs = decode_pairs(&raw)?;

            let mut method: Option<Vec<u8>> = None;
            let mut target: Option<Vec<u8>> = None;
            let mut protocol: Option<Vec<u8>> = None;
            let mut content_type: Option<Vec<u8>> = None;
            let mut content_length: Option<Vec<u8>> = None;
            let mut headers: Vec<(String, Vec<u8>)> = Vec::new();
            for (name, value) in pairs {
                if let Some(stripped) = name.strip_prefix(b"HTTP_") {
                    // HTTP_ACCEPT_ENCODING -> Accept-Encoding style names are
                    // not reconstructable; the underscore swap suffices
                    let header = String::from_utf8_lossy(stripped).replace('_', "-");
                    headers.push((header, value));
                    continue;
                }
                match name.as_slice() {
                    b"REQUEST_METHOD" => method = Some(value),
                    b"REQUEST_URI" => target = Some(value),
                    b"SERVER_PROTOCOL" => protocol = Some(value),
                    b"CONTENT_TYPE" => content_type = Some(value),
                    b"CONTENT_LENGTH" => content_length = Some(value),
                    _ => {}
                }
            }

            let method = method.ok_or_else(|| Error::new_parse(Parse::Record))?;
            let target = target.ok_or_else(|| Error::new_parse(Parse::Record))?;
            let version = match protocol.as_deref() {
                Some(b"HTTP/1.0") => Version::HTTP_10,
                _ => Version::HTTP_11,
            };

            let channel = match listener.channel(request_id) {
                Some(channel) => channel,
                None => return Ok(()),
            };
            channel.on_message_begin(&StartLine::Request {
                method: &method,
                target: &target,
                version,
            })?;
            for (name, value) in &headers {
                channel.on_message_header(name.as_bytes(), value)?;
            }
            if let Some(value) = content_type {
                channel.on_message_header(b"Content-Type", &value)?;
            }
            if let Some(value) = content_length {
                channel.on_message_header(b"Content-Length", &value)?;
            }
            channel.on_message_header_end()
        })();

        if let Err(err) = deliver {
            self.fail_request(request_id, listener, err);
        }
    }

    /// Poisons one multiplexed request: its channel stages the error
    /// response (and its own EndRequest follows from the connection's
    /// normal completion path) while the stream stops consuming records.
    fn fail_request(&mut self, request_id: u16, listener: &mut dyn FastcgiListener, err: Error) {
        tracing::debug!(request_id, "fastcgi request failed: {}", err);
        if let Some(channel) = listener.channel(request_id) {
            channel.on_error(&err);
        }
        self.streams.remove(&request_id);
    }
}

impl Default for RequestParser {
    fn default() -> RequestParser {
        RequestParser::new()
    }
}

/// FastCGI name-value pairs: each length is 1 byte, or 4 bytes with the
/// high bit set.
fn decode_pairs(mut input: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut pairs = Vec::new();
    while !input.is_empty() {
        let (name_len, rest) = decode_length(input)?;
        let (value_len, rest) = decode_length(rest)?;
        if rest.len() < name_len + value_len {
            return Err(Error::new_parse(Parse::Record));
        }
        let (name, rest) = rest.split_at(name_len);
        let (value, rest) = rest.split_at(value_len);
        pairs.push((name.to_vec(), value.to_vec()));
        input = rest;
    }
    Ok(pairs)
}

fn decode_length(input: &[u8]) -> Result<(usize, &[u8])> {
    let first = *input.first().ok_or_else(|| Error::new_parse(Parse::Record))?;
    if first < 128 {
        return Ok((first as usize, &input[1..]));
    }
    if input.len() < 4 {
        return Err(Error::new_parse(Parse::Record));
    }
    let len = u32::from_be_bytes([input[0] & 0x7f, input[1], input[2], input[3]]) as usize;
    Ok((len, &input[4..]))
}

/// Encodes one name-value pair (used by the generator and by tests).
pub(crate) fn encode_pair(name: &[u8], value: &[u8], dst: &mut Vec<u8>) {
    for len in &[name.len(), value.len()] {
        if *len < 128 {
            dst.push(*len as u8);
        } else {
            dst.extend_from_slice(&((*len as u32) | 0x8000_0000).to_be_bytes());
        }
    }
    dst.extend_from_slice(name);
    dst.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::RecordingListener;

    struct TestSink {
        recorder: RecordingListener,
        begun: Vec<(u16, bool)>,
        aborted: Vec<u16>,
        unknown_roles: Vec<u16>,
        get_values: Vec<Vec<Vec<u8>>>,
        unknown_records: Vec<u8>,
    }

    impl TestSink {
        fn new() -> TestSink {
            TestSink {
                recorder: RecordingListener::default(),
                begun: Vec::new(),
                aborted: Vec::new(),
                unknown_roles: Vec::new(),
                get_values: Vec::new(),
                unknown_records: Vec::new(),
            }
        }
    }

    impl FastcgiListener for TestSink {
        fn on_request_begin(&mut self, request_id: u16, keep_conn: bool) -> bool {
            self.begun.push((request_id, keep_conn));
            true
        }

        fn channel(&mut self, _request_id: u16) -> Option<&mut dyn HttpListener> {
            Some(&mut self.recorder)
        }

        fn on_request_abort(&mut self, request_id: u16) {
            self.aborted.push(request_id);
        }

        fn on_unknown_role(&mut self, request_id: u16) {
            self.unknown_roles.push(request_id);
        }

        fn on_get_values(&mut self, names: Vec<Vec<u8>>) {
            self.get_values.push(names);
        }

        fn on_unknown_record(&mut self, record_type: u8) {
            self.unknown_records.push(record_type);
        }
    }

    fn record(rtype: u8, id: u16, content: &[u8]) -> Vec<u8> {
        let mut out = vec![
            VERSION_1,
            rtype,
            (id >> 8) as u8,
            id as u8,
            (content.len() >> 8) as u8,
            content.len() as u8,
            0,
            0,
        ];
        out.extend_from_slice(content);
        out
    }

    fn begin_request_body(role: u16, flags: u8) -> Vec<u8> {
        vec![(role >> 8) as u8, role as u8, flags, 0, 0, 0, 0, 0]
    }

    #[test]
    fn responder_request_produces_http_events() {
        let mut parser = RequestParser::new();
        let mut sink = TestSink::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&record(1, 1, &begin_request_body(1, 0)));
        let mut params = Vec::new();
        encode_pair(b"REQUEST_METHOD", b"GET", &mut params);
        encode_pair(b"REQUEST_URI", b"/info", &mut params);
        encode_pair(b"SERVER_PROTOCOL", b"HTTP/1.1", &mut params);
        encode_pair(b"HTTP_USER_AGENT", b"check", &mut params);
        wire.extend_from_slice(&record(4, 1, &params));
        wire.extend_from_slice(&record(4, 1, &[]));
        wire.extend_from_slice(&record(5, 1, &[]));

        let mut buf = BytesMut::from(&wire[..]);
        parser.parse(&mut buf, &mut sink).unwrap();

        assert_eq!(sink.begun, vec![(1, false)]);
        assert_eq!(
            sink.recorder.events,
            vec![
                "begin GET /info",
                "header USER-AGENT: check",
                "header-end",
                "end"
            ]
        );
        assert!(buf.is_empty());
        assert_eq!(parser.active_requests(), 0);
    }

    #[test]
    fn stdin_body_is_concatenated() {
        let mut parser = RequestParser::new();
        let mut sink = TestSink::new();
        let mut params = Vec::new();
        encode_pair(b"REQUEST_METHOD", b"POST", &mut params);
        encode_pair(b"REQUEST_URI", b"/u", &mut params);
        encode_pair(b"SERVER_PROTOCOL", b"HTTP/1.1", &mut params);
        let mut wire = Vec::new();
        wire.extend_from_slice(&record(1, 9, &begin_request_body(1, 1)));
        wire.extend_from_slice(&record(4, 9, &params));
        wire.extend_from_slice(&record(4, 9, &[]));
        wire.extend_from_slice(&record(5, 9, b"part one "));
        wire.extend_from_slice(&record(5, 9, b"part two"));
        wire.extend_from_slice(&record(5, 9, &[]));

        let mut buf = BytesMut::from(&wire[..]);
        parser.parse(&mut buf, &mut sink).unwrap();
        assert_eq!(sink.begun, vec![(9, true)]);
        assert_eq!(sink.recorder.content, b"part one part two");
        assert_eq!(sink.recorder.events.last().unwrap(), "end");
    }

    #[test]
    fn records_split_across_reads() {
        let mut parser = RequestParser::new();
        let mut sink = TestSink::new();
        let full = record(1, 2, &begin_request_body(1, 0));
        let mut buf = BytesMut::from(&full[..5]);
        parser.parse(&mut buf, &mut sink).unwrap();
        assert!(sink.begun.is_empty());
        buf.extend_from_slice(&full[5..]);
        parser.parse(&mut buf, &mut sink).unwrap();
        assert_eq!(sink.begun, vec![(2, false)]);
    }

    #[test]
    fn unknown_role_is_reported() {
        let mut parser = RequestParser::new();
        let mut sink = TestSink::new();
        let wire = record(1, 3, &begin_request_body(7, 0));
        let mut buf = BytesMut::from(&wire[..]);
        parser.parse(&mut buf, &mut sink).unwrap();
        assert_eq!(sink.unknown_roles, vec![3]);
        assert_eq!(parser.active_requests(), 0);
    }

    #[test]
    fn abort_drops_stream() {
        let mut parser = RequestParser::new();
        let mut sink = TestSink::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&record(1, 4, &begin_request_body(1, 0)));
        wire.extend_from_slice(&record(2, 4, &[]));
        let mut buf = BytesMut::from(&wire[..]);
        parser.parse(&mut buf, &mut sink).unwrap();
        assert_eq!(sink.aborted, vec![4]);
        assert_eq!(parser.active_requests(), 0);
    }

    #[test]
    fn get_values_names_surface() {
        let mut parser = RequestParser::new();
        let mut sink = TestSink::new();
        let mut payload = Vec::new();
        encode_pair(b"FCGI_MAX_CONNS", b"", &mut payload);
        encode_pair(b"FCGI_MPXS_CONNS", b"", &mut payload);
        let wire = record(9, 0, &payload);
        let mut buf = BytesMut::from(&wire[..]);
        parser.parse(&mut buf, &mut sink).unwrap();
        assert_eq!(
            sink.get_values,
            vec![vec![b"FCGI_MAX_CONNS".to_vec(), b"FCGI_MPXS_CONNS".to_vec()]]
        );
    }

    #[test]
    fn unknown_record_type_is_reported() {
        let mut parser = RequestParser::new();
        let mut sink = TestSink::new();
        let wire = record(42, 0, &[]);
        let mut buf = BytesMut::from(&wire[..]);
        parser.parse(&mut buf, &mut sink).unwrap();
        assert_eq!(sink.unknown_records, vec![42]);
    }

    #[test]
    fn delivery_error_is_contained_to_one_request() {
        use std::collections::HashMap;

        /// One recorder per request id, so multiplexed outcomes are
        /// observable independently.
        #[derive(Default)]
        struct MuxSink {
            recorders: HashMap<u16, RecordingListener>,
        }

        impl FastcgiListener for MuxSink {
            fn on_request_begin(&mut self, request_id: u16, _keep_conn: bool) -> bool {
                self.recorders
                    .insert(request_id, RecordingListener::default());
                true
            }

            fn channel(&mut self, request_id: u16) -> Option<&mut dyn HttpListener> {
                self.recorders
                    .get_mut(&request_id)
                    .map(|r| r as &mut dyn HttpListener)
            }

            fn on_request_abort(&mut self, _request_id: u16) {}
            fn on_unknown_role(&mut self, _request_id: u16) {}
            fn on_get_values(&mut self, _names: Vec<Vec<u8>>) {}
            fn on_unknown_record(&mut self, _record_type: u8) {}
        }

        let mut parser = RequestParser::new();
        let mut sink = MuxSink::default();

        let mut bad_params = Vec::new();
        // no REQUEST_METHOD: the head cannot be synthesised
        encode_pair(b"REQUEST_URI", b"/broken", &mut bad_params);
        let mut good_params = Vec::new();
        encode_pair(b"REQUEST_METHOD", b"GET", &mut good_params);
        encode_pair(b"REQUEST_URI", b"/ok", &mut good_params);
        encode_pair(b"SERVER_PROTOCOL", b"HTTP/1.1", &mut good_params);

        let mut wire = Vec::new();
        wire.extend_from_slice(&record(1, 1, &begin_request_body(1, 1)));
        wire.extend_from_slice(&record(1, 3, &begin_request_body(1, 1)));
        wire.extend_from_slice(&record(4, 1, &bad_params));
        wire.extend_from_slice(&record(4, 1, &[]));
        wire.extend_from_slice(&record(4, 3, &good_params));
        wire.extend_from_slice(&record(4, 3, &[]));
        wire.extend_from_slice(&record(5, 3, &[]));

        let mut buf = BytesMut::from(&wire[..]);
        parser.parse(&mut buf, &mut sink).expect("stream stays parseable");

        let broken = &sink.recorders[&1];
        assert!(broken.events.iter().any(|e| e.starts_with("error")));
        assert!(!broken.events.iter().any(|e| e == "end"));

        let ok = &sink.recorders[&3];
        assert_eq!(
            ok.events,
            vec!["begin GET /ok", "header-end", "end"]
        );
        assert_eq!(parser.active_requests(), 0);
    }

    #[test]
    fn stdin_before_params_end_fails_only_that_request() {
        let mut parser = RequestParser::new();
        let mut sink = TestSink::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&record(1, 2, &begin_request_body(1, 0)));
        // StdIn with the params stream still open
        wire.extend_from_slice(&record(5, 2, b"early"));
        let mut buf = BytesMut::from(&wire[..]);
        parser.parse(&mut buf, &mut sink).expect("record stream intact");
        assert!(sink
            .recorder
            .events
            .iter()
            .any(|e| e.starts_with("error")));
        assert_eq!(parser.active_requests(), 0);
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut parser = RequestParser::new();
        let mut sink = TestSink::new();
        let mut wire = record(1, 1, &begin_request_body(1, 0));
        wire[0] = 9;
        let mut buf = BytesMut::from(&wire[..]);
        assert!(parser.parse(&mut buf, &mut sink).is_err());
    }

    #[test]
    fn long_pair_lengths_round_trip() {
        let name = vec![b'n'; 300];
        let value = vec![b'v'; 200];
        let mut encoded = Vec::new();
        encode_pair(&name, &value, &mut encoded);
        let pairs = decode_pairs(&encoded).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, name);
        assert_eq!(pairs[0].1, value);
    }
}
