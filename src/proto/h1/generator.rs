//! HTTP/1 wire generation: heads, body framing, trailers.

use bytes::Bytes;
use http::Version;

use crate::headers::HeaderFieldList;
use crate::net::endpoint::Chunk;
use crate::response::HttpResponse;

use super::date;

/// How the body section is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Identity body of a declared size.
    ContentLength(u64),
    Chunked,
    /// HTTP/1.0 response without a length: ends when the peer closes.
    CloseDelimited,
    /// Status or method forbids a body section entirely.
    None,
}

/// Stateless head/body renderer; one per connection for keep-alive
/// header composition.
#[derive(Debug, Clone)]
pub struct Generator {
    server_token: &'static str,
    /// Advertised in `Keep-Alive: timeout=..` on 1.0 responses.
    keep_alive_timeout_secs: u64,
    keep_alive_max: usize,
}

impl Generator {
    pub fn new(keep_alive_timeout_secs: u64, keep_alive_max: usize) -> Generator {
        Generator {
            server_token: concat!("strand/", env!("CARGO_PKG_VERSION")),
            keep_alive_timeout_secs,
            keep_alive_max,
        }
    }

    /// Renders the status line and headers, synthesising the
    /// connection-managed fields from structured state. Returns the
    /// framing the body section must use.
    pub fn response_head(
        &self,
        response: &HttpResponse,
        is_head_request: bool,
        keep_alive: bool,
        dst: &mut Vec<u8>,
    ) -> BodyFraming {
        let version = response.version();
        match version {
            Version::HTTP_10 => dst.extend_from_slice(b"HTTP/1.0 "),
            _ => dst.extend_from_slice(b"HTTP/1.1 "),
        }
        let mut itoa_buf = itoa::Buffer::new();
        dst.extend_from_slice(itoa_buf.format(response.status().as_u16()).as_bytes());
        dst.push(b' ');
        dst.extend_from_slice(response.reason().as_bytes());
        dst.extend_from_slice(b"\r\n");

        date::extend(dst);
        dst.extend_from_slice(b"Server: ");
        dst.extend_from_slice(self.server_token.as_bytes());
        dst.extend_from_slice(b"\r\n");

        for field in response.headers() {
            // user storage of connection-managed names is already
            // refused; parser-injected ones must not leak either
            if HeaderFieldList::is_connection_field(&field.name) {
                continue;
            }
            dst.extend_from_slice(field.name.as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(field.value.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }

        let body_forbidden = response.is_content_forbidden();
        let framing = if body_forbidden {
            BodyFraming::None
        } else {
            match response.content_length() {
                Some(n) if response.registered_trailers().is_empty() => {
                    dst.extend_from_slice(b"Content-Length: ");
                    dst.extend_from_slice(itoa_buf.format(n).as_bytes());
                    dst.extend_from_slice(b"\r\n");
                    if is_head_request {
                        BodyFraming::None
                    } else {
                        BodyFraming::ContentLength(n)
                    }
                }
                _ => {
                    if version == Version::HTTP_10 {
                        if is_head_request {
                            BodyFraming::None
                        } else {
                            BodyFraming::CloseDelimited
                        }
                    } else {
                        dst.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
                        if !response.registered_trailers().is_empty() {
                            dst.extend_from_slice(b"Trailer: ");
                            for (i, name) in response.registered_trailers().iter().enumerate() {
                                if i > 0 {
                                    dst.extend_from_slice(b", ");
                                }
                                dst.extend_from_slice(name.as_bytes());
                            }
                            dst.extend_from_slice(b"\r\n");
                        }
                        if is_head_request {
                            BodyFraming::None
                        } else {
                            BodyFraming::Chunked
                        }
                    }
                }
            }
        };

        let effective_keep_alive = keep_alive && framing != BodyFraming::CloseDelimited;
        match (version, effective_keep_alive) {
            (Version::HTTP_10, true) => {
                dst.extend_from_slice(b"Connection: keep-alive\r\n");
                dst.extend_from_slice(
                    format!(
                        "Keep-Alive: timeout={}, max={}\r\n",
                        self.keep_alive_timeout_secs, self.keep_alive_max
                    )
                    .as_bytes(),
                );
            }
            (Version::HTTP_10, false) => {}
            (_, true) => {}
            (_, false) => dst.extend_from_slice(b"Connection: close\r\n"),
        }

        dst.extend_from_slice(b"\r\n");
        framing
    }

    /// Interim `100 Continue` line.
    pub fn continue_head(&self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
    }

    /// Frames one body chunk for the wire. Byte chunks pass through in
    /// identity framing; chunked framing wraps every chunk (including
    /// file views, whose length is known) in a size line and CRLF.
    pub fn body_chunk(&self, framing: BodyFraming, chunk: Chunk, out: &mut Vec<Chunk>) {
        if chunk.is_empty() {
            return;
        }
        match framing {
            BodyFraming::None => {}
            BodyFraming::ContentLength(_) | BodyFraming::CloseDelimited => out.push(chunk),
            BodyFraming::Chunked => {
                let mut size_line = Vec::with_capacity(16);
                let hex = format!("{:x}", chunk.len());
                size_line.extend_from_slice(hex.as_bytes());
                size_line.extend_from_slice(b"\r\n");
                out.push(Chunk::Data(Bytes::from(size_line)));
                out.push(chunk);
                out.push(Chunk::Data(Bytes::from_static(b"\r\n")));
            }
        }
    }

    /// Terminates the body: the chunked last-chunk plus any trailers.
    pub fn finish_body(
        &self,
        framing: BodyFraming,
        trailers: &HeaderFieldList,
        out: &mut Vec<Chunk>,
    ) {
        if framing != BodyFraming::Chunked {
            return;
        }
        let mut tail = Vec::with_capacity(8);
        tail.extend_from_slice(b"0\r\n");
        for field in trailers {
            tail.extend_from_slice(field.name.as_bytes());
            tail.extend_from_slice(b": ");
            tail.extend_from_slice(field.value.as_bytes());
            tail.extend_from_slice(b"\r\n");
        }
        tail.extend_from_slice(b"\r\n");
        out.push(Chunk::Data(Bytes::from(tail)));
    }
}

impl Default for Generator {
    fn default() -> Generator {
        Generator::new(60, 100)
    }
}
