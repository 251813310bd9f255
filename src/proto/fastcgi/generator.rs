//! FastCGI record generation for the responder role.

use bytes::Bytes;

use crate::response::HttpResponse;

use super::parser::encode_pair;
use super::{ProtocolStatus, RecordType, RECORD_HEADER_LEN, VERSION_1};

/// Largest record payload we emit; the field is 16 bits.
const MAX_CONTENT: usize = 0xfff8;

/// Stateless record writer.
#[derive(Debug, Default, Clone)]
pub struct Generator;

impl Generator {
    /// One record with empty padding.
    pub fn record(record_type: RecordType, request_id: u16, content: &[u8]) -> Bytes {
        debug_assert!(content.len() <= 0xffff);
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + content.len());
        out.push(VERSION_1);
        out.push(record_type.as_u8());
        out.extend_from_slice(&request_id.to_be_bytes());
        out.extend_from_slice(&(content.len() as u16).to_be_bytes());
        out.push(0);
        out.push(0);
        out.extend_from_slice(content);
        Bytes::from(out)
    }

    /// Splits `data` into StdOut records; never emits the empty
    /// terminator record here.
    pub fn stdout(request_id: u16, data: &[u8], out: &mut Vec<Bytes>) {
        for chunk in data.chunks(MAX_CONTENT) {
            out.push(Self::record(RecordType::StdOut, request_id, chunk));
        }
    }

    /// The empty StdOut record closing the response stream.
    pub fn stdout_end(request_id: u16) -> Bytes {
        Self::record(RecordType::StdOut, request_id, &[])
    }

    /// CGI-style response head carried inside the StdOut stream.
    pub fn response_head(response: &HttpResponse, dst: &mut Vec<u8>) {
        dst.extend_from_slice(b"Status: ");
        let mut itoa_buf = itoa::Buffer::new();
        dst.extend_from_slice(itoa_buf.format(response.status().as_u16()).as_bytes());
        dst.push(b' ');
        dst.extend_from_slice(response.reason().as_bytes());
        dst.extend_from_slice(b"\r\n");
        for field in response.headers() {
            if crate::headers::HeaderFieldList::is_connection_field(&field.name) {
                continue;
            }
            dst.extend_from_slice(field.name.as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(field.value.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        if let Some(len) = response.content_length() {
            dst.extend_from_slice(b"Content-Length: ");
            dst.extend_from_slice(itoa_buf.format(len).as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        dst.extend_from_slice(b"\r\n");
    }

    pub fn end_request(request_id: u16, app_status: u32, status: ProtocolStatus) -> Bytes {
        let mut content = [0u8; 8];
        content[..4].copy_from_slice(&app_status.to_be_bytes());
        content[4] = status.as_u8();
        Self::record(RecordType::EndRequest, request_id, &content)
    }

    pub fn unknown_type(record_type: u8) -> Bytes {
        let mut content = [0u8; 8];
        content[0] = record_type;
        Self::record(RecordType::UnknownType, 0, &content)
    }

    /// Reply to FCGI_GET_VALUES; `values` are `(name, value)` pairs.
    pub fn get_values_result(values: &[(&[u8], &[u8])]) -> Bytes {
        let mut payload = Vec::new();
        for (name, value) in values {
            encode_pair(name, value, &mut payload);
        }
        Self::record(RecordType::GetValuesResult, 0, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{StatusCode, Version};

    #[test]
    fn record_header_layout() {
        let record = Generator::record(RecordType::StdOut, 0x0102, b"abc");
        assert_eq!(&record[..8], &[1, 6, 1, 2, 0, 3, 0, 0]);
        assert_eq!(&record[8..], b"abc");
    }

    #[test]
    fn end_request_layout() {
        let record = Generator::end_request(7, 0, ProtocolStatus::RequestComplete);
        assert_eq!(record[1], 3);
        assert_eq!(u16::from_be_bytes([record[2], record[3]]), 7);
        let content = &record[8..];
        assert_eq!(content.len(), 8);
        assert_eq!(&content[..4], &[0, 0, 0, 0]);
        assert_eq!(content[4], 0);
    }

    #[test]
    fn unknown_type_echoes_the_type() {
        let record = Generator::unknown_type(42);
        assert_eq!(record[1], 11);
        assert_eq!(record[8], 42);
    }

    #[test]
    fn response_head_is_cgi_style() {
        let mut response = HttpResponse::new(Version::HTTP_11);
        response.set_status(StatusCode::NOT_FOUND).unwrap();
        response
            .headers_mut()
            .unwrap()
            .push("Content-Type", "text/html")
            .unwrap();
        response.set_content_length(Some(11)).unwrap();
        let mut head = Vec::new();
        Generator::response_head(&response, &mut head);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("Status: 404 Not Found\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn large_stdout_payload_splits() {
        let data = vec![b'x'; MAX_CONTENT + 100];
        let mut out = Vec::new();
        Generator::stdout(5, &data, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(
            u16::from_be_bytes([out[0][4], out[0][5]]) as usize,
            MAX_CONTENT
        );
        assert_eq!(u16::from_be_bytes([out[1][4], out[1][5]]), 100);
    }
}
