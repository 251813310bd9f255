//! Frame header codec, SETTINGS, PRIORITY and the error-code space.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

pub type StreamId = u32;

/// Frame header length on the wire.
pub const FRAME_HEADER_LEN: usize = 9;

/// Stream-id 0 addresses the connection itself.
pub const CONNECTION_STREAM: StreamId = 0;

pub mod flags {
    pub const ACK: u8 = 0x1;
    pub const END_STREAM: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl FrameKind {
    pub fn from_u8(byte: u8) -> FrameKind {
        match byte {
            0 => FrameKind::Data,
            1 => FrameKind::Headers,
            2 => FrameKind::Priority,
            3 => FrameKind::Reset,
            4 => FrameKind::Settings,
            5 => FrameKind::PushPromise,
            6 => FrameKind::Ping,
            7 => FrameKind::GoAway,
            8 => FrameKind::WindowUpdate,
            9 => FrameKind::Continuation,
            other => FrameKind::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Headers => 1,
            FrameKind::Priority => 2,
            FrameKind::Reset => 3,
            FrameKind::Settings => 4,
            FrameKind::PushPromise => 5,
            FrameKind::Ping => 6,
            FrameKind::GoAway => 7,
            FrameKind::WindowUpdate => 8,
            FrameKind::Continuation => 9,
            FrameKind::Unknown(other) => other,
        }
    }
}

/// HTTP/2 error codes (RFC 7540 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NoError,
    Protocol,
    Internal,
    FlowControl,
    SettingsTimeout,
    StreamClosed,
    FrameSize,
    RefusedStream,
    Cancel,
    Compression,
    Connect,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl Reason {
    pub fn from_u32(code: u32) -> Reason {
        match code {
            0 => Reason::NoError,
            1 => Reason::Protocol,
            2 => Reason::Internal,
            3 => Reason::FlowControl,
            4 => Reason::SettingsTimeout,
            5 => Reason::StreamClosed,
            6 => Reason::FrameSize,
            7 => Reason::RefusedStream,
            8 => Reason::Cancel,
            9 => Reason::Compression,
            10 => Reason::Connect,
            11 => Reason::EnhanceYourCalm,
            12 => Reason::InadequateSecurity,
            13 => Reason::Http11Required,
            other => Reason::Unknown(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Reason::NoError => 0,
            Reason::Protocol => 1,
            Reason::Internal => 2,
            Reason::FlowControl => 3,
            Reason::SettingsTimeout => 4,
            Reason::StreamClosed => 5,
            Reason::FrameSize => 6,
            Reason::RefusedStream => 7,
            Reason::Cancel => 8,
            Reason::Compression => 9,
            Reason::Connect => 10,
            Reason::EnhanceYourCalm => 11,
            Reason::InadequateSecurity => 12,
            Reason::Http11Required => 13,
            Reason::Unknown(other) => other,
        }
    }

}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The 9-byte frame header: 24-bit length, type, flags, R + 31-bit
/// stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHead {
    pub length: u32,
    pub kind: FrameKind,
    pub flags: u8,
    pub stream_id: StreamId,
}

impl FrameHead {
    pub fn new(kind: FrameKind, flags: u8, stream_id: StreamId, length: u32) -> FrameHead {
        debug_assert!(length < (1 << 24));
        FrameHead {
            length,
            kind,
            flags,
            stream_id,
        }
    }

    pub fn parse(bytes: &[u8]) -> FrameHead {
        debug_assert!(bytes.len() >= FRAME_HEADER_LEN);
        let length =
            ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32;
        FrameHead {
            length,
            kind: FrameKind::from_u8(bytes[3]),
            flags: bytes[4],
            // the reserved high bit is masked off
            stream_id: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]])
                & 0x7fff_ffff,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8((self.length >> 16) as u8);
        dst.put_u8((self.length >> 8) as u8);
        dst.put_u8(self.length as u8);
        dst.put_u8(self.kind.as_u8());
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7fff_ffff);
    }

    pub fn is_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }
}

/// Builds a complete small frame (header + payload) in one buffer.
pub(crate) fn encode_frame(
    kind: FrameKind,
    flags: u8,
    stream_id: StreamId,
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    FrameHead::new(kind, flags, stream_id, payload.len() as u32).encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// SETTINGS parameters (RFC 7540 §6.5.2). Unknown identifiers are
/// ignored, as required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

pub const DEFAULT_SETTINGS_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

impl Settings {
    pub fn load(payload: &[u8]) -> Result<Settings, Reason> {
        if payload.len() % 6 != 0 {
            return Err(Reason::FrameSize);
        }
        let mut settings = Settings::default();
        for raw in payload.chunks(6) {
            let id = u16::from_be_bytes([raw[0], raw[1]]);
            let value = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]);
            match id {
                SETTINGS_HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                SETTINGS_ENABLE_PUSH => match value {
                    0 => settings.enable_push = Some(false),
                    1 => settings.enable_push = Some(true),
                    _ => return Err(Reason::Protocol),
                },
                SETTINGS_MAX_CONCURRENT_STREAMS => {
                    settings.max_concurrent_streams = Some(value)
                }
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > MAX_INITIAL_WINDOW_SIZE {
                        return Err(Reason::FlowControl);
                    }
                    settings.initial_window_size = Some(value);
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(Reason::Protocol);
                    }
                    settings.max_frame_size = Some(value);
                }
                SETTINGS_MAX_HEADER_LIST_SIZE => {
                    settings.max_header_list_size = Some(value)
                }
                unknown => {
                    tracing::trace!(id = unknown, value, "ignoring unknown setting");
                }
            }
        }
        Ok(settings)
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = Vec::with_capacity(6 * 6);
        let mut put = |id: u16, value: u32| {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        };
        if let Some(v) = self.header_table_size {
            put(SETTINGS_HEADER_TABLE_SIZE, v);
        }
        if let Some(v) = self.enable_push {
            put(SETTINGS_ENABLE_PUSH, v as u32);
        }
        if let Some(v) = self.max_concurrent_streams {
            put(SETTINGS_MAX_CONCURRENT_STREAMS, v);
        }
        if let Some(v) = self.initial_window_size {
            put(SETTINGS_INITIAL_WINDOW_SIZE, v);
        }
        if let Some(v) = self.max_frame_size {
            put(SETTINGS_MAX_FRAME_SIZE, v);
        }
        if let Some(v) = self.max_header_list_size {
            put(SETTINGS_MAX_HEADER_LIST_SIZE, v);
        }
        encode_frame(FrameKind::Settings, 0, CONNECTION_STREAM, &payload)
    }

    pub fn ack() -> Bytes {
        encode_frame(FrameKind::Settings, flags::ACK, CONNECTION_STREAM, &[])
    }
}

/// A PRIORITY payload (also carried by HEADERS with the priority flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: StreamId,
    /// Wire weight is 0..=255 and means 1..=256.
    pub weight: u16,
}

impl Priority {
    pub fn load(payload: &[u8]) -> Result<Priority, Reason> {
        if payload.len() != 5 {
            return Err(Reason::FrameSize);
        }
        let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(Priority {
            exclusive: raw & 0x8000_0000 != 0,
            dependency: raw & 0x7fff_ffff,
            weight: payload[4] as u16 + 1,
        })
    }

    pub fn encode_payload(&self) -> [u8; 5] {
        let mut raw = self.dependency & 0x7fff_ffff;
        if self.exclusive {
            raw |= 0x8000_0000;
        }
        let bytes = raw.to_be_bytes();
        [
            bytes[0],
            bytes[1],
            bytes[2],
            bytes[3],
            (self.weight - 1) as u8,
        ]
    }
}

pub(crate) fn encode_rst_stream(stream_id: StreamId, reason: Reason) -> Bytes {
    encode_frame(
        FrameKind::Reset,
        0,
        stream_id,
        &reason.as_u32().to_be_bytes(),
    )
}

pub(crate) fn encode_goaway(last_stream_id: StreamId, reason: Reason) -> Bytes {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
    payload[4..].copy_from_slice(&reason.as_u32().to_be_bytes());
    encode_frame(FrameKind::GoAway, 0, CONNECTION_STREAM, &payload)
}

pub(crate) fn encode_window_update(stream_id: StreamId, increment: u32) -> Bytes {
    encode_frame(
        FrameKind::WindowUpdate,
        0,
        stream_id,
        &(increment & 0x7fff_ffff).to_be_bytes(),
    )
}

pub(crate) fn encode_ping(ack: bool, payload: &[u8; 8]) -> Bytes {
    encode_frame(
        FrameKind::Ping,
        if ack { flags::ACK } else { 0 },
        CONNECTION_STREAM,
        payload,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_head_round_trip() {
        let head = FrameHead::new(FrameKind::Headers, flags::END_HEADERS, 5, 1234);
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN);
        let parsed = FrameHead::parse(&buf);
        assert_eq!(parsed, head);
    }

    #[test]
    fn reserved_bit_is_masked() {
        let mut buf = BytesMut::new();
        FrameHead::new(FrameKind::Data, 0, 7, 0).encode(&mut buf);
        buf[5] |= 0x80;
        assert_eq!(FrameHead::parse(&buf).stream_id, 7);
    }

    #[test]
    fn settings_round_trip() {
        let mut settings = Settings::default();
        settings.header_table_size = Some(8192);
        settings.max_concurrent_streams = Some(64);
        settings.initial_window_size = Some(1 << 20);
        let wire = settings.encode();
        let head = FrameHead::parse(&wire);
        assert_eq!(head.kind, FrameKind::Settings);
        assert_eq!(head.stream_id, CONNECTION_STREAM);
        let parsed = Settings::load(&wire[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn settings_rejects_bad_sizes() {
        assert_eq!(Settings::load(&[0u8; 5]).unwrap_err(), Reason::FrameSize);
        // ENABLE_PUSH must be 0 or 1
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&7u32.to_be_bytes());
        assert_eq!(Settings::load(&payload).unwrap_err(), Reason::Protocol);
    }

    #[test]
    fn priority_round_trip() {
        let priority = Priority {
            exclusive: true,
            dependency: 3,
            weight: 256,
        };
        let payload = priority.encode_payload();
        assert_eq!(Priority::load(&payload).unwrap(), priority);
    }

    #[test]
    fn goaway_carries_last_stream_and_reason() {
        let wire = encode_goaway(41, Reason::EnhanceYourCalm);
        let head = FrameHead::parse(&wire);
        assert_eq!(head.kind, FrameKind::GoAway);
        let payload = &wire[FRAME_HEADER_LEN..];
        assert_eq!(
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            41
        );
        assert_eq!(
            Reason::from_u32(u32::from_be_bytes([
                payload[4], payload[5], payload[6], payload[7]
            ])),
            Reason::EnhanceYourCalm
        );
    }
}
