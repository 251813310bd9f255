//! FastCGI: record codec, multiplexed request parsing, and the
//! connection machine for the server (responder) role.

mod conn;
mod generator;
mod parser;

pub use self::conn::{FastcgiConnection, FastcgiFactory};
pub use self::generator::Generator;
pub use self::parser::{FastcgiListener, RequestParser};

/// Protocol version in every record header.
pub const VERSION_1: u8 = 1;

/// Record header length on the wire.
pub const RECORD_HEADER_LEN: usize = 8;

/// Record types (FastCGI 1.0, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    StdIn,
    StdOut,
    StdErr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Unknown(u8),
}

impl RecordType {
    pub fn from_u8(byte: u8) -> RecordType {
        match byte {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::StdIn,
            6 => RecordType::StdOut,
            7 => RecordType::StdErr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::StdIn => 5,
            RecordType::StdOut => 6,
            RecordType::StdErr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Unknown(other) => other,
        }
    }

    /// Management records are addressed to request-id 0.
    pub fn is_management(self) -> bool {
        matches!(
            self,
            RecordType::GetValues | RecordType::GetValuesResult | RecordType::UnknownType
        )
    }
}

/// Application roles (we implement Responder only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
    Unknown(u16),
}

impl Role {
    pub fn from_u16(raw: u16) -> Role {
        match raw {
            1 => Role::Responder,
            2 => Role::Authorizer,
            3 => Role::Filter,
            other => Role::Unknown(other),
        }
    }
}

/// EndRequest protocol status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMpxConn,
    Overloaded,
    UnknownRole,
}

impl ProtocolStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolStatus::RequestComplete => 0,
            ProtocolStatus::CantMpxConn => 1,
            ProtocolStatus::Overloaded => 2,
            ProtocolStatus::UnknownRole => 3,
        }
    }
}

/// BeginRequest flag: keep the connection after EndRequest.
pub const FLAG_KEEP_CONN: u8 = 1;
