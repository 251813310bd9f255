//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use http::StatusCode;

/// Result type often returned from methods that can have strand `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while serving connections.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(super) enum Kind {
    /// A message failed to parse; carries the status to surface when a
    /// response can still be generated.
    Parse(Parse),
    User(User),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// An `io::Error` occurred while reading or writing a transport.
    Io,
    /// An I/O interest did not become ready before its deadline.
    TimedOut,
    /// A second watcher was registered for a file descriptor that is
    /// already being watched.
    AlreadyWatchingOnResource,
    /// Error creating a listener socket.
    Listen,
    /// Error accepting a connection.
    Accept,
    /// A connection-level HTTP/2 protocol violation.
    Http2Connection(crate::proto::h2::Reason),
    /// A stream-level HTTP/2 protocol violation.
    #[allow(unused)]
    Http2Stream(crate::proto::h2::Reason),
    /// The peer closed the connection mid-message.
    ConnectionAborted,
    /// The shaper rejected a mutation.
    Shaper(ShaperError),
}

#[derive(Debug)]
pub(super) enum Parse {
    Method,
    Version,
    Uri,
    UriTooLong,
    Header,
    TooLarge,
    Status,
    ContentLengthInvalid,
    TransferEncodingInvalid,
    /// Both `Content-Length` and `Transfer-Encoding: chunked` were present.
    TransferEncodingConflict,
    Chunked,
    BodyTooLarge,
    /// FastCGI record violated the framing rules.
    Record,
}

#[derive(Debug)]
pub(super) enum User {
    /// Response info was mutated after the head was committed.
    ResponseAlreadyCommitted,
    /// `completed()` was invoked twice on the same channel.
    AlreadyCompleted,
    /// A body write was attempted outside the `Sending` state.
    IllegalState,
    /// More body bytes were written than the declared `Content-Length`.
    ContentLengthOverflow,
    /// A connection-managed header was passed to the public header API.
    ConnectionHeaderField,
    /// A trailer name was used without pre-registration.
    UnknownTrailer,
}

/// Mutation failures reported by [`TokenShaper`](crate::shaper::TokenShaper).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaperError {
    /// Rate limit is either too low or too high for the parent.
    RateLimitOverflow,
    /// Ceil limit is either too low or too high for the parent.
    CeilLimitOverflow,
    /// The node name already exists somewhere in the tree.
    NameConflict,
    /// The operation is not applicable to the root node.
    InvalidChildNode,
}

impl Error {
    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(super) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// Returns true if this was a parse-level (protocol) error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this was caused by an I/O failure on a transport.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if an I/O interest timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::TimedOut)
    }

    /// Returns true if a duplicate watcher registration was attempted.
    pub fn is_already_watching(&self) -> bool {
        matches!(self.inner.kind, Kind::AlreadyWatchingOnResource)
    }

    /// Returns true if a message ended before it was complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// The HTTP status a server should surface for this error, when a
    /// response can still be written.
    ///
    /// Transport errors have no meaningful status and yield `None`.
    pub fn surface_status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(Parse::UriTooLong) => Some(StatusCode::URI_TOO_LONG),
            Kind::Parse(Parse::TooLarge) => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            Kind::Parse(Parse::BodyTooLarge) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Kind::Parse(_) => Some(StatusCode::BAD_REQUEST),
            Kind::User(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            _ => None,
        }
    }

    pub(super) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(super) fn new_listen(cause: io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(super) fn new_accept(cause: io::Error) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(super) fn new_timeout() -> Error {
        Error::new(Kind::TimedOut)
    }

    pub(super) fn new_already_watching() -> Error {
        Error::new(Kind::AlreadyWatchingOnResource)
    }

    pub(super) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(super) fn new_aborted() -> Error {
        Error::new(Kind::ConnectionAborted)
    }

    pub(super) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(super) fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    pub(super) fn new_shaper(err: ShaperError) -> Error {
        Error::new(Kind::Shaper(err))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid request-target parsed",
            Kind::Parse(Parse::UriTooLong) => "request-target too long",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::ContentLengthInvalid) => "invalid content-length parsed",
            Kind::Parse(Parse::TransferEncodingInvalid) => "invalid transfer-encoding parsed",
            Kind::Parse(Parse::TransferEncodingConflict) => {
                "content-length conflicts with transfer-encoding"
            }
            Kind::Parse(Parse::Chunked) => "invalid chunked encoding",
            Kind::Parse(Parse::BodyTooLarge) => "message body larger than permitted",
            Kind::Parse(Parse::Record) => "invalid FastCGI record",
            Kind::User(User::ResponseAlreadyCommitted) => {
                "response info mutated after commit"
            }
            Kind::User(User::AlreadyCompleted) => "channel completed twice",
            Kind::User(User::IllegalState) => "operation not legal in current channel state",
            Kind::User(User::ContentLengthOverflow) => {
                "body bytes exceed declared content-length"
            }
            Kind::User(User::ConnectionHeaderField) => {
                "connection-managed header field refused"
            }
            Kind::User(User::UnknownTrailer) => "trailer name was not pre-registered",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Io => "transport error",
            Kind::TimedOut => "I/O interest timed out",
            Kind::AlreadyWatchingOnResource => {
                "file descriptor is already being watched"
            }
            Kind::Listen => "error creating listener",
            Kind::Accept => "error accepting connection",
            Kind::Http2Connection(_) => "HTTP/2 connection error",
            Kind::Http2Stream(_) => "HTTP/2 stream error",
            Kind::ConnectionAborted => "connection aborted by peer",
            Kind::Shaper(ShaperError::RateLimitOverflow) => "shaper rate limit overflow",
            Kind::Shaper(ShaperError::CeilLimitOverflow) => "shaper ceil limit overflow",
            Kind::Shaper(ShaperError::NameConflict) => "shaper node name conflict",
            Kind::Shaper(ShaperError::InvalidChildNode) => "operation invalid on root node",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("strand::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new_io(err)
    }
}
