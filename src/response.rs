//! Response info: status, headers, trailers, and transmit accounting.

use http::{StatusCode, Version};

use crate::error::{Error, User};
use crate::headers::HeaderFieldList;

/// Response state for one request/response exchange.
///
/// Header-mutating calls are only legal before [`commit`](Self::commit);
/// trailers may still change afterwards, provided their names were
/// registered up front.
#[derive(Debug)]
pub struct HttpResponse {
    status: StatusCode,
    reason: Option<String>,
    version: Version,
    content_length: Option<u64>,
    headers: HeaderFieldList,
    registered_trailers: Vec<String>,
    trailers: HeaderFieldList,
    committed: bool,
    bytes_transmitted: u64,
    actual_content_length: u64,
}

impl HttpResponse {
    /// A fresh `200 OK` response speaking `version` (copied from the
    /// request by the channel).
    pub fn new(version: Version) -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            reason: None,
            version,
            content_length: None,
            headers: HeaderFieldList::new(),
            registered_trailers: Vec::new(),
            trailers: HeaderFieldList::new(),
            committed: false,
            bytes_transmitted: 0,
            actual_content_length: 0,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), Error> {
        self.ensure_mutable()?;
        self.status = status;
        Ok(())
    }

    /// The reason phrase; defaults to the canonical one for the status.
    pub fn reason(&self) -> &str {
        match self.reason {
            Some(ref r) => r,
            None => self.status.canonical_reason().unwrap_or(""),
        }
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) -> Result<(), Error> {
        self.ensure_mutable()?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Declares the body length. `None` selects chunked (HTTP/1.1) or
    /// close-delimited framing.
    pub fn set_content_length(&mut self, len: Option<u64>) -> Result<(), Error> {
        self.ensure_mutable()?;
        self.content_length = len;
        Ok(())
    }

    pub fn headers(&self) -> &HeaderFieldList {
        &self.headers
    }

    /// Mutable header access; fails once the head is committed.
    pub fn headers_mut(&mut self) -> Result<&mut HeaderFieldList, Error> {
        self.ensure_mutable()?;
        Ok(&mut self.headers)
    }

    /// Registers a trailer name. Must happen before commit so the
    /// generator can announce it in a `Trailer` header.
    pub fn register_trailer(&mut self, name: impl Into<String>) -> Result<(), Error> {
        self.ensure_mutable()?;
        let name = name.into();
        if !self
            .registered_trailers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&name))
        {
            self.registered_trailers.push(name);
        }
        Ok(())
    }

    pub fn registered_trailers(&self) -> &[String] {
        &self.registered_trailers
    }

    /// Sets a trailer value. Legal at any time, including after body
    /// bytes have been sent, but only for pre-registered names.
    pub fn set_trailer(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Error> {
        let name = name.into();
        if !self
            .registered_trailers
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&name))
        {
            return Err(Error::new_user(User::UnknownTrailer));
        }
        self.trailers.push_unchecked(name, value.into());
        Ok(())
    }

    pub fn trailers(&self) -> &HeaderFieldList {
        &self.trailers
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub(crate) fn commit(&mut self) {
        debug_assert!(!self.committed);
        self.committed = true;
    }

    /// Whether this response's status forbids a message body.
    pub fn is_content_forbidden(&self) -> bool {
        status_forbids_body(self.status)
    }

    pub fn bytes_transmitted(&self) -> u64 {
        self.bytes_transmitted
    }

    pub(crate) fn add_bytes_transmitted(&mut self, n: u64) {
        self.bytes_transmitted += n;
    }

    pub fn actual_content_length(&self) -> u64 {
        self.actual_content_length
    }

    /// Accounts body payload bytes, enforcing the declared length.
    pub(crate) fn add_content_bytes(&mut self, n: u64) -> Result<(), Error> {
        let total = self.actual_content_length + n;
        if let Some(declared) = self.content_length {
            if total > declared {
                return Err(Error::new_user(User::ContentLengthOverflow));
            }
        }
        self.actual_content_length = total;
        Ok(())
    }

    /// Resets for reuse on the next request of a kept-alive connection.
    pub(crate) fn recycle(&mut self, version: Version) {
        self.status = StatusCode::OK;
        self.reason = None;
        self.version = version;
        self.content_length = None;
        self.headers.clear();
        self.registered_trailers.clear();
        self.trailers.clear();
        self.committed = false;
        self.bytes_transmitted = 0;
        self.actual_content_length = 0;
    }

    fn ensure_mutable(&self) -> Result<(), Error> {
        if self.committed {
            return Err(Error::new_user(User::ResponseAlreadyCommitted));
        }
        Ok(())
    }
}

/// 1xx, 204 and 304 never carry a body.
pub(crate) fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}
