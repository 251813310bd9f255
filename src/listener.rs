//! The event-callback surface shared by every protocol parser.
//!
//! HTTP/1, HTTP/2 and FastCGI all reduce their wire formats to the same
//! message lifecycle; the channel implements this trait once and stays
//! ignorant of framing.

use http::{StatusCode, Version};

use crate::error::Result;

/// The first line of a message, before any headers.
#[derive(Debug, Clone, Copy)]
pub enum StartLine<'a> {
    Request {
        method: &'a [u8],
        target: &'a [u8],
        version: Version,
    },
    Response {
        version: Version,
        status: StatusCode,
        reason: &'a [u8],
    },
}

/// Receives parse events for one message direction.
///
/// Returning an `Err` from any callback aborts the message; the parser
/// surfaces the error to its connection.
pub trait HttpListener {
    fn on_message_begin(&mut self, start: &StartLine<'_>) -> Result<()>;

    fn on_message_header(&mut self, name: &[u8], value: &[u8]) -> Result<()>;

    fn on_message_header_end(&mut self) -> Result<()>;

    fn on_message_content(&mut self, chunk: &[u8]) -> Result<()>;

    fn on_message_end(&mut self) -> Result<()>;

    /// Parse-level failure; no further callbacks follow for this message.
    fn on_error(&mut self, err: &crate::Error);
}

/// A listener that records events, used by parser tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingListener {
    pub events: Vec<String>,
    pub content: Vec<u8>,
}

#[cfg(test)]
impl HttpListener for RecordingListener {
    fn on_message_begin(&mut self, start: &StartLine<'_>) -> Result<()> {
        match start {
            StartLine::Request {
                method, target, ..
            } => self.events.push(format!(
                "begin {} {}",
                String::from_utf8_lossy(method),
                String::from_utf8_lossy(target)
            )),
            StartLine::Response { status, .. } => {
                self.events.push(format!("begin {}", status.as_u16()))
            }
        }
        Ok(())
    }

    fn on_message_header(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
        self.events.push(format!(
            "header {}: {}",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(value)
        ));
        Ok(())
    }

    fn on_message_header_end(&mut self) -> Result<()> {
        self.events.push("header-end".to_owned());
        Ok(())
    }

    fn on_message_content(&mut self, chunk: &[u8]) -> Result<()> {
        self.events
            .push(format!("content {}", String::from_utf8_lossy(chunk)));
        self.content.extend_from_slice(chunk);
        Ok(())
    }

    fn on_message_end(&mut self) -> Result<()> {
        self.events.push("end".to_owned());
        Ok(())
    }

    fn on_error(&mut self, err: &crate::Error) {
        self.events.push(format!("error {}", err));
    }
}
