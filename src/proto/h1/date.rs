//! Cached `Date:` header value, refreshed at most once per second.

use std::cell::RefCell;
use std::time::{Duration, SystemTime};

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

struct CachedDate {
    rendered: String,
    next_update: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> CachedDate {
        let mut cache = CachedDate {
            rendered: String::new(),
            next_update: SystemTime::UNIX_EPOCH,
        };
        cache.check(SystemTime::now());
        cache
    }

    fn check(&mut self, now: SystemTime) {
        if now >= self.next_update {
            self.rendered = httpdate::fmt_http_date(now);
            debug_assert_eq!(self.rendered.len(), DATE_VALUE_LENGTH);
            self.next_update = now + Duration::from_secs(1);
        }
    }
}

/// Appends `Date: <now>\r\n` to a head buffer.
pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check(SystemTime::now());
        dst.extend_from_slice(b"Date: ");
        dst.extend_from_slice(cache.rendered.as_bytes());
        dst.extend_from_slice(b"\r\n");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_length_matches_rfc_format() {
        let mut buf = Vec::new();
        extend(&mut buf);
        assert_eq!(buf.len(), "Date: ".len() + DATE_VALUE_LENGTH + 2);
        assert!(buf.ends_with(b"GMT\r\n"));
    }
}
