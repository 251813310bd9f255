//! Ordered, case-preserving header field storage.
//!
//! HTTP headers are kept in arrival order with their original spelling;
//! name matching is always case-insensitive. A handful of
//! connection-managed fields are refused by the mutating API because the
//! protocol generators re-synthesise them from structured state.

use crate::error::{Error, User};

/// Header names the generators own. Storing these through the public
/// API would let user code desynchronise framing from the actual wire
/// state, so `push`/`overwrite`/`append` refuse them.
const CONNECTION_FIELDS: [&str; 9] = [
    "Connection",
    "Content-Length",
    "Close",
    "Keep-Alive",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    "Via",
];

/// A single `(name, value)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> HeaderField {
        HeaderField {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Case-insensitive name comparison.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Ordered list of header fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderFieldList {
    fields: Vec<HeaderField>,
}

impl HeaderFieldList {
    pub fn new() -> HeaderFieldList {
        HeaderFieldList { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.is_named(name))
    }

    /// First value for `name`, or `""` when absent.
    pub fn get(&self, name: &str) -> &str {
        self.fields
            .iter()
            .find(|f| f.is_named(name))
            .map(|f| f.value.as_str())
            .unwrap_or("")
    }

    pub fn find(&self, name: &str) -> Option<&HeaderField> {
        self.fields.iter().find(|f| f.is_named(name))
    }

    /// Appends a field, refusing connection-managed names.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Error> {
        let name = name.into();
        Self::reject_connection_field(&name)?;
        self.fields.push(HeaderField::new(name, value));
        Ok(())
    }

    /// Replaces every occurrence of `name` with a single field, or
    /// appends if absent. Refuses connection-managed names.
    pub fn overwrite(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Error> {
        let name = name.into();
        Self::reject_connection_field(&name)?;
        let value = value.into();
        let mut first = None;
        let mut i = 0;
        while i < self.fields.len() {
            if self.fields[i].is_named(&name) {
                if first.is_none() {
                    first = Some(i);
                    i += 1;
                } else {
                    self.fields.remove(i);
                }
            } else {
                i += 1;
            }
        }
        match first {
            Some(i) => self.fields[i].value = value,
            None => self.fields.push(HeaderField::new(name, value)),
        }
        Ok(())
    }

    /// Concatenates `value` onto an existing field with `delim` between,
    /// or appends a fresh field. Refuses connection-managed names.
    pub fn append(
        &mut self,
        name: impl Into<String>,
        value: &str,
        delim: &str,
    ) -> Result<(), Error> {
        let name = name.into();
        Self::reject_connection_field(&name)?;
        match self.fields.iter_mut().find(|f| f.is_named(&name)) {
            Some(field) => {
                if !field.value.is_empty() && !delim.is_empty() {
                    field.value.push_str(delim);
                }
                field.value.push_str(value);
            }
            None => self.fields.push(HeaderField::new(name, value)),
        }
        Ok(())
    }

    /// Removes every field named `name`.
    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|f| !f.is_named(name));
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Internal insertion path for the protocol parsers: wire headers
    /// land verbatim, including connection-managed fields.
    pub(crate) fn push_unchecked(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(HeaderField::new(name, value));
    }

    pub(crate) fn is_connection_field(name: &str) -> bool {
        CONNECTION_FIELDS.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    fn reject_connection_field(name: &str) -> Result<(), Error> {
        if Self::is_connection_field(name) {
            return Err(Error::new_user(User::ConnectionHeaderField));
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a HeaderFieldList {
    type Item = &'a HeaderField;
    type IntoIter = std::slice::Iter<'a, HeaderField>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_case_insensitive() {
        let mut headers = HeaderFieldList::new();
        headers.push("Content-Type", "text/plain").unwrap();
        assert_eq!(headers.get("content-type"), "text/plain");
        assert_eq!(headers.get("CONTENT-TYPE"), "text/plain");
        assert_eq!(headers.get("X-Missing"), "");
    }

    #[test]
    fn push_preserves_order_and_case() {
        let mut headers = HeaderFieldList::new();
        headers.push("X-b", "2").unwrap();
        headers.push("X-a", "1").unwrap();
        headers.push("X-b", "3").unwrap();
        let names: Vec<&str> = headers.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["X-b", "X-a", "X-b"]);
    }

    #[test]
    fn overwrite_collapses_duplicates() {
        let mut headers = HeaderFieldList::new();
        headers.push("Accept", "a").unwrap();
        headers.push("Accept", "b").unwrap();
        headers.overwrite("accept", "c").unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("Accept"), "c");
    }

    #[test]
    fn append_concatenates_with_delimiter() {
        let mut headers = HeaderFieldList::new();
        headers.append("Vary", "Accept", ", ").unwrap();
        headers.append("Vary", "Accept-Encoding", ", ").unwrap();
        assert_eq!(headers.get("Vary"), "Accept, Accept-Encoding");
    }

    #[test]
    fn remove_drops_all_occurrences() {
        let mut headers = HeaderFieldList::new();
        headers.push("X-Trace", "1").unwrap();
        headers.push("X-Trace", "2").unwrap();
        headers.push("X-Keep", "3").unwrap();
        headers.remove("x-trace");
        assert_eq!(headers.len(), 1);
        assert!(headers.contains("X-Keep"));
    }

    #[test]
    fn connection_fields_are_refused() {
        let mut headers = HeaderFieldList::new();
        for name in &[
            "Connection",
            "content-length",
            "Transfer-Encoding",
            "keep-alive",
            "TE",
            "Trailer",
            "Upgrade",
            "Via",
            "Close",
        ] {
            assert!(headers.push(*name, "x").unwrap_err().is_user());
        }
        assert!(headers.is_empty());
    }

    #[test]
    fn parser_path_stores_connection_fields() {
        let mut headers = HeaderFieldList::new();
        headers.push_unchecked("Content-Length", "5");
        assert_eq!(headers.get("Content-Length"), "5");
    }
}
