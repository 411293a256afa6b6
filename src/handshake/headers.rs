//! Header-list helpers for the opening handshake.
//!
//! `Sec-WebSocket-Protocol` and `Sec-WebSocket-Extensions` are comma lists
//! that may be split across several header lines; elements of the latter
//! carry `;`-separated parameters whose values may be quoted, so the comma
//! split has to respect quoting.

use http::header::{HeaderMap, HeaderName};

use crate::error::{ProtocolViolation, RemoteProtocolError};

/// Splits a comma-separated header value, ignoring commas inside quoted
/// strings. Elements are trimmed; empty elements are dropped by callers.
pub(crate) fn split_comma_list(value: &str) -> CommaList<'_> {
    CommaList(Some(value))
}

pub(crate) struct CommaList<'a>(Option<&'a str>);

impl<'a> Iterator for CommaList<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let value = self.0?;
        let mut in_quotes = false;

        for (idx, chr) in value.char_indices() {
            if chr == '"' {
                in_quotes = !in_quotes;
            }
            if !in_quotes && chr == ',' {
                self.0 = Some(&value[idx + 1..]);
                return Some(value[..idx].trim());
            }
        }

        self.0 = None;
        Some(value.trim())
    }
}

/// Whether any value of `name` lists `token`, ASCII case-insensitively.
///
/// `Connection: keep-alive, Upgrade` style lists make a plain equality
/// check insufficient.
pub(crate) fn header_contains_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|value| split_comma_list(value).any(|item| item.eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// All comma-separated elements across every value of `name`, in order.
pub(crate) fn header_list(headers: &HeaderMap, name: HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(split_comma_list)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// The name token of one `Sec-WebSocket-Extensions` element.
pub(crate) fn extension_name(value: &str) -> &str {
    value.split(';').next().unwrap_or("").trim()
}

/// Collects headers into name/value pairs, skipping the given names.
pub(crate) fn headers_to_pairs(
    headers: &HeaderMap,
    skip: &[HeaderName],
) -> Result<Vec<(String, String)>, RemoteProtocolError> {
    let mut pairs = Vec::new();
    for (name, value) in headers {
        if skip.iter().any(|skipped| skipped == name) {
            continue;
        }
        let value = value
            .to_str()
            .map_err(|_| RemoteProtocolError::without_hint(ProtocolViolation::MalformedHttpHeader))?;
        pairs.push((name.as_str().to_owned(), value.to_owned()));
    }
    Ok(pairs)
}
