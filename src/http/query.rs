//! Percent-encoding and query-string helpers.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use super::Headers;

/// Everything except `[0-9A-Za-z-._~]` is escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encodes `value`, leaving only unreserved characters as-is.
///
/// ```
/// assert_eq!(wicket::http::query::encode("a b&c"), "a%20b%26c");
/// ```
pub fn encode(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}

/// Decodes `%XX` escapes and `+` as a space. Invalid UTF-8 is replaced.
///
/// ```
/// assert_eq!(wicket::http::query::decode("a+b%26c"), "a b&c");
/// ```
pub fn decode(value: &str) -> String {
    let spaced = value.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Parses `name=value&...` into a case-insensitive multimap.
///
/// Values are percent-decoded, names are kept verbatim, a name without `=`
/// maps to an empty value and pairs with an empty name are skipped.
pub fn parse(query: &str) -> Headers {
    query
        .split('&')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (!name.is_empty()).then(|| (name, decode(value)))
        })
        .collect()
}

/// Builds a query string from `fields`, percent-encoding each value.
pub fn create(fields: &Headers) -> String {
    fields
        .iter()
        .map(|(name, value)| format!("{name}={}", encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}
