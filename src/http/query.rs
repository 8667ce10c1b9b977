//! URL query strings and `application/x-www-form-urlencoded` bodies.

use memchr::memchr;
use std::collections::HashMap;

/// Decoded query parameters, keeping every value given for a key.
///
/// Pairs whose value is empty are dropped, as are bare keys without `=`.
///
/// # Examples
/// ```rust
/// use pixie_web::query::QueryParams;
///
/// let params = QueryParams::parse("tag=a&tag=b+c&page=2&debug&empty=");
///
/// assert_eq!(params.get("tag"), Some("a"));
/// assert_eq!(params.get_all("tag"), ["a", "b c"]);
/// assert_eq!(params.get("page"), Some("2"));
/// assert_eq!(params.get("debug"), None);
/// assert_eq!(params.get("empty"), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    values: HashMap<String, Vec<String>>,
}

impl QueryParams {
    /// Parses a query string, with or without the leading `?`.
    pub fn parse(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut values: HashMap<String, Vec<String>> = HashMap::new();

        for (key, value) in pairs(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            values
                .entry(decode(key, true))
                .or_default()
                .push(decode(value, true));
        }

        Self { values }
    }

    /// Returns the first value given for `key`.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key)?.first().map(String::as_str)
    }

    /// Returns every value given for `key`, in order.
    #[inline]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.values.get(key).map_or(&[], Vec::as_slice)
    }

    /// Iterates over keys and their values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parses an url-encoded form body into a map; the last value wins.
///
/// Keys are taken as they are sent, values are decoded with `+` as space.
pub(crate) fn parse_urlencoded(body: &[u8]) -> HashMap<String, String> {
    pairs(body)
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (String::from_utf8_lossy(key).into_owned(), decode(value, true)))
        .collect()
}

/// Splits `a=1&b=2` into byte pairs. Empty segments are skipped and a
/// segment without `=` yields an empty value.
fn pairs(src: &[u8]) -> impl Iterator<Item = (&[u8], &[u8])> {
    src.split(|&b| b == b'&')
        .filter(|part| !part.is_empty())
        .map(|part| match memchr(b'=', part) {
            Some(i) => (&part[..i], &part[i + 1..]),
            None => (part, &b""[..]),
        })
}

/// Percent-decodes `src`. Malformed escapes are kept as they are and
/// invalid UTF-8 is replaced.
pub fn decode(src: &[u8], plus_as_space: bool) -> String {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        match src[i] {
            b'+' if plus_as_space => out.push(b' '),
            b'%' => match (src.get(i + 1).and_then(hex), src.get(i + 2).and_then(hex)) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            byte => out.push(byte),
        }
        i += 1;
    }

    match String::from_utf8(out) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

#[inline]
fn hex(byte: &u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoding() {
        #[rustfmt::skip]
        let cases = [
            ("plain",         true,  "plain"),
            ("a+b",           true,  "a b"),
            ("a+b",           false, "a+b"),
            ("%2Fpath%20x",   true,  "/path x"),
            ("%e2%9c%93",     true,  "\u{2713}"),
            ("100%",          true,  "100%"),
            ("%zz",           true,  "%zz"),
            ("%4",            true,  "%4"),
        ];

        for (src, plus, expected) in cases {
            assert_eq!(decode(src.as_bytes(), plus), expected, "{src}");
        }
    }

    #[test]
    fn query_multimap() {
        let params = QueryParams::parse("?a=1&b=2&a=3&&c&d=");

        assert_eq!(params.get_all("a"), ["1", "3"]);
        assert_eq!(params.get("b"), Some("2"));
        assert_eq!(params.get("c"), None);
        assert_eq!(params.get("d"), None);
        assert_eq!(params.len(), 2);
        assert!(QueryParams::parse("").is_empty());
    }

    #[test]
    fn urlencoded_last_wins() {
        #[rustfmt::skip]
        let cases: [(&[u8], &[(&str, &str)]); 4] = [
            (b"title=Hello+World&body=a%26b", &[("title", "Hello World"), ("body", "a&b")]),
            (b"k=1&k=2",                      &[("k", "2")]),
            (b"flag&=orphan",                 &[("flag", "")]),
            (b"",                             &[]),
        ];

        for (body, expected) in cases {
            let form = parse_urlencoded(body);
            assert_eq!(form.len(), expected.len());
            for (k, v) in expected {
                assert_eq!(form.get(*k).map(String::as_str), Some(*v));
            }
        }
    }
}
