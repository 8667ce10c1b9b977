//! Core HTTP protocol types and utilities

use crate::errors::ErrorKind;
use std::fmt;

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

// HEADER NAMES

/// Header names stored without the `HTTP_` prefix.
pub(crate) const BARE_HEADERS: [&str; 3] = ["CONTENT_TYPE", "CONTENT_LENGTH", "CONTENT_DISPOSITION"];

/// Normalizes a header name into the key used by [`Request::headers`](crate::Request::headers).
///
/// The name is upper-cased, dashes become underscores and everything except
/// the content headers gets an `HTTP_` prefix, so no header can collide with
/// the request-line keys (`REQUEST_METHOD`, `PATH_INFO`, `SERVER_PROTOCOL`).
///
/// ```
/// use pixie_web::normalize_header_name;
///
/// assert_eq!(normalize_header_name("If-Modified-Since"), "HTTP_IF_MODIFIED_SINCE");
/// assert_eq!(normalize_header_name("content-type"), "CONTENT_TYPE");
/// ```
pub fn normalize_header_name(name: &str) -> String {
    let upper: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();

    match BARE_HEADERS.contains(&upper.as_str()) {
        true => upper,
        false => format!("HTTP_{upper}"),
    }
}

// METHOD

/// HTTP request methods
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET method
    Get,
    /// PUT method
    Put,
    /// POST method
    Post,
    /// HEAD method
    Head,
    /// PATCH method
    Patch,
    /// DELETE method
    Delete,
    /// OPTIONS method
    Options,
}

impl Method {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"GET" => Ok(Method::Get),
            b"PUT" => Ok(Method::Put),
            b"POST" => Ok(Method::Post),
            b"HEAD" => Ok(Method::Head),
            b"PATCH" => Ok(Method::Patch),
            b"DELETE" => Ok(Method::Delete),
            b"OPTIONS" => Ok(Method::Options),
            _ => Err(ErrorKind::InvalidMethod),
        }
    }

    /// Returns the method token as sent on the wire.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = ErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::from_bytes(s.as_bytes())
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0, connection closes unless `Connection: keep-alive` is sent
    Http10,
    /// HTTP/1.1, connection persists unless `Connection: close` is sent
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            _ => Err(ErrorKind::UnsupportedVersion),
        }
    }

    /// Returns the protocol token, e.g. `HTTP/1.1`.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    #[inline]
    pub(crate) const fn keep_alive_by_default(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $name:ident = ($num:literal, $str:literal);
    )+) => {
        /// HTTP status codes used by handlers and error pages
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $name = $num,
        )+ }

        impl StatusCode {
            /// Returns the status line, e.g. `b"HTTP/1.1 200 OK\r\n"`.
            #[inline]
            pub const fn first_line(&self) -> &'static [u8] {
                match self { $(
                    StatusCode::$name => concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes(),
                )+ }
            }

            /// Returns the numeric code.
            #[inline]
            pub const fn as_u16(&self) -> u16 {
                *self as u16
            }

            /// Returns the reason phrase.
            #[inline]
            pub const fn reason(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }

            /// Looks a status up by its numeric code.
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code { $(
                    $num => Some(StatusCode::$name),
                )+
                    _ => None,
                }
            }
        }
    }
}

set_status_codes! {
    Ok = (200, "OK");
    Created = (201, "Created");
    Accepted = (202, "Accepted");
    NoContent = (204, "No Content");

    MovedPermanently = (301, "Moved Permanently");
    Found = (302, "Found");
    SeeOther = (303, "See Other");
    NotModified = (304, "Not Modified");
    TemporaryRedirect = (307, "Temporary Redirect");
    PermanentRedirect = (308, "Permanent Redirect");

    BadRequest = (400, "Bad Request");
    Unauthorized = (401, "Unauthorized");
    Forbidden = (403, "Forbidden");
    NotFound = (404, "Not Found");
    MethodNotAllowed = (405, "Method Not Allowed");
    RequestTimeout = (408, "Request Timeout");
    Conflict = (409, "Conflict");
    PayloadTooLarge = (413, "Payload Too Large");
    UnsupportedMediaType = (415, "Unsupported Media Type");
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");
    UnavailableForLegalReasons = (451, "Unavailable For Legal Reasons");

    InternalServerError = (500, "Internal Server Error");
    NotImplemented = (501, "Not Implemented");
    ServiceUnavailable = (503, "Service Unavailable");
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names() {
        #[rustfmt::skip]
        let cases = [
            ("Content-Type",        "CONTENT_TYPE"),
            ("content-length",      "CONTENT_LENGTH"),
            ("Content-Disposition", "CONTENT_DISPOSITION"),
            ("Host",                "HTTP_HOST"),
            ("If-Modified-Since",   "HTTP_IF_MODIFIED_SINCE"),
            ("x-request-id",        "HTTP_X_REQUEST_ID"),
            (" Cookie ",            "HTTP_COOKIE"),
        ];

        for (name, expected) in cases {
            assert_eq!(normalize_header_name(name), expected, "{name}");
        }
    }

    #[test]
    fn methods() {
        #[rustfmt::skip]
        let cases: [(&[u8], Option<Method>); 6] = [
            (b"GET",     Some(Method::Get)),
            (b"POST",    Some(Method::Post)),
            (b"OPTIONS", Some(Method::Options)),
            (b"get",     None),
            (b"TRACE",   None),
            (b"",        None),
        ];

        for (src, expected) in cases {
            assert_eq!(Method::from_bytes(src).ok(), expected);
        }
        assert_eq!("DELETE".parse::<Method>(), Ok(Method::Delete));
    }

    #[test]
    fn numbers() {
        #[rustfmt::skip]
        let cases: [(&[u8], Option<usize>); 5] = [
            (b"0",    Some(0)),
            (b"1234", Some(1234)),
            (b"",     None),
            (b"12a",  None),
            (b"-1",   None),
        ];

        for (src, expected) in cases {
            assert_eq!(slice_to_usize(src), expected);
        }
        assert_eq!(slice_to_usize(b"99999999999999999999999999"), None);
    }

    #[test]
    fn status_lines() {
        assert_eq!(StatusCode::Ok.first_line(), b"HTTP/1.1 200 OK\r\n");
        assert_eq!(StatusCode::NotModified.first_line(), b"HTTP/1.1 304 Not Modified\r\n");
        assert_eq!(StatusCode::from_u16(451), Some(StatusCode::UnavailableForLegalReasons));
        assert_eq!(StatusCode::from_u16(999), None);
        assert_eq!(StatusCode::ServiceUnavailable.to_string(), "503 Service Unavailable");
    }
}
