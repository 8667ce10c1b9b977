//! HTTP response values and their wire serialization.

use crate::http::types::{StatusCode, Version};
use std::fmt;

/// Response body.
///
/// Exactly one body kind is active. `Bytes` and `Empty` get a computed
/// `Content-Length`; `Chunks` are written one by one as they are produced and
/// the connection is closed afterwards.
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Chunks(Chunks),
}

/// A lazy sequence of body chunks.
pub struct Chunks(Box<dyn Iterator<Item = Vec<u8>> + Send>);

impl Chunks {
    pub fn new<I, C>(iter: I) -> Self
    where
        I: IntoIterator<Item = C>,
        I::IntoIter: Send + 'static,
        C: Into<Vec<u8>> + 'static,
    {
        Chunks(Box::new(iter.into_iter().map(Into::into)))
    }
}

impl Iterator for Chunks {
    type Item = Vec<u8>;

    #[inline]
    fn next(&mut self) -> Option<Vec<u8>> {
        self.0.next()
    }
}

impl fmt::Debug for Chunks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Chunks(..)")
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Body::Chunks(chunks) => chunks.fmt(f),
        }
    }
}

macro_rules! impl_into_body {
    ($($t:ty => |$v:ident| $conv:expr;)*) => {$(
        impl From<$t> for Body {
            #[inline]
            fn from($v: $t) -> Self {
                Body::Bytes($conv)
            }
        }

        impl From<$t> for Response {
            #[inline]
            fn from($v: $t) -> Self {
                Response::new($v)
            }
        }
    )*};
}

impl_into_body! {
    &str => |v| v.as_bytes().to_vec();
    String => |v| v.into_bytes();
    &[u8] => |v| v.to_vec();
    Vec<u8> => |v| v;
}

/// HTTP response builder.
///
/// Handlers build one and return it; the connection loop consumes it once.
///
/// # Examples
/// ```
/// use pixie_web::{Response, StatusCode};
///
/// let resp = Response::html("<h1>Saved</h1>")
///     .status(StatusCode::Created)
///     .header("X-Page", "home")
///     .cookie("session", "abc");
///
/// let wire = String::from_utf8(resp.into_bytes()).unwrap();
/// assert!(wire.starts_with("HTTP/1.1 201 Created\r\nContent-Type: text/html\r\nContent-Length: 14\r\n"));
/// assert!(wire.contains("Set-Cookie: session=abc; Path=/\r\n"));
/// assert!(wire.ends_with("\r\n\r\n<h1>Saved</h1>"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    content_type: String,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    body: Body,
    close: bool,
}

impl Response {
    /// A `200` response with a `text/html` content type.
    pub fn new<B: Into<Body>>(body: B) -> Self {
        Self {
            status: StatusCode::Ok,
            content_type: "text/html".to_owned(),
            headers: Vec::new(),
            cookies: Vec::new(),
            body: body.into(),
            close: false,
        }
    }

    #[inline]
    pub fn html<B: Into<Body>>(body: B) -> Self {
        Self::new(body)
    }

    #[inline]
    pub fn text<B: Into<Body>>(body: B) -> Self {
        Self::new(body).content_type("text/plain; charset=utf-8")
    }

    /// A `200` response with an empty body and `Content-Length: 0`.
    #[inline]
    pub fn empty() -> Self {
        Self::new(Body::Empty)
    }

    /// A response whose body is written chunk by chunk.
    pub fn chunks<I, C>(iter: I) -> Self
    where
        I: IntoIterator<Item = C>,
        I::IntoIter: Send + 'static,
        C: Into<Vec<u8>> + 'static,
    {
        Self::new(Body::Chunks(Chunks::new(iter)))
    }

    /// A `302 Found` pointing at `location`.
    pub fn redirect(location: &str) -> Self {
        Self::empty()
            .status(StatusCode::Found)
            .header("Location", location)
    }
}

// Builder
impl Response {
    #[inline]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[inline]
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    /// Adds a header line. `Content-Type` and `Content-Length` are managed by
    /// the response itself.
    #[inline]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Sets a cookie for the whole site (`Path=/`).
    #[inline]
    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Closes the connection after this response.
    #[inline]
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    #[inline]
    pub fn body<B: Into<Body>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }
}

// Accessors
impl Response {
    #[inline(always)]
    pub const fn status_code(&self) -> StatusCode {
        self.status
    }

    #[inline(always)]
    pub fn get_content_type(&self) -> &str {
        &self.content_type
    }

    #[inline(always)]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the body bytes; empty for chunked bodies.
    #[inline]
    pub fn body_bytes(&self) -> &[u8] {
        match &self.body {
            Body::Bytes(bytes) => bytes,
            Body::Empty | Body::Chunks(_) => &[],
        }
    }

    #[inline(always)]
    pub const fn is_chunked(&self) -> bool {
        matches!(self.body, Body::Chunks(_))
    }

    /// Whether the connection must close once this response is written.
    #[inline(always)]
    pub(crate) const fn forces_close(&self) -> bool {
        self.close || self.is_chunked()
    }
}

// Serialization
impl Response {
    /// Splits the response into its serialized head and the body.
    pub(crate) fn into_parts(self, version: Version, keep_alive: bool) -> (Vec<u8>, Body) {
        let keep_alive = keep_alive && !self.forces_close();
        let mut head = Vec::with_capacity(256);

        head.extend_from_slice(self.status.first_line());
        push_header(&mut head, "Content-Type", &self.content_type);

        match &self.body {
            Body::Empty => push_header(&mut head, "Content-Length", "0"),
            Body::Bytes(bytes) => push_header(&mut head, "Content-Length", &bytes.len().to_string()),
            Body::Chunks(_) => {}
        }

        for (name, value) in &self.headers {
            push_header(&mut head, name, value);
        }
        for (name, value) in &self.cookies {
            push_header(&mut head, "Set-Cookie", &format!("{name}={value}; Path=/"));
        }

        if let Some(value) = connection_header(version, keep_alive) {
            push_header(&mut head, "Connection", value);
        }
        head.extend_from_slice(b"\r\n");

        (head, self.body)
    }

    /// Serializes the whole response, draining chunked bodies.
    pub fn into_bytes(self) -> Vec<u8> {
        self.to_wire(Version::Http11, true)
    }

    pub(crate) fn to_wire(self, version: Version, keep_alive: bool) -> Vec<u8> {
        let (mut out, body) = self.into_parts(version, keep_alive);

        match body {
            Body::Empty => {}
            Body::Bytes(bytes) => out.extend_from_slice(&bytes),
            Body::Chunks(chunks) => chunks.for_each(|chunk| out.extend_from_slice(&chunk)),
        }

        out
    }
}

#[inline]
fn push_header(buffer: &mut Vec<u8>, name: &str, value: &str) {
    buffer.extend_from_slice(name.as_bytes());
    buffer.extend_from_slice(b": ");
    buffer.extend_from_slice(value.as_bytes());
    buffer.extend_from_slice(b"\r\n");
}

#[inline]
const fn connection_header(version: Version, keep_alive: bool) -> Option<&'static str> {
    match (version, keep_alive) {
        (Version::Http11, true) => None,
        (Version::Http11, false) => Some("close"),
        (Version::Http10, true) => Some("keep-alive"),
        (Version::Http10, false) => Some("close"),
    }
}

/// Builds the head of a response whose body a streaming handler writes
/// itself: status line, `Content-Type`, `Connection: close` and the blank
/// line.
///
/// ```
/// use pixie_web::{stream_head, StatusCode};
///
/// assert_eq!(
///     stream_head(StatusCode::Ok, "text/plain"),
///     b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n"
/// );
/// ```
pub fn stream_head(status: StatusCode, content_type: &str) -> Vec<u8> {
    let mut head = status.first_line().to_vec();
    push_header(&mut head, "Content-Type", content_type);
    push_header(&mut head, "Connection", "close");
    head.extend_from_slice(b"\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(resp: Response, version: Version, keep_alive: bool) -> String {
        String::from_utf8(resp.to_wire(version, keep_alive)).unwrap()
    }

    #[test]
    fn serialization() {
        #[rustfmt::skip]
        let cases = [
            (
                Response::new("hi"), Version::Http11, true,
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nhi",
            ),
            (
                Response::empty(), Version::Http11, true,
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 0\r\n\r\n",
            ),
            (
                Response::text("x").status(StatusCode::NotFound), Version::Http11, false,
                "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: 1\r\nConnection: close\r\n\r\nx",
            ),
            (
                Response::new("x"), Version::Http10, true,
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 1\r\nConnection: keep-alive\r\n\r\nx",
            ),
            (
                Response::new("x").close(), Version::Http11, true,
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 1\r\nConnection: close\r\n\r\nx",
            ),
            (
                Response::redirect("/home"), Version::Http11, true,
                "HTTP/1.1 302 Found\r\nContent-Type: text/html\r\nContent-Length: 0\r\nLocation: /home\r\n\r\n",
            ),
        ];

        for (resp, version, keep_alive, expected) in cases {
            assert_eq!(wire(resp, version, keep_alive), expected);
        }
    }

    #[test]
    fn headers_then_cookies() {
        let resp = Response::new("")
            .header("X-A", "1")
            .cookie("a", "1")
            .cookie("b", "2");

        assert_eq!(
            wire(resp, Version::Http11, true),
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 0\r\nX-A: 1\r\n\
             Set-Cookie: a=1; Path=/\r\nSet-Cookie: b=2; Path=/\r\n\r\n"
        );
    }

    #[test]
    fn chunked_body_has_no_length_and_closes() {
        let resp = Response::chunks(["a", "b", "c"]);
        assert!(resp.is_chunked());
        assert!(resp.forces_close());

        let (head, body) = resp.into_parts(Version::Http11, true);
        let head = String::from_utf8(head).unwrap();
        assert!(!head.contains("Content-Length"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));

        let Body::Chunks(chunks) = body else {
            panic!("expected chunks");
        };
        assert_eq!(chunks.collect::<Vec<_>>(), [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn conversions() {
        assert_eq!(Response::from("abc").body_bytes(), b"abc");
        assert_eq!(Response::from(String::from("abc")).body_bytes(), b"abc");
        assert_eq!(Response::from(vec![1u8, 2]).body_bytes(), [1, 2]);
        assert_eq!(Response::from(&b"z"[..]).status_code(), StatusCode::Ok);
    }
}
