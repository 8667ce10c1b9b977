use crate::{
    errors::ErrorKind,
    http::{
        form::{self, FormData, UploadedFile},
        query::QueryParams,
        types::{self, normalize_header_name, Method, Version},
    },
    limits::ReqLimits,
};
use memchr::memmem;
use std::{collections::HashMap, io, sync::OnceLock, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::timeout,
};

const HEAD_END: &[u8] = b"\r\n\r\n";

/// A parsed HTTP request.
///
/// Built fresh for every message read from a connection. The head is parsed
/// eagerly; query parameters, cookies and the form body are parsed on first
/// access and cached for the lifetime of the request.
///
/// # Accepted input
///
/// ```text
/// [METHOD] SP [TARGET] SP "HTTP/1." ("0" | "1") CRLF
/// ([NAME] ":" [VALUE] CRLF)*
/// CRLF
/// [BODY of exactly Content-Length bytes]
/// ```
///
/// Lines must end with exactly `CRLF` and the head must be valid UTF-8.
/// Chunked transfer encoding is not supported.
///
/// # Header keys
///
/// Header names are stored normalized (see
/// [`normalize_header_name`](crate::normalize_header_name)), next to three
/// request-line keys: `REQUEST_METHOD`, `PATH_INFO` (the raw target) and
/// `SERVER_PROTOCOL`. When a header repeats, the last value wins.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    version: Version,
    target: String,
    path_end: usize,

    headers: HashMap<String, String>,
    content_length: Option<usize>,
    keep_alive: bool,

    raw: Vec<u8>,
    body_start: usize,

    query: OnceLock<QueryParams>,
    cookies: OnceLock<HashMap<String, String>>,
    form: OnceLock<FormData>,
}

impl Request {
    /// Parses a complete request (head and body) from raw bytes.
    ///
    /// Bytes after the head are taken as the body, whatever `Content-Length`
    /// says.
    ///
    /// ```
    /// use pixie_web::{Method, Request};
    ///
    /// let req = Request::parse(b"GET /items/7?full=1 HTTP/1.1\r\nHost: x\r\n\r\n".to_vec()).unwrap();
    ///
    /// assert_eq!(req.method(), Method::Get);
    /// assert_eq!(req.path(), "/items/7");
    /// assert_eq!(req.params().get("full"), Some("1"));
    /// assert_eq!(req.header("host"), Some("x"));
    /// ```
    pub fn parse(raw: Vec<u8>) -> Result<Self, ErrorKind> {
        let head_len = memmem::find(&raw, HEAD_END).ok_or(ErrorKind::InvalidRequestLine)? + 4;
        let head = Head::parse(&raw[..head_len], usize::MAX)?;

        Ok(Self::from_head(raw, head_len, head))
    }

    #[inline]
    fn from_head(raw: Vec<u8>, body_start: usize, head: Head) -> Self {
        let path_end = head.target.find('?').unwrap_or(head.target.len());

        Self {
            method: head.method,
            version: head.version,
            target: head.target,
            path_end,

            headers: head.headers,
            content_length: head.content_length,
            keep_alive: head.keep_alive,

            raw,
            body_start,

            query: OnceLock::new(),
            cookies: OnceLock::new(),
            form: OnceLock::new(),
        }
    }
}

// Accessors
impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the raw request target, query string included.
    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the target without the query string.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.target[..self.path_end]
    }

    /// Returns the query string without the leading `?`.
    #[inline]
    pub fn query_string(&self) -> Option<&str> {
        self.target.get(self.path_end + 1..)
    }

    /// Returns all headers under their normalized keys.
    #[inline(always)]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Looks a header up by its HTTP name, e.g. `"If-Modified-Since"`.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&normalize_header_name(name))
            .map(String::as_str)
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("CONTENT_TYPE").map(String::as_str)
    }

    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Whether the client asked to keep the connection open.
    #[inline(always)]
    pub const fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.raw[self.body_start..]
    }

    /// Returns the request exactly as it was read from the socket.
    #[inline(always)]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    #[inline]
    pub(crate) fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    /// Decoded query parameters.
    pub fn params(&self) -> &QueryParams {
        self.query
            .get_or_init(|| QueryParams::parse(self.query_string().unwrap_or("")))
    }

    /// Cookies sent with the request; a cookie without `=` has an empty value.
    pub fn cookies(&self) -> &HashMap<String, String> {
        self.cookies.get_or_init(|| {
            let Some(header) = self.headers.get("HTTP_COOKIE") else {
                return HashMap::new();
            };

            header
                .split(';')
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.trim(), value.trim()),
                    None => (item.trim(), ""),
                })
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect()
        })
    }

    #[inline]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().get(name).map(String::as_str)
    }

    /// Form fields and uploads from an url-encoded or multipart body.
    ///
    /// Any other content type, a missing boundary or a broken body give an
    /// empty form.
    pub fn form(&self) -> &FormData {
        self.form
            .get_or_init(|| form::parse(self.content_type(), self.body()))
    }

    #[inline]
    pub fn files(&self) -> &HashMap<String, UploadedFile> {
        &self.form().files
    }
}

// HEAD

#[derive(Debug)]
pub(crate) struct Head {
    method: Method,
    version: Version,
    target: String,
    headers: HashMap<String, String>,
    content_length: Option<usize>,
    keep_alive: bool,
}

impl Head {
    /// Parses a request head ending with `\r\n\r\n`.
    pub(crate) fn parse(head: &[u8], header_count: usize) -> Result<Self, ErrorKind> {
        let text = simdutf8::basic::from_utf8(head).map_err(|_| ErrorKind::InvalidEncoding)?;
        let text = text.strip_suffix("\r\n\r\n").ok_or(ErrorKind::InvalidHeader)?;

        let (request_line, header_block) = text.split_once("\r\n").unwrap_or((text, ""));

        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ErrorKind::InvalidRequestLine);
        };

        let method = Method::from_bytes(method.as_bytes())?;
        if !target.starts_with('/') {
            return Err(ErrorKind::InvalidRequestLine);
        }
        let version = Version::from_bytes(version.as_bytes())?;

        let mut headers = parse_header_block(header_block, header_count)?;

        let content_length = match headers.get("CONTENT_LENGTH") {
            Some(value) => Some(
                types::slice_to_usize(value.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?,
            ),
            None => None,
        };

        let keep_alive = match headers.get("HTTP_CONNECTION") {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
            _ => version.keep_alive_by_default(),
        };

        headers.insert("REQUEST_METHOD".into(), method.as_str().into());
        headers.insert("PATH_INFO".into(), target.into());
        headers.insert("SERVER_PROTOCOL".into(), version.as_str().into());

        Ok(Self {
            method,
            version,
            target: target.to_owned(),
            headers,
            content_length,
            keep_alive,
        })
    }
}

/// Parses `Name: value` lines separated by `CRLF` into normalized keys.
///
/// Also used for the small header blocks of multipart parts.
pub(crate) fn parse_header_block(
    block: &str,
    max_count: usize,
) -> Result<HashMap<String, String>, ErrorKind> {
    let mut headers = HashMap::new();

    for (count, line) in block.split("\r\n").filter(|l| !l.is_empty()).enumerate() {
        if count >= max_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        let (name, value) = line.split_once(':').ok_or(ErrorKind::InvalidHeader)?;
        if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
            return Err(ErrorKind::InvalidHeader);
        }

        headers.insert(normalize_header_name(name), value.trim().to_owned());
    }

    Ok(headers)
}

// PARSER

/// Frames requests out of a connection's byte stream.
///
/// Bytes read past the end of one request stay buffered for the next.
#[derive(Debug, Default)]
pub(crate) struct Parser {
    buffer: Vec<u8>,
    scanned: usize,
}

impl Parser {
    #[inline]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reads the next request.
    ///
    /// Returns `Ok(None)` when the peer closes or stays idle past the read
    /// timeout between requests. Never buffers more than
    /// `limits.max_request_size` bytes for one request.
    pub(crate) async fn read_request<R>(
        &mut self,
        stream: &mut R,
        limits: &ReqLimits,
        read_timeout: Duration,
    ) -> Result<Option<Request>, ErrorKind>
    where
        R: AsyncRead + Unpin,
    {
        let ceiling = limits.max_request_size;

        // AWAIT_REQUEST_LINE / READ_HEADERS
        let head_len = loop {
            if let Some(end) = self.find_head_end() {
                break end;
            }
            if self.buffer.len() >= ceiling {
                return Err(ErrorKind::RequestTooLarge);
            }

            let want = limits.read_chunk_size.min(ceiling - self.buffer.len());
            match self.fill(stream, want, read_timeout).await {
                Ok(0) if self.buffer.is_empty() => return Ok(None),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::TimedOut && self.buffer.is_empty() => {
                    return Ok(None)
                }
                Err(err) => return Err(err.into()),
            }
        };

        let head = Head::parse(&self.buffer[..head_len], limits.header_count)?;
        let total = head_len + head.content_length.unwrap_or(0);
        if total > ceiling {
            return Err(ErrorKind::RequestTooLarge);
        }

        // READ_BODY
        while self.buffer.len() < total {
            let want = (total - self.buffer.len()).min(limits.read_chunk_size);
            if self.fill(stream, want, read_timeout).await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }

        let rest = self.buffer.split_off(total);
        let raw = std::mem::replace(&mut self.buffer, rest);
        self.scanned = 0;

        Ok(Some(Request::from_head(raw, head_len, head)))
    }

    #[inline]
    fn find_head_end(&mut self) -> Option<usize> {
        let from = self.scanned.saturating_sub(HEAD_END.len() - 1);
        match memmem::find(&self.buffer[from..], HEAD_END) {
            Some(i) => Some(from + i + HEAD_END.len()),
            None => {
                self.scanned = self.buffer.len();
                None
            }
        }
    }

    #[inline]
    async fn fill<R>(&mut self, stream: &mut R, want: usize, time: Duration) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let start = self.buffer.len();
        self.buffer.resize(start + want, 0);

        let result = match timeout(time, stream.read(&mut self.buffer[start..])).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout")),
        };

        let n = *result.as_ref().unwrap_or(&0);
        self.buffer.truncate(start + n);
        result
    }

    /// Bytes received but not yet part of a request.
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
