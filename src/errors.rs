use crate::http::{response::Response, types::StatusCode};
use std::{fmt, io, time::Duration};
use thiserror::Error;

/// Failures detected while framing a request, before any route is involved.
///
/// Each kind maps to a canned response that is written before the
/// connection is closed.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    InvalidMethod,
    InvalidRequestLine,
    UnsupportedVersion,

    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,
    InvalidEncoding,

    RequestTooLarge,

    ServiceUnavailable,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:literal, $len:literal => $body:literal; )*) => {
        pub(crate) const fn as_http(&self) -> &'static [u8] {
            match self { $(
                Self::$name { .. } => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "Content-Type: text/html\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "Connection: close\r\n",
                    "\r\n",
                    $body
                ),
            )* }.as_bytes()
        }
    };
}

impl ErrorKind {
    http_errors! {
        InvalidMethod: "400 Bad Request", "28"
            => "<h1>Invalid HTTP method</h1>";
        InvalidRequestLine: "400 Bad Request", "29"
            => "<h1>Invalid request line</h1>";
        UnsupportedVersion: "505 HTTP Version Not Supported", "35"
            => "<h1>HTTP version not supported</h1>";

        InvalidHeader: "400 Bad Request", "30"
            => "<h1>Invalid header format</h1>";
        TooManyHeaders: "431 Request Header Fields Too Large", "25"
            => "<h1>Too many headers</h1>";
        InvalidContentLength: "400 Bad Request", "31"
            => "<h1>Invalid Content-Length</h1>";
        InvalidEncoding: "400 Bad Request", "34"
            => "<h1>Request head is not UTF-8</h1>";

        RequestTooLarge: "413 Payload Too Large", "26"
            => "<h1>Request too large</h1>";

        ServiceUnavailable: "503 Service Unavailable", "23"
            => "<h1>Server is busy</h1>";
        Io: "503 Service Unavailable", "18"
            => "<h1>I/O error</h1>";
    }
}

impl std::error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub struct IoError(pub io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// Error returned by a route handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Stop handling and send this response as it is.
    #[error("early response with status {}", .0.status_code())]
    Respond(Response),

    /// The requested resource does not exist; answered with `404`.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else; answered with `500`.
    #[error("{0}")]
    Fault(String),
}

impl HandlerError {
    /// Wraps any displayable error as a [`HandlerError::Fault`].
    pub fn fault<E: fmt::Display>(err: E) -> Self {
        HandlerError::Fault(err.to_string())
    }
}

impl From<io::Error> for HandlerError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => HandlerError::NotFound(err.to_string()),
            _ => HandlerError::Fault(err.to_string()),
        }
    }
}

impl From<Response> for HandlerError {
    fn from(response: Response) -> Self {
        HandlerError::Respond(response)
    }
}

/// Why a matched route produced no handler output.
#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler failed: {0}")]
    Fault(String),

    #[error("worker processes are unavailable")]
    PoolUnavailable,
}

impl DispatchError {
    /// Converts the failure into the page sent to the client.
    pub(crate) fn into_response(self, path: &str, debug: bool) -> Response {
        match self {
            DispatchError::NotFound(_) => pages::not_found(path),
            DispatchError::Timeout(after) => pages::timed_out(path, after),
            DispatchError::Fault(trace) => pages::server_error(path, &trace, debug),
            DispatchError::PoolUnavailable => pages::pool_unavailable(path),
        }
    }
}

impl HandlerError {
    /// Splits the error into an early response or a dispatch failure.
    pub(crate) fn into_dispatch(self) -> Result<Response, DispatchError> {
        match self {
            HandlerError::Respond(response) => Ok(response),
            HandlerError::NotFound(what) => Err(DispatchError::NotFound(what)),
            HandlerError::Fault(trace) => Err(DispatchError::Fault(trace)),
        }
    }
}

/// Canonical error pages.
pub(crate) mod pages {
    use super::*;

    pub(crate) fn not_found(path: &str) -> Response {
        Response::html(format!("<h1>Path or file not found: {}</h1>", escape_html(path)))
            .status(StatusCode::NotFound)
    }

    pub(crate) fn server_error(path: &str, trace: &str, debug: bool) -> Response {
        let body = match debug {
            true => format!(
                "<h1>Server error in {}</h1><p><pre>{}</pre>",
                escape_html(path),
                escape_html(trace)
            ),
            false => format!("<h1>Server error in {}</h1>", escape_html(path)),
        };

        Response::html(body).status(StatusCode::InternalServerError)
    }

    pub(crate) fn timed_out(path: &str, after: Duration) -> Response {
        Response::html(format!(
            "<h1>Server timed out after {} seconds in {}</h1>",
            after.as_secs_f64(),
            escape_html(path)
        ))
        .status(StatusCode::ServiceUnavailable)
    }

    pub(crate) fn pool_unavailable(path: &str) -> Response {
        Response::html(format!(
            "<h1>No worker processes available for {}</h1>",
            escape_html(path)
        ))
        .status(StatusCode::ServiceUnavailable)
    }

    pub(crate) fn escape_html(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '&' => out.push_str("&amp;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#x27;"),
                c => out.push(c),
            }
        }
        out
    }
}
