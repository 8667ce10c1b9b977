//! Static files with conditional GET.

use crate::{errors::HandlerError, http::response::Response, StatusCode};
use chrono::{DateTime, Utc};
use std::{
    fs,
    path::{Component, Path},
    time::SystemTime,
};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Serves `name` from the `root` directory.
///
/// When `if_modified_since` parses as an HTTP date at or after the file's
/// modification time, answers `304 Not Modified` with an empty body.
/// Otherwise answers `200` with the file bytes and `Last-Modified`,
/// `Cache-Control: private, max-age={max_age}` and `Date` headers.
///
/// Names that leave `root` and missing files give
/// [`HandlerError::NotFound`].
pub fn static_file(
    name: &str,
    root: impl AsRef<Path>,
    if_modified_since: Option<&str>,
    max_age: u64,
) -> Result<Response, HandlerError> {
    let relative = Path::new(name.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(HandlerError::NotFound(name.to_owned()));
    }

    let path = root.as_ref().join(relative);
    let metadata = fs::metadata(&path)?;
    if !metadata.is_file() {
        return Err(HandlerError::NotFound(name.to_owned()));
    }

    let modified = whole_seconds(metadata.modified()?);

    if let Some(since) = if_modified_since.and_then(parse_http_date) {
        if since >= modified {
            return Ok(Response::empty()
                .status(StatusCode::NotModified)
                .content_type(content_type(name)));
        }
    }

    let data = fs::read(&path)?;

    Ok(Response::new(data)
        .content_type(content_type(name))
        .header("Last-Modified", &format_http_date(modified))
        .header("Cache-Control", &format!("private, max-age={max_age}"))
        .header("Date", &format_http_date(Utc::now())))
}

/// Formats a timestamp as an HTTP date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE).to_string()
}

/// Parses an HTTP date as sent in `If-Modified-Since`.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[inline]
fn whole_seconds(time: SystemTime) -> DateTime<Utc> {
    let time: DateTime<Utc> = time.into();
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}

/// Guesses a MIME type from the file extension.
#[rustfmt::skip]
pub fn content_type(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("html" | "htm") => "text/html",
        Some("css")          => "text/css",
        Some("js" | "mjs")   => "text/javascript",
        Some("json")         => "application/json",
        Some("txt")          => "text/plain",
        Some("md")           => "text/markdown",
        Some("csv")          => "text/csv",
        Some("xml")          => "application/xml",
        Some("png")          => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif")          => "image/gif",
        Some("svg")          => "image/svg+xml",
        Some("webp")         => "image/webp",
        Some("ico")          => "image/x-icon",
        Some("pdf")          => "application/pdf",
        Some("zip")          => "application/zip",
        Some("woff2")        => "font/woff2",
        Some("mp3")          => "audio/mpeg",
        Some("mp4")          => "video/mp4",
        _                    => "application/octet-stream",
    }
}
