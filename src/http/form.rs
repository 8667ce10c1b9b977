//! Form bodies: url-encoded and multipart.

use crate::http::{query, request::parse_header_block};
use memchr::memmem;
use std::collections::HashMap;

const PART_HEADER_LIMIT: usize = 16;

/// Parsed form body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormData {
    /// Text fields; for repeated names the last value wins.
    pub fields: HashMap<String, String>,
    /// Uploaded files keyed by their form field name.
    pub files: HashMap<String, UploadedFile>,
}

impl FormData {
    #[inline]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.files.is_empty()
    }
}

/// A file part of a multipart body.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

pub(crate) fn parse(content_type: Option<&str>, body: &[u8]) -> FormData {
    let Some(content_type) = content_type else {
        return FormData::default();
    };
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if mime == "application/x-www-form-urlencoded" {
        return FormData {
            fields: query::parse_urlencoded(body),
            files: HashMap::new(),
        };
    }

    if mime.starts_with("multipart/") {
        return match subvalue(content_type, "boundary") {
            Some(boundary) if !boundary.is_empty() => multipart(body, boundary),
            _ => FormData::default(),
        };
    }

    FormData::default()
}

/// Finds `key` in a `value; key=v; other="w"` header value.
pub(crate) fn subvalue<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    header.split(';').find_map(|item| {
        let (k, v) = item.split_once('=')?;
        (k.trim().eq_ignore_ascii_case(key)).then(|| v.trim().trim_matches('"'))
    })
}

fn multipart(body: &[u8], boundary: &str) -> FormData {
    let delimiter = format!("--{boundary}");
    let starts: Vec<usize> = memmem::find_iter(body, delimiter.as_bytes()).collect();
    let mut form = FormData::default();

    // Preamble before the first delimiter and epilogue after the last are ignored.
    for pair in starts.windows(2) {
        let part = &body[pair[0] + delimiter.len()..pair[1]];
        let _ = add_part(&mut form, part);
    }

    form
}

fn add_part(form: &mut FormData, part: &[u8]) -> Option<()> {
    let part = part.strip_prefix(b"\r\n").unwrap_or(part);
    let split = memmem::find(part, b"\r\n\r\n")?;

    let block = simdutf8::basic::from_utf8(&part[..split]).ok()?;
    let content = &part[split + 4..];
    let content = content.strip_suffix(b"\r\n").unwrap_or(content);

    let headers = parse_header_block(block, PART_HEADER_LIMIT).ok()?;
    let disposition = headers.get("CONTENT_DISPOSITION")?;
    let name = subvalue(disposition, "name")?.to_owned();

    match headers.get("CONTENT_TYPE") {
        Some(content_type) => {
            let file = UploadedFile {
                filename: subvalue(disposition, "filename").unwrap_or_default().to_owned(),
                content_type: content_type.clone(),
                data: content.to_vec(),
            };
            form.files.insert(name, file);
        }
        None => {
            let value = String::from_utf8_lossy(content).trim().to_owned();
            form.fields.insert(name, value);
        }
    }

    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"preamble\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\
\r\n\
  Hello page  \r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
line one\r\nline two\r\n\
--XyZ\r\n\
garbage without headers\r\n\
--XyZ--\r\n";

    #[test]
    fn multipart_fields_and_files() {
        let form = parse(Some("multipart/form-data; boundary=XyZ"), BODY);

        assert_eq!(form.field("title"), Some("Hello page"));
        assert_eq!(form.fields.len(), 1);

        let file = &form.files["upload"];
        assert_eq!(file.filename, "a.txt");
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(file.data, b"line one\r\nline two");
    }

    #[test]
    fn tolerant_inputs() {
        #[rustfmt::skip]
        let cases: [(Option<&str>, &[u8]); 5] = [
            (None,                                      b"a=1"),
            (Some("multipart/form-data"),               BODY),
            (Some("multipart/form-data; boundary="),    BODY),
            (Some("multipart/form-data; boundary=zzz"), BODY),
            (Some("application/json"),                  b"{\"a\":1}"),
        ];

        for (content_type, body) in cases {
            assert!(parse(content_type, body).is_empty(), "{content_type:?}");
        }
    }

    #[test]
    fn urlencoded_with_charset() {
        let form = parse(
            Some("application/x-www-form-urlencoded; charset=utf-8"),
            b"a=%C3%A9t%C3%A9&b=2",
        );
        assert_eq!(form.field("a"), Some("\u{e9}t\u{e9}"));
        assert_eq!(form.field("b"), Some("2"));
    }

    #[test]
    fn subvalues() {
        #[rustfmt::skip]
        let cases = [
            ("form-data; name=\"a\"; filename=\"b.png\"", "filename", Some("b.png")),
            ("form-data; name=\"a\"",                     "name",     Some("a")),
            ("multipart/mixed; BOUNDARY=q",               "boundary", Some("q")),
            ("form-data",                                 "name",     None),
        ];

        for (header, key, expected) in cases {
            assert_eq!(subvalue(header, key), expected);
        }
    }
}
