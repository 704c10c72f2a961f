//! The head of a responder's output: an optional status line and a header block.

use crate::error::Error;
use crate::hi::body::Body;
use crate::hi::params::{protocol_to_version, version_to_protocol};

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode, Version};

const INITIAL_HEADERS: usize = 64;
const STATUS_HEADER: &str = "status";

/// Reason phrase of a response status line, carried as a response extension.
///
/// Servers use it instead of the status code's canonical reason when
/// present; clients attach it when the head carried a non-empty reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPhrase(String);

impl ReasonPhrase {
    pub fn new<S: Into<String>>(reason: S) -> ReasonPhrase {
        ReasonPhrase(reason.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn into_response(self, body: Body) -> Response<Body> {
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers;
        if let Some(reason) = self.reason {
            response.extensions_mut().insert(ReasonPhrase(reason));
        }
        response
    }
}

fn invalid<T: Into<String>>(msg: T) -> Error {
    Error::InvalidResponse(msg.into())
}

/// `404 Not Found` -> (404, Some("Not Found"))
fn parse_status(text: &str) -> Result<(StatusCode, Option<String>), Error> {
    let text = text.trim();
    let (code, reason) = match text.split_once(' ') {
        Some((code, reason)) => (code, reason.trim()),
        None => (text, ""),
    };
    let status = StatusCode::from_bytes(code.as_bytes())
        .map_err(|_| invalid(format!("bad status code {:?}", code)))?;
    let reason = if reason.is_empty() { None } else { Some(reason.to_owned()) };
    Ok((status, reason))
}

fn add_headers(head: &mut ResponseHead, parsed: &[httparse::Header<'_>]) -> Result<(), Error> {
    for header in parsed {
        if header.name.eq_ignore_ascii_case(STATUS_HEADER) {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| invalid("Status header is not UTF-8"))?;
            let (status, reason) = parse_status(value)?;
            head.status = status;
            head.reason = reason;
            continue;
        }
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| invalid(format!("bad header name {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| invalid(format!("bad value for header {}", name)))?;
        head.headers.append(name, value);
    }
    Ok(())
}

/// Parses a response head from the start of `buf`.
///
/// Returns `Ok(None)` until the blank line ending the head has arrived, and
/// otherwise the head plus the number of bytes it took up.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, Error> {
    let mut head = ResponseHead {
        status: StatusCode::OK,
        version: Version::HTTP_11,
        reason: None,
        headers: HeaderMap::new(),
    };

    let mut start = 0;
    if buf.starts_with(b"HTTP/") {
        let line_end = match buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let line = std::str::from_utf8(&buf[..line_end])
            .map_err(|_| invalid("status line is not UTF-8"))?;
        let (version, status) = line.split_once(' ')
            .ok_or_else(|| invalid(format!("bad status line {:?}", line)))?;
        head.version = protocol_to_version(version)
            .ok_or_else(|| invalid(format!("unknown protocol {:?}", version)))?;
        let (status, reason) = parse_status(status)?;
        head.status = status;
        head.reason = reason;
        start = line_end + 2;
    }

    // Start with room for the usual few headers and grow when that's not enough.
    let mut capacity = INITIAL_HEADERS;
    let used = loop {
        let mut slots = vec![httparse::EMPTY_HEADER; capacity];
        match httparse::parse_headers(&buf[start..], &mut slots) {
            Ok(httparse::Status::Complete((used, parsed))) => {
                add_headers(&mut head, parsed)?;
                break used;
            },
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(httparse::Error::TooManyHeaders) => capacity *= 2,
            Err(e) => return Err(invalid(e.to_string())),
        }
    };

    Ok(Some((head, start + used)))
}

/// Serializes the status line and headers of `response`, blank line included.
pub(crate) fn encode_head(response: &Response<Body>) -> Bytes {
    let status = response.status();
    let reason = response.extensions().get::<ReasonPhrase>()
        .map(ReasonPhrase::as_str)
        .or_else(|| status.canonical_reason())
        .unwrap_or("");

    let mut out = BytesMut::new();
    out.put_slice(version_to_protocol(response.version()).as_bytes());
    out.put_slice(format!(" {} {}\r\n", status.as_u16(), reason).as_bytes());
    for (name, value) in response.headers() {
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out.freeze()
}
