//! FastCGI parameters: the CGI/1.1 environment that travels in Params records.

use crate::error::Error;
use crate::hi::body::{Body, BodySender};
use crate::hi::handler::AbortSignal;
use crate::lowlevel;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, Request, Uri, Version};

use std::collections::hash_map;
use std::collections::HashMap;
use std::io;

pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
pub const REQUEST_URI: &str = "REQUEST_URI";
pub const QUERY_STRING: &str = "QUERY_STRING";
pub const SERVER_PROTOCOL: &str = "SERVER_PROTOCOL";
pub const CGI_CONTENT_TYPE: &str = "CONTENT_TYPE";
pub const CGI_CONTENT_LENGTH: &str = "CONTENT_LENGTH";

const HEADER_PREFIX: &str = "HTTP_";

/// Parameter names and values. Names are case-sensitive.
///
/// A `Params` value placed in a client request's extensions seeds the
/// parameters sent for it (`SCRIPT_FILENAME` and the like). Server requests
/// carry the full set they were built from in their extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    map: HashMap<String, String>,
}

impl Params {
    pub fn new() -> Params {
        Params::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    /// Sets a parameter, returning the value it replaces.
    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) -> Option<String> {
        self.map.insert(name.into(), value.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn set_default<F: FnOnce() -> String>(&mut self, name: &str, value: F) {
        if let hash_map::Entry::Vacant(entry) = self.map.entry(name.to_owned()) {
            entry.insert(value());
        }
    }

    /// Builds the parameters a client sends for `request`.
    pub fn from_request<B>(request: &Request<B>) -> Params {
        let mut params = request.extensions().get::<Params>().cloned().unwrap_or_default();
        let uri = request.uri();
        params.set_default(QUERY_STRING, || uri.query().unwrap_or("").to_owned());
        params.set_default(REQUEST_URI, || uri.to_string());
        params.set_default(REQUEST_METHOD, || request.method().as_str().to_owned());
        params.set_default(SERVER_PROTOCOL, || version_to_protocol(request.version()).to_owned());

        let headers = request.headers();
        if let Some(value) = headers.get(CONTENT_TYPE) {
            params.set_default(CGI_CONTENT_TYPE, || String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        if let Some(value) = headers.get(CONTENT_LENGTH) {
            params.set_default(CGI_CONTENT_LENGTH, || String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        // FastCGI has no way to repeat a parameter, so repeated headers are joined.
        for name in headers.keys() {
            let value = headers.get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ");
            params.insert(header_to_param(name.as_str()), value);
        }

        params
    }

    /// Encodes all parameters as name-value pairs, in name order.
    pub(crate) fn encode(&self) -> io::Result<Bytes> {
        let mut pairs: Vec<_> = self.map.iter().collect();
        pairs.sort();
        let mut out = BytesMut::new();
        for (name, value) in pairs {
            lowlevel::write_pair(&mut out, name.as_bytes(), value.as_bytes())?;
        }
        Ok(out.freeze())
    }

    /// Builds the server-side request these parameters describe. The returned
    /// sender feeds the request body.
    pub(crate) fn into_request(self, abort: AbortSignal) -> Result<(Request<Body>, BodySender), Error> {
        let method = match self.get(REQUEST_METHOD) {
            Some(method) => Method::from_bytes(method.as_bytes())
                .map_err(|_| Error::InvalidRequest(format!("bad {}: {:?}", REQUEST_METHOD, method)))?,
            None => Method::GET,
        };
        let uri = match self.get(REQUEST_URI) {
            Some(uri) if !uri.is_empty() => uri.parse::<Uri>()
                .map_err(|e| Error::InvalidRequest(format!("bad {} {:?}: {}", REQUEST_URI, uri, e)))?,
            _ => Uri::default(),
        };
        let version = self.get(SERVER_PROTOCOL)
            .and_then(protocol_to_version)
            .unwrap_or(Version::HTTP_11);

        let (sender, body) = Body::channel();
        let mut request = Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.version_mut() = version;

        {
            let headers = request.headers_mut();
            for (key, value) in self.iter() {
                let name = match param_to_header(key) {
                    Some(name) => name,
                    None => continue,
                };
                match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                    (Ok(name), Ok(value)) => { headers.append(name, value); },
                    _ => warn!("dropping unrepresentable header parameter {}", key),
                }
            }

            // Web servers pass these two without the HTTP_ prefix.
            for (param, header) in [(CGI_CONTENT_TYPE, CONTENT_TYPE), (CGI_CONTENT_LENGTH, CONTENT_LENGTH)] {
                if headers.contains_key(&header) {
                    continue;
                }
                if let Some(value) = self.get(param).filter(|v| !v.is_empty()) {
                    if let Ok(value) = HeaderValue::from_str(value) {
                        headers.insert(header, value);
                    }
                }
            }
        }

        request.extensions_mut().insert(abort);
        request.extensions_mut().insert(self);
        Ok((request, sender))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Params {
        let mut params = Params::new();
        params.extend(iter);
        params
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Params {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

/// `Content-Type` -> `HTTP_CONTENT_TYPE`
pub fn header_to_param(name: &str) -> String {
    let mut key = String::with_capacity(HEADER_PREFIX.len() + name.len());
    key.push_str(HEADER_PREFIX);
    key.extend(name.chars().map(|c| match c {
        '-' => '_',
        c => c.to_ascii_uppercase(),
    }));
    key
}

/// `HTTP_CONTENT_TYPE` -> `Content-Type`; `None` for parameters that aren't headers.
pub fn param_to_header(key: &str) -> Option<String> {
    let rest = key.strip_prefix(HEADER_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    let words: Vec<String> = rest.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect();
    Some(words.join("-"))
}

pub(crate) fn version_to_protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/1.1",
    }
}

/// Accepts both `HTTP/1.0` and a bare `1.0`.
pub(crate) fn protocol_to_version(protocol: &str) -> Option<Version> {
    let number = protocol.strip_prefix("HTTP/").unwrap_or(protocol);
    match number {
        "0.9" => Some(Version::HTTP_09),
        "1.0" => Some(Version::HTTP_10),
        "1.1" => Some(Version::HTTP_11),
        "2" | "2.0" => Some(Version::HTTP_2),
        "3" | "3.0" => Some(Version::HTTP_3),
        _ => None,
    }
}

/// Collects the parameter stream of one request.
///
/// Name-value pairs may be split across Params records, so bytes of an
/// incomplete pair are kept until the rest arrives.
#[derive(Debug)]
pub(crate) struct ParamAssembler {
    pending: BytesMut,
    params: Params,
    received: usize,
    limit: usize,
}

impl ParamAssembler {
    pub fn new(limit: usize) -> ParamAssembler {
        ParamAssembler {
            pending: BytesMut::new(),
            params: Params::new(),
            received: 0,
            limit,
        }
    }

    /// Merges the pairs of one Params record; later values win.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.received += chunk.len();
        if self.received > self.limit {
            return Err(Error::ParamsTooLarge(self.limit));
        }
        self.pending.extend_from_slice(chunk);
        loop {
            let (name, value, used) = match lowlevel::read_pair(&self.pending) {
                Some((name, value, used)) => (
                    String::from_utf8_lossy(name).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                    used,
                ),
                None => break,
            };
            debug!("param ({}, {})", name, value);
            self.params.insert(name, value);
            self.pending.advance(used);
        }
        Ok(())
    }

    /// Ends the parameter stream.
    pub fn finish(self) -> Result<Params, Error> {
        if !self.pending.is_empty() {
            return Err(Error::MalformedParams(
                format!("{} bytes of an incomplete name-value pair", self.pending.len())));
        }
        Ok(self.params)
    }
}
