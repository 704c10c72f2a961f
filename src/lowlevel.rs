use super::s11n::*;

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use enum_primitive::FromPrimitive;
use tokio_util::codec::{Decoder, Encoder};

use std::io;

/// Identifies one request among those multiplexed on a connection.
pub type RequestId = u16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub request_id: RequestId,
    pub body: RecordBody,
}

impl Record {
    pub fn new(request_id: RequestId, body: RecordBody) -> Record {
        Record { request_id, body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    BeginRequest(BeginRequest),
    AbortRequest,
    EndRequest(EndRequest),
    /// Raw name-value pair bytes. Pairs may straddle record boundaries.
    Params(Bytes),
    Stdin(Bytes),
    Stdout(Bytes),
    Stderr(Bytes),
    Data(Bytes),
    GetValues(Vec<Bytes>),
    GetValuesResult(Vec<(Bytes, Bytes)>),
    /// Reply to a record whose type the peer didn't understand.
    UnknownType(u8),
    /// An incoming record with a type this crate doesn't know.
    Unrecognized(u8, Bytes),
}

impl RecordBody {
    /// The type byte this body is sent with.
    pub fn record_type(&self) -> u8 {
        let record_type = match *self {
            RecordBody::BeginRequest(_) => RecordType::BeginRequest,
            RecordBody::AbortRequest => RecordType::AbortRequest,
            RecordBody::EndRequest(_) => RecordType::EndRequest,
            RecordBody::Params(_) => RecordType::Params,
            RecordBody::Stdin(_) => RecordType::Stdin,
            RecordBody::Stdout(_) => RecordType::Stdout,
            RecordBody::Stderr(_) => RecordType::Stderr,
            RecordBody::Data(_) => RecordType::Data,
            RecordBody::GetValues(_) => RecordType::GetValues,
            RecordBody::GetValuesResult(_) => RecordType::GetValuesResult,
            RecordBody::UnknownType(_) => RecordType::UnknownType,
            RecordBody::Unrecognized(typ, _) => return typ,
        };
        record_type as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    /// Raw role number; see `known_role`.
    pub role: u16,
    pub keep_connection: bool,
}

impl BeginRequest {
    pub fn responder(keep_connection: bool) -> BeginRequest {
        BeginRequest {
            role: Role::Responder as u16,
            keep_connection,
        }
    }

    pub fn known_role(&self) -> Option<Role> {
        Role::from_u16(self.role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

/// Returns true if `buf` starts with at least one whole record, padding included.
pub fn has_complete_frame(buf: &[u8]) -> bool {
    match RecordHeader::parse(buf) {
        Some(header) => buf.len() >= header.record_len(),
        None => false,
    }
}

fn invalid_data<T: Into<String>>(msg: T) -> io::Error {
    let msg = msg.into();
    error!("{}", msg);
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Reads one name or value length. Returns the length and how many bytes encoded it.
fn read_len(buf: &[u8]) -> Option<(usize, usize)> {
    let first_byte = *buf.first()?;
    if first_byte < 0x80 {
        Some((first_byte as usize, 1))
    } else if buf.len() < 4 {
        None
    } else {
        Some((NetworkEndian::read_u32(&buf[0..4]) as usize & !0x8000_0000, 4))
    }
}

/// Reads one name-value pair from the front of `buf`, if it's all there.
/// Returns the name, the value, and the number of bytes consumed.
pub fn read_pair(buf: &[u8]) -> Option<(&[u8], &[u8], usize)> {
    let (name_len, a) = read_len(buf)?;
    let (value_len, b) = read_len(&buf[a..])?;
    let start = a + b;
    let end = start.checked_add(name_len)?.checked_add(value_len)?;
    if buf.len() < end {
        return None;
    }
    Some((&buf[start..start + name_len], &buf[start + name_len..end], end))
}

/// Reads a block that must consist entirely of whole name-value pairs.
pub fn read_pairs(mut buf: Bytes) -> io::Result<Vec<(Bytes, Bytes)>> {
    let mut pairs = vec![];
    while !buf.is_empty() {
        let (name_len, value_len, used) = match read_pair(&buf) {
            Some((name, value, used)) => (name.len(), value.len(), used),
            None => return Err(invalid_data("truncated name-value pair")),
        };
        let mut pair = buf.split_to(used);
        pair.advance(used - name_len - value_len);
        let name = pair.split_to(name_len);
        debug!("pair ({}, {})",
               String::from_utf8_lossy(&name),
               String::from_utf8_lossy(&pair));
        pairs.push((name, pair));
    }
    Ok(pairs)
}

fn write_len(out: &mut BytesMut, len: usize) -> io::Result<()> {
    if len < 0x80 {
        out.put_u8(len as u8);
    } else if len < 0x8000_0000 {
        out.put_u32(len as u32 | 0x8000_0000);
    } else {
        let msg = format!("un-encodable name-value pair length: {:#x}", len);
        error!("{}", msg);
        return Err(io::Error::new(io::ErrorKind::InvalidInput, msg));
    }
    Ok(())
}

pub fn write_pair(out: &mut BytesMut, name: &[u8], value: &[u8]) -> io::Result<()> {
    write_len(out, name.len())?;
    write_len(out, value.len())?;
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    Ok(())
}

/// Encodes and decodes single FastCGI records, in either direction.
#[derive(Debug, Default)]
pub struct RecordCodec;

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, io::Error> {
        let header = match RecordHeader::parse(buf) {
            Some(header) => header,
            None => return Ok(None),
        };

        if header.version != FASTCGI_VERSION {
            return Err(invalid_data(format!("unexpected FCGI version {}", header.version)));
        }

        if buf.len() < header.record_len() {
            buf.reserve(header.record_len() - buf.len());
            return Ok(None);
        }

        let mut content = buf.split_to(header.record_len());
        content.advance(HEADER_LEN);
        content.truncate(header.content_length as usize);
        let content = content.freeze();

        let request_id = header.request_id;
        debug!("request id: {}; record type: {}, {} bytes of content",
               request_id, header.record_type, content.len());

        let body = match RecordType::from_u8(header.record_type) {
            Some(RecordType::BeginRequest) => {
                let raw = BeginRequestBody::parse(&content)
                    .ok_or_else(|| invalid_data("truncated BeginRequest body"))?;
                RecordBody::BeginRequest(BeginRequest {
                    role: raw.role,
                    keep_connection: (raw.flags & FCGI_KEEP_CONN) == FCGI_KEEP_CONN,
                })
            },
            Some(RecordType::AbortRequest) => RecordBody::AbortRequest,
            Some(RecordType::EndRequest) => {
                let raw = EndRequestBody::parse(&content)
                    .ok_or_else(|| invalid_data("truncated EndRequest body"))?;
                let protocol_status = ProtocolStatus::from_u8(raw.protocol_status)
                    .ok_or_else(|| invalid_data(
                        format!("unknown protocol status {}", raw.protocol_status)))?;
                RecordBody::EndRequest(EndRequest {
                    app_status: raw.app_status,
                    protocol_status,
                })
            },
            Some(RecordType::Params) => RecordBody::Params(content),
            Some(RecordType::Stdin) => RecordBody::Stdin(content),
            Some(RecordType::Stdout) => RecordBody::Stdout(content),
            Some(RecordType::Stderr) => RecordBody::Stderr(content),
            Some(RecordType::Data) => RecordBody::Data(content),
            Some(RecordType::GetValues) => {
                let names = read_pairs(content)?.into_iter().map(|(name, _value)| name).collect();
                RecordBody::GetValues(names)
            },
            Some(RecordType::GetValuesResult) => RecordBody::GetValuesResult(read_pairs(content)?),
            Some(RecordType::UnknownType) => {
                let typ = *content.first()
                    .ok_or_else(|| invalid_data("truncated UnknownType body"))?;
                RecordBody::UnknownType(typ)
            },
            None => {
                warn!("unknown record type {}", header.record_type);
                RecordBody::Unrecognized(header.record_type, content)
            },
        };

        Ok(Some(Record { request_id, body }))
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = io::Error;

    fn encode(&mut self, record: Record, buf: &mut BytesMut) -> Result<(), io::Error> {
        let record_type = record.body.record_type();
        let content: Bytes = match record.body {
            RecordBody::BeginRequest(begin) => {
                let mut out = BytesMut::with_capacity(BEGIN_REQUEST_BODY_LEN);
                BeginRequestBody {
                    role: begin.role,
                    flags: if begin.keep_connection { FCGI_KEEP_CONN } else { 0 },
                }.write(&mut out);
                out.freeze()
            },
            RecordBody::AbortRequest => Bytes::new(),
            RecordBody::EndRequest(end) => {
                let mut out = BytesMut::with_capacity(END_REQUEST_BODY_LEN);
                EndRequestBody {
                    app_status: end.app_status,
                    protocol_status: end.protocol_status as u8,
                }.write(&mut out);
                out.freeze()
            },
            RecordBody::Params(data) | RecordBody::Stdin(data) | RecordBody::Stdout(data)
                | RecordBody::Stderr(data) | RecordBody::Data(data)
                | RecordBody::Unrecognized(_, data) => data,
            RecordBody::GetValues(names) => {
                let mut out = BytesMut::new();
                for name in names {
                    write_pair(&mut out, &name, b"")?;
                }
                out.freeze()
            },
            RecordBody::GetValuesResult(values) => {
                let mut out = BytesMut::new();
                for (name, value) in values {
                    write_pair(&mut out, &name, &value)?;
                }
                out.freeze()
            },
            RecordBody::UnknownType(typ) => Bytes::copy_from_slice(&[typ, 0, 0, 0, 0, 0, 0, 0]),
        };

        if content.len() > MAX_CONTENT_LEN {
            let msg = format!("type {} record is too long: {}", record_type, content.len());
            error!("{}", msg);
            return Err(io::Error::new(io::ErrorKind::InvalidInput, msg));
        }

        buf.reserve(HEADER_LEN + content.len());
        RecordHeader {
            version: FASTCGI_VERSION,
            record_type,
            request_id: record.request_id,
            content_length: content.len() as u16,
            padding_length: 0,
        }.write(buf);
        buf.extend_from_slice(&content);

        Ok(())
    }
}
