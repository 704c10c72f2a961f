//! s11n == serialization. Constants and fixed-size structures that make up FastCGI records.

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{BufMut, BytesMut};

pub const FASTCGI_VERSION: u8 = 1;

/// Every record starts with a header of this many bytes.
pub const HEADER_LEN: usize = 8;
pub const BEGIN_REQUEST_BODY_LEN: usize = 8;
pub const END_REQUEST_BODY_LEN: usize = 8;

/// The most content a single record can carry.
pub const MAX_CONTENT_LEN: usize = 0xFFFF;

/// Management records (GetValues and friends) use this request id.
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

/// BeginRequest flag: the application keeps the connection open after the request.
pub const FCGI_KEEP_CONN: u8 = 1;

// Variables for the RecordType::GetValues and GetValuesResult records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RecordType {
        BeginRequest = 1,
        AbortRequest = 2,
        EndRequest = 3,
        Params = 4,
        Stdin = 5,
        Stdout = 6,
        Stderr = 7,
        Data = 8,
        GetValues = 9,
        GetValuesResult = 10,
        UnknownType = 11,
    }
}

enum_from_primitive! {
    #[repr(u16)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Role {
        Responder = 1,
        Authorizer = 2,
        Filter = 3,
    }
}

enum_from_primitive! {
    /// The `protocolStatus` of an EndRequest record.
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ProtocolStatus {
        RequestComplete = 0,
        CantMultiplexConnection = 1,
        Overloaded = 2,
        UnknownRole = 3,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> RecordHeader {
        RecordHeader {
            version: FASTCGI_VERSION,
            record_type: record_type as u8,
            request_id,
            content_length,
            padding_length: 0,
        }
    }

    /// Reads a header from the front of `bytes`, or `None` if there aren't enough of them yet.
    pub fn parse(bytes: &[u8]) -> Option<RecordHeader> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(RecordHeader {
            version: bytes[0],
            record_type: bytes[1],
            request_id: NetworkEndian::read_u16(&bytes[2..4]),
            content_length: NetworkEndian::read_u16(&bytes[4..6]),
            padding_length: bytes[6],
            // bytes[7] is reserved
        })
    }

    pub fn write(&self, out: &mut BytesMut) {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0] = self.version;
        bytes[1] = self.record_type;
        NetworkEndian::write_u16(&mut bytes[2..4], self.request_id);
        NetworkEndian::write_u16(&mut bytes[4..6], self.content_length);
        bytes[6] = self.padding_length;
        out.put_slice(&bytes);
    }

    /// Total size of the record this header introduces, header included.
    pub fn record_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn parse(bytes: &[u8]) -> Option<BeginRequestBody> {
        if bytes.len() < BEGIN_REQUEST_BODY_LEN {
            return None;
        }
        Some(BeginRequestBody {
            role: NetworkEndian::read_u16(&bytes[0..2]),
            flags: bytes[2],
        })
    }

    pub fn write(&self, out: &mut BytesMut) {
        let mut bytes = [0u8; BEGIN_REQUEST_BODY_LEN];
        NetworkEndian::write_u16(&mut bytes[0..2], self.role);
        bytes[2] = self.flags;
        out.put_slice(&bytes);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequestBody {
    pub fn parse(bytes: &[u8]) -> Option<EndRequestBody> {
        if bytes.len() < END_REQUEST_BODY_LEN {
            return None;
        }
        Some(EndRequestBody {
            app_status: NetworkEndian::read_u32(&bytes[0..4]),
            protocol_status: bytes[4],
        })
    }

    pub fn write(&self, out: &mut BytesMut) {
        let mut bytes = [0u8; END_REQUEST_BODY_LEN];
        NetworkEndian::write_u32(&mut bytes[0..4], self.app_status);
        bytes[4] = self.protocol_status;
        out.put_slice(&bytes);
    }
}
