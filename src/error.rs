use crate::lowlevel::RequestId;
use crate::s11n::ProtocolStatus;

use std::io;

/// Error type application handlers may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can go wrong on a FastCGI connection or one of its requests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport failed, or the peer sent bytes that don't decode as records.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record of a type that makes no sense here.
    #[error("unknown frame (record type {0})")]
    UnknownFrame(u8),

    /// A record for a request id that isn't live on this connection.
    #[error("unknown request id {0}")]
    UnknownRequestId(RequestId),

    /// BeginRequest for a request id that is still live.
    #[error("reused request id {0}")]
    ReusedRequestId(RequestId),

    #[error("parameters already set")]
    ParamsAlreadySet,

    #[error("parameters not set")]
    ParamsNotSet,

    #[error("malformed parameters: {0}")]
    MalformedParams(String),

    #[error("parameters exceed {0} bytes")]
    ParamsTooLarge(usize),

    /// More body arrived than the reader left room for.
    #[error("body buffer exceeds {0} bytes")]
    BodyBufferFull(usize),

    /// The parameters don't describe a valid HTTP request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The responder's output doesn't start with a valid response head.
    #[error("invalid response head: {0}")]
    InvalidResponse(String),

    /// The application handler failed instead of producing a response.
    #[error("handler rejected the request: {0}")]
    Rejected(String),

    #[error("request aborted")]
    Aborted,

    /// The request ended before any response head arrived.
    #[error("request ended without a response ({0:?})")]
    NoResponse(ProtocolStatus),

    #[error("response already taken")]
    ResponseTaken,

    #[error("connection closed")]
    ConnectionClosed,
}
