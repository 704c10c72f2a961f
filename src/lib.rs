//! FastCGI 1.0 over tokio: a record codec plus multiplexed client and server
//! connections that speak `http::Request` and `http::Response`.

#[macro_use] extern crate enum_primitive;
#[macro_use] extern crate log;

mod config;
mod error;
mod hi;
mod lowlevel;
mod s11n;

pub use config::Config;
pub use error::{BoxError, Error};
pub use hi::body::{Body, BodySender};
pub use hi::client::{AbortHandle, Client, ClientConnection, ClientRequest};
pub use hi::event::{ConnectionEvent, Events, RequestEvent};
pub use hi::handler::{AbortSignal, Handler, Reply};
pub use hi::params::{header_to_param, param_to_header, Params};
pub use hi::response::ReasonPhrase;
pub use hi::server::{CloseHandle, Server, ServerConnection};
pub use lowlevel::{has_complete_frame, read_pairs, write_pair, BeginRequest, EndRequest, Record,
                   RecordBody, RecordCodec, RequestId};
pub use s11n::{ProtocolStatus, RecordType, Role, FASTCGI_VERSION};
