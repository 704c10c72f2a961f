//! High-level, multiplexed FastCGI connections built on `http` types.

pub mod body;
pub mod client;
mod client_request;
pub mod event;
pub mod handler;
mod mux;
pub mod params;
pub mod response;
pub mod server;
mod server_request;
mod transport;
