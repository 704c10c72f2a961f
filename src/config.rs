/// Limits shared by the client and server sides of a connection.
///
/// Start from `Config::default()` and change what you need; every field has
/// a documented default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Connections a `Server` serves at once. Advertised as `FCGI_MAX_CONNS`.
    ///
    /// Default: 128.
    pub max_connections: usize,

    /// Requests one server connection runs at once. A BeginRequest beyond this
    /// is answered with `Overloaded`. Advertised as `FCGI_MAX_REQS`.
    ///
    /// Default: 64.
    pub max_requests: usize,

    /// How much the read buffer grows by before each read from the transport.
    ///
    /// Default: 8 KiB.
    pub read_buffer_size: usize,

    /// Response body streams are not polled while more than this many encoded
    /// bytes are waiting to be written to the transport.
    ///
    /// Default: 256 KiB.
    pub write_high_water: usize,

    /// Upper bound on the encoded size of one request's parameters.
    ///
    /// Default: 1 MiB.
    pub max_params_len: usize,

    /// Upper bound on the size of a response head (status line and headers)
    /// the client is willing to buffer.
    ///
    /// Default: 64 KiB.
    pub max_response_head_len: usize,

    /// How much of one request or response body may be received but not yet
    /// read. Past this the request is ended with `BodyBufferFull` rather than
    /// buffering more.
    ///
    /// Default: 1 MiB.
    pub max_body_buffer: usize,
}

impl Config {
    const DEFAULT_BUF_SIZE: usize = 8192;

    pub fn new() -> Config {
        Config {
            max_connections: 128,
            max_requests: 64,
            read_buffer_size: Self::DEFAULT_BUF_SIZE,
            write_high_water: 256 * 1024,
            max_params_len: 1024 * 1024,
            max_response_head_len: 64 * 1024,
            max_body_buffer: 1024 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
