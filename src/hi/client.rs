//! The web-server side of FastCGI: sends requests to an application and
//! collects its responses.

use crate::config::Config;
use crate::error::Error;
use crate::hi::body::Body;
use crate::hi::client_request::{ClientRequestState, EndStatus, ResponseSender};
use crate::hi::event::{self, ConnectionEvent, EventSender, Events, RequestEvent};
use crate::hi::mux::{Multiplexer, Outbound};
use crate::hi::params::{Params, CGI_CONTENT_LENGTH, REQUEST_METHOD, REQUEST_URI};
use crate::hi::transport::Transport;
use crate::lowlevel::{BeginRequest, Record, RecordBody, RequestId};

use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use std::collections::HashSet;
use std::io;

#[cfg(unix)]
use tokio::net::UnixStream;
#[cfg(unix)]
use std::path::Path;

enum Command {
    Send(Outgoing),
    Abort { id: RequestId, ticket: u64 },
}

struct Outgoing {
    id: RequestId,
    /// Tells this request apart from others that share its id over time.
    ticket: u64,
    params: Params,
    body: Bytes,
    response: ResponseSender,
    events: EventSender<RequestEvent>,
}

/// Sends requests over one connection to a FastCGI application.
///
/// The connection itself is driven by the `ClientConnection` returned
/// alongside; nothing is sent or received until its `run` future is polled.
pub struct Client {
    next_id: RequestId,
    next_ticket: u64,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl Client {
    pub fn new<T>(io: T) -> (Client, ClientConnection<T>)
        where T: AsyncRead + AsyncWrite
    {
        Client::with_config(io, Config::default())
    }

    pub fn with_config<T>(io: T, config: Config) -> (Client, ClientConnection<T>)
        where T: AsyncRead + AsyncWrite
    {
        let (tx, rx) = mpsc::unbounded();
        let shutdown = CancellationToken::new();
        let connection = ClientConnection {
            transport: Transport::new(io),
            mux: Multiplexer::new(),
            commands: rx,
            commands_done: false,
            retired: HashSet::new(),
            shutdown: shutdown.clone(),
            config,
        };
        let client = Client {
            next_id: 1,
            next_ticket: 0,
            commands: tx,
            shutdown,
        };
        (client, connection)
    }

    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<(Client, ClientConnection<TcpStream>)> {
        let stream = TcpStream::connect(addr).await?;
        info!("connected to {}", stream.peer_addr()?);
        Ok(Client::new(stream))
    }

    #[cfg(unix)]
    pub async fn connect_unix<P: AsRef<Path>>(path: P) -> io::Result<(Client, ClientConnection<UnixStream>)> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        info!("connected to {}", path.as_ref().display());
        Ok(Client::new(stream))
    }

    /// Ids start at 1 and wrap around, skipping the management id 0.
    fn allocate_id(&mut self) -> RequestId {
        let id = self.next_id;
        self.next_id = id.checked_add(1).unwrap_or(1);
        id
    }

    /// Starts a request. A `Params` extension on `request` seeds the
    /// parameters sent with it.
    pub fn send(&mut self, request: Request<Bytes>) -> ClientRequest {
        let id = self.allocate_id();
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let mut params = Params::from_request(&request);
        let body = request.into_body();
        if !body.is_empty() && !params.contains(CGI_CONTENT_LENGTH) {
            params.insert(CGI_CONTENT_LENGTH, body.len().to_string());
        }

        let (response_tx, response_rx) = oneshot::channel();
        let (events_tx, events) = event::channel();
        let outgoing = Outgoing {
            id,
            ticket,
            params,
            body,
            response: response_tx,
            events: events_tx,
        };
        // If the connection is gone, dropping the response sender resolves
        // the request to ConnectionClosed.
        let _ = self.commands.unbounded_send(Command::Send(outgoing));

        ClientRequest {
            id,
            response: Some(response_rx),
            events,
            abort: AbortHandle {
                id,
                ticket,
                commands: self.commands.clone(),
            },
        }
    }

    /// Closes the connection once queued records are written. Requests still
    /// waiting fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// A request sent by a `Client`.
pub struct ClientRequest {
    id: RequestId,
    response: Option<oneshot::Receiver<Result<Response<Body>, Error>>>,
    events: Events<RequestEvent>,
    abort: AbortHandle,
}

impl ClientRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the response head. The body keeps streaming afterwards.
    ///
    /// Resolves exactly once; later calls fail with `ResponseTaken`.
    pub async fn response(&mut self) -> Result<Response<Body>, Error> {
        let rx = self.response.take().ok_or(Error::ResponseTaken)?;
        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    pub fn events(&mut self) -> &mut Events<RequestEvent> {
        &mut self.events
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

/// Aborts a request from anywhere. Aborting a finished request does nothing.
#[derive(Clone)]
pub struct AbortHandle {
    id: RequestId,
    ticket: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.commands.unbounded_send(Command::Abort { id: self.id, ticket: self.ticket });
    }
}

fn encode_request(out: &mut Outbound, id: RequestId, params: &Params, body: Bytes) -> io::Result<()> {
    out.push(id, RecordBody::BeginRequest(BeginRequest::responder(true)))?;
    out.stream(id, RecordBody::Params, params.encode()?)?;
    out.push(id, RecordBody::Params(Bytes::new()))?;
    out.stream(id, RecordBody::Stdin, body)?;
    out.push(id, RecordBody::Stdin(Bytes::new()))
}

/// Drives one client connection.
pub struct ClientConnection<T> {
    transport: Transport<T>,
    mux: Multiplexer<ClientRequestState>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_done: bool,
    /// Ids we aborted whose late output is still being discarded.
    retired: HashSet<RequestId>,
    shutdown: CancellationToken,
    config: Config,
}

impl<T: AsyncRead + AsyncWrite> ClientConnection<T> {
    /// The connection's events from now on. Only the first call returns
    /// them; nothing is recorded for a connection nobody subscribed to.
    pub fn take_events(&mut self) -> Option<Events<ConnectionEvent>> {
        self.mux.subscribe()
    }

    /// Runs the connection until the application closes it, `Client::close`
    /// is called, or the client and all its requests are gone.
    pub async fn run(mut self) -> Result<(), Error> {
        let result = self.drive().await;
        if let Err(ref e) = result {
            error!("client connection failed: {}", e);
        }
        self.mux.closed();
        result
    }

    async fn drive(&mut self) -> Result<(), Error> {
        loop {
            if self.mux.closing || (self.commands_done && self.mux.requests.is_empty()) {
                break;
            }
            self.mux.read_buf.reserve(self.config.read_buffer_size);

            tokio::select! {
                read = self.transport.reader.read_buf(&mut self.mux.read_buf) => {
                    if read? == 0 {
                        debug!("application closed the connection");
                        self.mux.close();
                    } else {
                        self.drain_frames();
                    }
                }
                written = self.transport.writer.write_buf(&mut self.mux.out.buf),
                        if !self.mux.out.buf.is_empty() => {
                    if written? == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                    if self.mux.out.buf.is_empty() {
                        self.transport.writer.flush().await?;
                    }
                }
                command = self.commands.next(), if !self.commands_done => match command {
                    Some(command) => self.apply(command),
                    None => self.commands_done = true,
                },
                _ = self.shutdown.cancelled() => self.mux.close(),
            }
        }

        self.transport.flush_all(&mut self.mux.out.buf).await?;
        self.transport.shutdown().await?;
        Ok(())
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Send(outgoing) => self.begin(outgoing),
            Command::Abort { id, ticket } => self.abort(id, ticket),
        }
    }

    #[cfg(test)]
    /// Feeds bytes received from the application.
    pub(crate) fn on_data(&mut self, data: &[u8]) {
        self.mux.buffer(data);
        self.drain_frames();
    }

    fn drain_frames(&mut self) {
        loop {
            match self.mux.next_frame() {
                Ok(Some(record)) => self.dispatch(record),
                Ok(None) => break,
                Err(e) => {
                    self.mux.report(None, e.into());
                    self.mux.close();
                    break;
                },
            }
        }
    }

    fn dispatch(&mut self, record: Record) {
        let id = record.request_id;
        if self.retired.contains(&id) {
            debug!("request {}: discarding type {} record after abort", id, record.body.record_type());
            if let RecordBody::EndRequest(_) = record.body {
                self.retired.remove(&id);
            }
            return;
        }

        match record.body {
            RecordBody::Stdout(data) => {
                let result = match self.mux.requests.get_mut(&id) {
                    Some(request) => request.write_stdout(data),
                    None => return self.mux.unknown_request(id),
                };
                if let Err(e) = result {
                    self.give_up(id, e);
                }
            },
            RecordBody::Stderr(data) => {
                if self.mux.requests.contains_key(&id) {
                    warn!("request {} stderr: {}", id, String::from_utf8_lossy(&data).trim_end());
                } else {
                    self.mux.unknown_request(id);
                }
            },
            RecordBody::EndRequest(end) => match self.mux.requests.remove(&id) {
                Some(mut request) => {
                    debug!("request {}: ended, app status {}, {:?}", id, end.app_status, end.protocol_status);
                    request.write_end(EndStatus::Protocol(end.protocol_status));
                },
                None => self.mux.unknown_request(id),
            },
            other => {
                let error = Error::UnknownFrame(other.record_type());
                match self.mux.requests.get(&id) {
                    Some(request) => request.report(error),
                    None => self.mux.report(None, error),
                }
            },
        }
    }

    fn begin(&mut self, outgoing: Outgoing) {
        let Outgoing { id, ticket, params, body, response, events } = outgoing;

        if self.mux.requests.contains_key(&id) {
            warn!("request {}: id still in use", id);
            events.emit(RequestEvent::Error(Error::ReusedRequestId(id)));
            let _ = response.send(Err(Error::ReusedRequestId(id)));
            return;
        }
        self.retired.remove(&id);

        let mut records = Outbound::default();
        if let Err(e) = encode_request(&mut records, id, &params, body) {
            warn!("request {}: {}", id, e);
            let _ = response.send(Err(e.into()));
            return;
        }
        self.mux.out.append(records);

        info!("request {}: {} {}", id,
              params.get(REQUEST_METHOD).unwrap_or("-"),
              params.get(REQUEST_URI).unwrap_or("-"));
        let state = ClientRequestState::new(id, ticket, response, events, &self.config);
        self.mux.requests.insert(id, state);
        self.mux.emit(ConnectionEvent::Begin(id));
    }

    /// Reports `error` on a request that can't go on, and aborts it.
    fn give_up(&mut self, id: RequestId, error: Error) {
        if let Some(request) = self.mux.requests.get(&id) {
            request.report(error);
            let ticket = request.ticket;
            self.abort(id, ticket);
        }
    }

    fn abort(&mut self, id: RequestId, ticket: u64) {
        match self.mux.requests.get(&id) {
            Some(request) if request.ticket == ticket => {},
            _ => {
                debug!("request {}: not live, nothing to abort", id);
                return;
            },
        }
        let mut request = match self.mux.requests.remove(&id) {
            Some(request) => request,
            None => return,
        };
        info!("request {}: aborting", id);
        self.mux.send(id, RecordBody::AbortRequest);
        request.write_end(EndStatus::Aborted);
        if request.is_aborted() {
            self.retired.insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowlevel::{EndRequest, RecordCodec};
    use crate::s11n::ProtocolStatus;
    use futures::FutureExt;
    use http::StatusCode;
    use tokio::io::DuplexStream;
    use tokio_util::codec::{Decoder, Encoder};

    fn setup() -> (Client, ClientConnection<DuplexStream>, Events<ConnectionEvent>) {
        let (io, _peer) = tokio::io::duplex(64);
        let (client, mut connection) = Client::new(io);
        let events = connection.take_events().unwrap();
        (client, connection, events)
    }

    fn pump(connection: &mut ClientConnection<DuplexStream>) {
        while let Some(Some(command)) = connection.commands.next().now_or_never() {
            connection.apply(command);
        }
    }

    fn sent(connection: &mut ClientConnection<DuplexStream>) -> Vec<Record> {
        let mut codec = RecordCodec;
        let mut records = vec![];
        while let Some(record) = codec.decode(&mut connection.mux.out.buf).unwrap() {
            records.push(record);
        }
        records
    }

    fn receive(connection: &mut ClientConnection<DuplexStream>, id: RequestId, body: RecordBody) {
        let mut buf = bytes::BytesMut::new();
        RecordCodec.encode(Record::new(id, body), &mut buf).unwrap();
        connection.on_data(&buf);
    }

    fn end(status: ProtocolStatus) -> RecordBody {
        RecordBody::EndRequest(EndRequest { app_status: 0, protocol_status: status })
    }

    #[test]
    fn ids_skip_zero() {
        let (mut client, _connection, _events) = setup();
        client.next_id = u16::MAX;
        assert_eq!(client.allocate_id(), u16::MAX);
        assert_eq!(client.allocate_id(), 1);
    }

    #[test]
    fn send_sequence() {
        let (mut client, mut connection, mut events) = setup();
        let request = client.send(Request::post("/upload").body(Bytes::from_static(b"hi")).unwrap());
        assert_eq!(request.id(), 1);
        pump(&mut connection);

        let records = sent(&mut connection);
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.request_id == 1));
        assert_eq!(records[0].body, RecordBody::BeginRequest(BeginRequest::responder(true)));
        match records[1].body {
            RecordBody::Params(ref data) => {
                let pairs = crate::lowlevel::read_pairs(data.clone()).unwrap();
                assert!(pairs.contains(&(Bytes::from_static(b"REQUEST_METHOD"), Bytes::from_static(b"POST"))));
                assert!(pairs.contains(&(Bytes::from_static(b"CONTENT_LENGTH"), Bytes::from_static(b"2"))));
            },
            ref other => panic!("unexpected {:?}", other),
        }
        assert_eq!(records[2].body, RecordBody::Params(Bytes::new()));
        assert_eq!(records[3].body, RecordBody::Stdin(Bytes::from_static(b"hi")));
        assert_eq!(records[4].body, RecordBody::Stdin(Bytes::new()));

        assert!(matches!(events.try_next_event(), Some(ConnectionEvent::Begin(1))));
    }

    #[test]
    fn response_then_late_record() {
        let (mut client, mut connection, mut events) = setup();
        let mut request = client.send(Request::get("/missing").body(Bytes::new()).unwrap());
        pump(&mut connection);
        let _ = sent(&mut connection);
        let _ = events.try_next_event();

        receive(&mut connection, 1,
                RecordBody::Stdout(Bytes::from_static(b"Status: 404\r\nContent-Type: text/plain\r\n\r\nnot found")));
        receive(&mut connection, 1, RecordBody::Stdout(Bytes::new()));
        receive(&mut connection, 1, end(ProtocolStatus::RequestComplete));

        let response = request.response().now_or_never().unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().into_bytes().now_or_never().unwrap().unwrap();
        assert_eq!(body, Bytes::from_static(b"not found"));
        assert!(matches!(request.events().try_next_event(), Some(RequestEvent::Headers { .. })));
        assert!(matches!(request.events().try_next_event(), Some(RequestEvent::End)));
        assert!(matches!(request.response().now_or_never(), Some(Err(Error::ResponseTaken))));

        receive(&mut connection, 1, RecordBody::Stdout(Bytes::from_static(b"late")));
        match events.try_next_event() {
            Some(ConnectionEvent::Error { id: None, error: Error::UnknownRequestId(1) }) => {},
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn abort_before_headers() {
        let (mut client, mut connection, _events) = setup();
        let mut request = client.send(Request::get("/slow").body(Bytes::new()).unwrap());
        pump(&mut connection);
        let _ = sent(&mut connection);

        request.abort();
        request.abort_handle().abort();
        pump(&mut connection);
        assert_eq!(sent(&mut connection), vec![Record::new(1, RecordBody::AbortRequest)]);
        assert!(matches!(request.response().now_or_never(), Some(Err(Error::Aborted))));
        assert!(matches!(request.events().try_next_event(), Some(RequestEvent::End)));
        assert!(matches!(request.events().try_next_event(), Some(RequestEvent::Abort)));
        assert!(request.events().try_next_event().is_none());

        // Output that was already on its way is dropped quietly.
        receive(&mut connection, 1, RecordBody::Stdout(Bytes::from_static(b"Status: 200\r\n\r\n")));
        assert!(connection.retired.contains(&1));
        receive(&mut connection, 1, end(ProtocolStatus::RequestComplete));
        assert!(!connection.retired.contains(&1));
    }

    #[test]
    fn unknown_frames_and_bad_input() {
        let (mut client, mut connection, mut events) = setup();
        let mut request = client.send(Request::get("/").body(Bytes::new()).unwrap());
        pump(&mut connection);
        let _ = events.try_next_event();

        receive(&mut connection, 1, RecordBody::Stdin(Bytes::from_static(b"?")));
        assert!(matches!(request.events().try_next_event(), Some(RequestEvent::Error(Error::UnknownFrame(5)))));

        connection.on_data(&[9, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(events.try_next_event(), Some(ConnectionEvent::Error { id: None, error: Error::Io(_) })));
        assert!(connection.mux.closing);
    }

    #[test]
    fn dropped_connection_fails_requests() {
        let (mut client, connection, _events) = setup();
        let mut request = client.send(Request::get("/").body(Bytes::new()).unwrap());
        drop(connection);
        assert!(matches!(request.response().now_or_never(), Some(Err(Error::ConnectionClosed))));
    }

    #[test]
    fn interleaved_responses() {
        let (mut client, mut connection, _events) = setup();
        let mut first = client.send(Request::get("/one").body(Bytes::new()).unwrap());
        let mut second = client.send(Request::get("/two").body(Bytes::new()).unwrap());
        pump(&mut connection);
        let _ = sent(&mut connection);

        receive(&mut connection, 2, RecordBody::Stdout(Bytes::from_static(b"Status: 201\r\n\r\ntwo-")));
        receive(&mut connection, 1, RecordBody::Stdout(Bytes::from_static(b"Status: 404\r\n\r\none-")));
        receive(&mut connection, 1, RecordBody::Stdout(Bytes::from_static(b"a")));
        receive(&mut connection, 2, RecordBody::Stdout(Bytes::from_static(b"b")));
        receive(&mut connection, 2, end(ProtocolStatus::RequestComplete));
        assert!(matches!(first.events().try_next_event(), Some(RequestEvent::Headers { .. })));
        assert!(first.events().try_next_event().is_none());
        receive(&mut connection, 1, RecordBody::Stdout(Bytes::from_static(b"c")));
        receive(&mut connection, 1, end(ProtocolStatus::RequestComplete));

        for (request, status, body) in [(&mut first, StatusCode::NOT_FOUND, "one-ac"),
                                        (&mut second, StatusCode::CREATED, "two-b")] {
            let response = request.response().now_or_never().unwrap().unwrap();
            assert_eq!(response.status(), status);
            let data = response.into_body().into_bytes().now_or_never().unwrap().unwrap();
            assert_eq!(data, Bytes::from_static(body.as_bytes()));
        }
        assert!(matches!(second.events().try_next_event(), Some(RequestEvent::Headers { .. })));
        assert!(matches!(second.events().try_next_event(), Some(RequestEvent::End)));
        assert!(second.events().try_next_event().is_none());
        assert!(matches!(first.events().try_next_event(), Some(RequestEvent::End)));
        assert!(first.events().try_next_event().is_none());
    }

    #[test]
    fn reused_id_leaves_the_live_request_alone() {
        let (mut client, mut connection, _events) = setup();
        let mut first = client.send(Request::get("/first").body(Bytes::new()).unwrap());
        client.next_id = 1;
        let mut second = client.send(Request::get("/second").body(Bytes::new()).unwrap());
        pump(&mut connection);
        assert_eq!(sent(&mut connection).len(), 5);
        assert!(matches!(second.response().now_or_never(), Some(Err(Error::ReusedRequestId(1)))));
        assert!(matches!(second.events().try_next_event(), Some(RequestEvent::Error(Error::ReusedRequestId(1)))));

        second.abort();
        pump(&mut connection);
        assert!(sent(&mut connection).is_empty());

        receive(&mut connection, 1, RecordBody::Stdout(Bytes::from_static(b"\r\nok")));
        let response = first.response().now_or_never().unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        first.abort();
        pump(&mut connection);
        assert_eq!(sent(&mut connection), vec![Record::new(1, RecordBody::AbortRequest)]);
    }

    #[test]
    fn lost_connection_truncates_the_body() {
        let (mut client, mut connection, _events) = setup();
        let mut request = client.send(Request::get("/").body(Bytes::new()).unwrap());
        pump(&mut connection);
        receive(&mut connection, 1, RecordBody::Stdout(Bytes::from_static(b"\r\nhalf")));
        let response = request.response().now_or_never().unwrap().unwrap();

        drop(connection);
        let err = response.into_body().into_bytes().now_or_never().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unread_output_aborts_the_request() {
        let (io, _peer) = tokio::io::duplex(64);
        let config = Config { max_body_buffer: 8, ..Config::default() };
        let (mut client, mut connection) = Client::with_config(io, config);
        let mut request = client.send(Request::get("/").body(Bytes::new()).unwrap());
        pump(&mut connection);
        let _ = sent(&mut connection);

        receive(&mut connection, 1, RecordBody::Stdout(Bytes::from_static(b"\r\n01234567")));
        let response = request.response().now_or_never().unwrap().unwrap();
        receive(&mut connection, 1, RecordBody::Stdout(Bytes::from_static(b"8")));

        assert_eq!(sent(&mut connection), vec![Record::new(1, RecordBody::AbortRequest)]);
        assert!(matches!(request.events().try_next_event(), Some(RequestEvent::Headers { .. })));
        assert!(matches!(request.events().try_next_event(), Some(RequestEvent::Error(Error::BodyBufferFull(8)))));
        assert!(matches!(request.events().try_next_event(), Some(RequestEvent::End)));
        assert!(matches!(request.events().try_next_event(), Some(RequestEvent::Abort)));
        assert!(response.into_body().into_bytes().now_or_never().unwrap().is_err());
        assert!(connection.retired.contains(&1));
    }
}
