//! The application side of FastCGI: answers requests from a web server with
//! a `Handler`.

use crate::config::Config;
use crate::error::{BoxError, Error};
use crate::hi::body::Body;
use crate::hi::event::{ConnectionEvent, Events};
use crate::hi::handler::{Handler, Reply};
use crate::hi::mux::Multiplexer;
use crate::hi::response::encode_head;
use crate::hi::server_request::ServerRequestState;
use crate::hi::transport::Transport;
use crate::lowlevel::{BeginRequest, EndRequest, Record, RecordBody, RequestId};
use crate::s11n::{ProtocolStatus, Role, FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS,
                  MANAGEMENT_REQUEST_ID};

use bytes::Bytes;
use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture, Future, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

#[cfg(unix)]
use tokio::net::UnixListener;

/// Serves FastCGI connections with one handler.
pub struct Server<H> {
    handler: Arc<H>,
    config: Config,
}

impl<H: Handler> Server<H> {
    pub fn new(handler: H) -> Server<H> {
        Server::with_config(handler, Config::default())
    }

    pub fn with_config(handler: H, config: Config) -> Server<H> {
        Server {
            handler: Arc::new(handler),
            config,
        }
    }

    /// Sets up one accepted connection. Nothing happens until its `run`
    /// future is polled.
    pub fn connection<T>(&self, io: T) -> ServerConnection<T, H>
        where T: AsyncRead + AsyncWrite
    {
        ServerConnection {
            transport: Transport::new(io),
            mux: Multiplexer::new(),
            handler: Arc::clone(&self.handler),
            tasks: FuturesUnordered::new(),
            draining: HashSet::new(),
            shutdown: CancellationToken::new(),
            config: self.config.clone(),
        }
    }

    fn spawn_connection<T>(&self, io: T, peer: String, permit: OwnedSemaphorePermit)
        where T: AsyncRead + AsyncWrite + Send + 'static
    {
        let connection = self.connection(io);
        tokio::spawn(async move {
            match connection.run().await {
                Ok(()) => info!("connection from {} closed", peer),
                Err(e) => warn!("connection from {} failed: {}", peer, e),
            }
            drop(permit);
        });
    }

    /// Accepts connections until accepting fails, serving each on its own
    /// task. At most `Config::max_connections` are served at once.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        info!("serving FastCGI on {}", listener.local_addr()?);
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let permit = acquire(&permits).await?;
            let (stream, peer) = listener.accept().await?;
            info!("connection from {}", peer);
            self.spawn_connection(stream, peer.to_string(), permit);
        }
    }

    #[cfg(unix)]
    pub async fn serve_unix(&self, listener: UnixListener) -> io::Result<()> {
        info!("serving FastCGI on {:?}", listener.local_addr()?);
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let permit = acquire(&permits).await?;
            let (stream, peer) = listener.accept().await?;
            let peer = format!("{:?}", peer);
            info!("connection from {}", peer);
            self.spawn_connection(stream, peer, permit);
        }
    }
}

async fn acquire(permits: &Arc<Semaphore>) -> io::Result<OwnedSemaphorePermit> {
    Arc::clone(permits).acquire_owned().await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// Closes a `ServerConnection` from outside its task.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.token.cancel();
    }
}

/// What a request's task produced.
enum Step {
    /// A deferred handler finished.
    Replied(Result<Response<Body>, BoxError>),
    /// The next chunk of a streaming response body, and the rest of it.
    Chunk(Option<io::Result<Bytes>>, Body),
}

type Task = BoxFuture<'static, (RequestId, Result<Step, Aborted>)>;

/// Drives one server connection.
pub struct ServerConnection<T, H> {
    transport: Transport<T>,
    mux: Multiplexer<ServerRequestState>,
    handler: Arc<H>,
    /// Handler futures and body streams, polled on this connection's task.
    tasks: FuturesUnordered<Task>,
    /// Requests that ended before the web server finished sending their input.
    draining: HashSet<RequestId>,
    shutdown: CancellationToken,
    config: Config,
}

impl<T, H> ServerConnection<T, H>
    where T: AsyncRead + AsyncWrite,
          H: Handler,
{
    /// The connection's events from now on. Only the first call returns
    /// them; nothing is recorded for a connection nobody subscribed to.
    pub fn take_events(&mut self) -> Option<Events<ConnectionEvent>> {
        self.mux.subscribe()
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle { token: self.shutdown.clone() }
    }

    /// Runs the connection until the web server hangs up or it is closed.
    pub async fn run(mut self) -> Result<(), Error> {
        let result = self.drive().await;
        if let Err(ref e) = result {
            error!("server connection failed: {}", e);
        }
        self.mux.closed();
        result
    }

    async fn drive(&mut self) -> Result<(), Error> {
        loop {
            if self.mux.closing {
                break;
            }
            self.mux.read_buf.reserve(self.config.read_buffer_size);
            let poll_tasks = !self.tasks.is_empty()
                && self.mux.out.buf.len() < self.config.write_high_water;

            tokio::select! {
                read = self.transport.reader.read_buf(&mut self.mux.read_buf) => {
                    if read? == 0 {
                        debug!("web server closed the connection");
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
                Some((id, step)) = self.tasks.next(), if poll_tasks => self.on_step(id, step),
                _ = self.shutdown.cancelled() => self.mux.close(),
            }
        }

        self.transport.flush_all(&mut self.mux.out.buf).await?;
        self.transport.shutdown().await?;
        Ok(())
    }

    #[cfg(test)]
    /// Feeds bytes received from the web server.
    pub(crate) fn on_data(&mut self, data: &[u8]) {
        self.mux.buffer(data);
        self.drain_frames();
    }

    fn drain_frames(&mut self) {
        while !self.mux.closing {
            match self.mux.next_frame() {
                Ok(Some(record)) => self.dispatch(record),
                Ok(None) => break,
                Err(e) => {
                    self.mux.report(None, e.into());
                    self.mux.close();
                },
            }
        }
    }

    fn scope(&self, id: RequestId) -> Option<RequestId> {
        if self.mux.requests.contains_key(&id) { Some(id) } else { None }
    }

    fn dispatch(&mut self, record: Record) {
        let id = record.request_id;
        if id == MANAGEMENT_REQUEST_ID {
            return self.management(record.body);
        }
        if self.draining.contains(&id) && self.drain_input(id, &record.body) {
            return;
        }

        match record.body {
            RecordBody::BeginRequest(begin) => self.begin(id, begin),
            RecordBody::Params(data) => self.write_params(id, data),
            RecordBody::Stdin(data) => self.write_stdin(id, data),
            RecordBody::AbortRequest => self.write_abort(id),
            RecordBody::Unrecognized(record_type, _) => {
                self.mux.send(MANAGEMENT_REQUEST_ID, RecordBody::UnknownType(record_type));
                self.mux.report(self.scope(id), Error::UnknownFrame(record_type));
            },
            other => self.mux.report(self.scope(id), Error::UnknownFrame(other.record_type())),
        }
    }

    /// Swallows input still arriving for a request that already ended.
    /// Returns false for records that aren't trailing input.
    fn drain_input(&mut self, id: RequestId, body: &RecordBody) -> bool {
        match *body {
            RecordBody::Params(_) => {},
            RecordBody::Stdin(ref data) if !data.is_empty() => {},
            RecordBody::Stdin(_) | RecordBody::AbortRequest => {
                self.draining.remove(&id);
            },
            _ => return false,
        }
        debug!("request {}: discarding type {} record after the end", id, body.record_type());
        true
    }

    fn management(&mut self, body: RecordBody) {
        match body {
            RecordBody::GetValues(names) => {
                let values = names.into_iter()
                    .filter_map(|name| {
                        let value = if &name[..] == FCGI_MAX_CONNS.as_bytes() {
                            self.config.max_connections.to_string()
                        } else if &name[..] == FCGI_MAX_REQS.as_bytes() {
                            self.config.max_requests.to_string()
                        } else if &name[..] == FCGI_MPXS_CONNS.as_bytes() {
                            "1".to_owned()
                        } else {
                            debug!("no value for {:?}", String::from_utf8_lossy(&name));
                            return None;
                        };
                        Some((name, Bytes::from(value)))
                    })
                    .collect();
                self.mux.send(MANAGEMENT_REQUEST_ID, RecordBody::GetValuesResult(values));
            },
            other => {
                let record_type = other.record_type();
                self.mux.send(MANAGEMENT_REQUEST_ID, RecordBody::UnknownType(record_type));
                self.mux.report(None, Error::UnknownFrame(record_type));
            },
        }
    }

    fn begin(&mut self, id: RequestId, begin: BeginRequest) {
        self.draining.remove(&id);
        if self.mux.requests.contains_key(&id) {
            self.mux.report(Some(id), Error::ReusedRequestId(id));
            return;
        }

        let status = if begin.known_role() != Some(Role::Responder) {
            info!("request {}: role {} not supported", id, begin.role);
            ProtocolStatus::UnknownRole
        } else if self.mux.requests.len() >= self.config.max_requests {
            warn!("request {}: already running {} requests", id, self.mux.requests.len());
            ProtocolStatus::Overloaded
        } else {
            debug!("request {}: begin", id);
            let state = ServerRequestState::new(id, begin.keep_connection, &self.config);
            self.mux.requests.insert(id, state);
            self.mux.emit(ConnectionEvent::Begin(id));
            return;
        };

        self.end_request(id, 0, status);
        if !begin.keep_connection {
            self.mux.close();
        }
    }

    fn write_params(&mut self, id: RequestId, data: Bytes) {
        let result = match self.mux.requests.get_mut(&id) {
            Some(request) => request.write_params(data),
            None => return self.mux.unknown_request(id),
        };
        match result {
            Ok(None) => {},
            Ok(Some(request)) => self.invoke(id, request),
            Err(Error::ParamsAlreadySet) => self.mux.report(Some(id), Error::ParamsAlreadySet),
            Err(e) => {
                self.mux.report(Some(id), e);
                self.reject(id);
            },
        }
    }

    fn write_stdin(&mut self, id: RequestId, data: Bytes) {
        let result = match self.mux.requests.get_mut(&id) {
            Some(request) => request.write_stdin(data),
            None => return self.mux.unknown_request(id),
        };
        match result {
            Ok(()) => {},
            Err(e @ Error::BodyBufferFull(_)) => self.overflow(id, e),
            Err(e) => self.mux.report(Some(id), e),
        }
    }

    /// Ends a request whose handler isn't keeping up with its input.
    fn overflow(&mut self, id: RequestId, error: Error) {
        self.mux.report(Some(id), error);
        if let Some(request) = self.mux.requests.get_mut(&id) {
            request.write_abort();
        }
        self.end_request(id, 0, ProtocolStatus::Overloaded);
        self.complete(id);
    }

    fn write_abort(&mut self, id: RequestId) {
        let mut request = match self.mux.requests.remove(&id) {
            Some(request) => request,
            None => return self.mux.unknown_request(id),
        };
        info!("request {}: aborted", id);
        self.mux.emit(ConnectionEvent::Abort(id));
        request.write_abort();
        if !request.keep_connection {
            self.mux.close();
        }
    }

    fn invoke(&mut self, id: RequestId, request: Request<Body>) {
        info!("request {}: {} {}", id, request.method(), request.uri());
        match self.handler.call(request) {
            Reply::Response(response) => self.respond(id, response),
            Reply::Deferred(future) => self.spawn_task(id, future.map(Step::Replied)),
            Reply::NoResponse => {
                debug!("request {}: no response", id);
                self.reject(id);
            },
        }
    }

    fn spawn_task<F>(&mut self, id: RequestId, future: F)
        where F: Future<Output = Step> + Send + 'static
    {
        let (handle, registration) = AbortHandle::new_pair();
        if let Some(request) = self.mux.requests.get_mut(&id) {
            request.task = Some(handle);
        }
        self.tasks.push(Abortable::new(future, registration).map(move |step| (id, step)).boxed());
    }

    fn next_chunk(&mut self, id: RequestId, body: Body) {
        self.spawn_task(id, body.into_future().map(|(chunk, rest)| Step::Chunk(chunk, rest)));
    }

    fn on_step(&mut self, id: RequestId, step: Result<Step, Aborted>) {
        let step = match step {
            Ok(step) => step,
            Err(Aborted) => {
                debug!("request {}: task cancelled", id);
                return;
            },
        };
        if !self.mux.requests.contains_key(&id) {
            debug!("request {}: gone, dropping its output", id);
            return;
        }

        match step {
            Step::Replied(Ok(response)) => self.respond(id, response),
            Step::Replied(Err(e)) => {
                self.mux.report(Some(id), Error::Rejected(e.to_string()));
                self.reject(id);
            },
            Step::Chunk(Some(Ok(data)), rest) => {
                self.mux.send_stream(id, RecordBody::Stdout, data);
                self.next_chunk(id, rest);
            },
            Step::Chunk(Some(Err(e)), _) => {
                self.mux.report(Some(id), e.into());
                self.finish(id, 1);
            },
            Step::Chunk(None, _) => self.finish(id, 0),
        }
    }

    fn respond(&mut self, id: RequestId, response: Response<Body>) {
        debug!("request {}: responding {}", id, response.status());
        self.mux.emit(ConnectionEvent::Response { id, status: response.status() });
        self.mux.send_stream(id, RecordBody::Stdout, encode_head(&response));
        match response.into_body().try_into_full() {
            Ok(data) => {
                self.mux.send_stream(id, RecordBody::Stdout, data);
                self.finish(id, 0);
            },
            Err(body) => self.next_chunk(id, body),
        }
    }

    fn end_request(&mut self, id: RequestId, app_status: u32, protocol_status: ProtocolStatus) {
        self.mux.send(id, RecordBody::EndRequest(EndRequest { app_status, protocol_status }));
    }

    /// Ends the response stream and the request.
    fn finish(&mut self, id: RequestId, app_status: u32) {
        self.mux.send(id, RecordBody::Stdout(Bytes::new()));
        self.end_request(id, app_status, ProtocolStatus::RequestComplete);
        self.complete(id);
    }

    fn reject(&mut self, id: RequestId) {
        self.end_request(id, 0, ProtocolStatus::UnknownRole);
        self.complete(id);
    }

    fn complete(&mut self, id: RequestId) {
        if let Some(request) = self.mux.requests.remove(&id) {
            debug!("request {}: end", id);
            if !request.input_finished() {
                self.draining.insert(id);
            }
            self.mux.emit(ConnectionEvent::End(id));
            if !request.keep_connection {
                self.mux.close();
            }
        }
    }
}
