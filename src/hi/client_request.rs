use crate::config::Config;
use crate::error::Error;
use crate::hi::body::{Body, BodySender};
use crate::hi::event::{EventSender, RequestEvent};
use crate::hi::response::parse_head;
use crate::lowlevel::RequestId;
use crate::s11n::ProtocolStatus;

use bytes::{Bytes, BytesMut};
use futures::channel::oneshot;
use http::Response;

use std::io;

pub(crate) type ResponseSender = oneshot::Sender<Result<Response<Body>, Error>>;

/// How a client request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndStatus {
    /// The application sent EndRequest.
    Protocol(ProtocolStatus),
    /// We aborted it.
    Aborted,
}

/// One request a client has in flight, from the point of view of its
/// connection: collects the response head, then relays the body.
pub(crate) struct ClientRequestState {
    id: RequestId,
    pub ticket: u64,
    head: BytesMut,
    max_head_len: usize,
    max_body_buffer: usize,
    /// Until the future is resolved.
    response: Option<ResponseSender>,
    /// Once the head is in.
    body: Option<BodySender>,
    aborted: bool,
    completed: bool,
    events: EventSender<RequestEvent>,
}

impl ClientRequestState {
    pub fn new(id: RequestId, ticket: u64, response: ResponseSender, events: EventSender<RequestEvent>,
               config: &Config) -> ClientRequestState
    {
        ClientRequestState {
            id,
            ticket,
            head: BytesMut::new(),
            max_head_len: config.max_response_head_len,
            max_body_buffer: config.max_body_buffer,
            response: Some(response),
            body: None,
            aborted: false,
            completed: false,
            events,
        }
    }

    fn resolve(&mut self, result: Result<Response<Body>, Error>) {
        if let Some(tx) = self.response.take() {
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        }
    }

    pub fn report(&self, error: Error) {
        warn!("request {}: {}", self.id, error);
        self.events.emit(RequestEvent::Error(error));
    }

    /// Takes one Stdout record. Fails with `BodyBufferFull` once more of the
    /// response body is waiting than the reader is allowed to leave unread;
    /// the body has then already failed and the request should be aborted.
    pub fn write_stdout(&mut self, data: Bytes) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(ref mut body) = self.body {
            if body.send(data) && body.buffered() > self.max_body_buffer {
                let error = Error::BodyBufferFull(self.max_body_buffer);
                body.fail(io::Error::new(io::ErrorKind::Other, error.to_string()));
                return Err(error);
            }
            return Ok(());
        }
        if self.response.is_none() {
            debug!("request {}: ignoring {} bytes of output", self.id, data.len());
            return Ok(());
        }

        self.head.extend_from_slice(&data);
        let parsed = match parse_head(&self.head) {
            Ok(Some(parsed)) => parsed,
            Ok(None) if self.head.len() > self.max_head_len => {
                self.fail_head(Error::InvalidResponse(
                    format!("response head exceeds {} bytes", self.max_head_len)));
                return Ok(());
            },
            Ok(None) => return Ok(()),
            Err(e) => {
                self.fail_head(e);
                return Ok(());
            },
        };

        let (head, used) = parsed;
        let rest = self.head.split_off(used).freeze();
        self.head = BytesMut::new();

        let (mut sender, body) = Body::channel();
        if !rest.is_empty() {
            sender.send(rest);
        }
        debug!("request {}: response head, status {}", self.id, head.status);
        self.events.emit(RequestEvent::Headers {
            status: head.status,
            headers: head.headers.clone(),
        });
        self.resolve(Ok(head.into_response(body)));
        self.body = Some(sender);
        Ok(())
    }

    fn fail_head(&mut self, error: Error) {
        let message = error.to_string();
        self.report(error);
        self.head = BytesMut::new();
        self.resolve(Err(Error::InvalidResponse(message)));
    }

    pub fn write_end(&mut self, status: EndStatus) {
        if let Some(ref mut body) = self.body {
            body.finish();
        }
        match status {
            EndStatus::Aborted => self.resolve(Err(Error::Aborted)),
            EndStatus::Protocol(protocol_status) => self.resolve(Err(Error::NoResponse(protocol_status))),
        }
        if self.completed {
            return;
        }
        self.completed = true;
        self.events.emit(RequestEvent::End);
        if status == EndStatus::Aborted {
            self.aborted = true;
            self.events.emit(RequestEvent::Abort);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}
