//! Connection state shared by both sides: decoding inbound records, queuing
//! encoded outbound ones, and the map of live requests.

use crate::error::Error;
use crate::hi::event::{self, ConnectionEvent, EventSender, Events};
use crate::lowlevel::{has_complete_frame, Record, RecordBody, RecordCodec, RequestId};
use crate::s11n::MAX_CONTENT_LEN;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use std::collections::HashMap;
use std::io;

/// Encoded records waiting to be written.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    pub buf: BytesMut,
    codec: RecordCodec,
}

impl Outbound {
    pub fn push(&mut self, id: RequestId, body: RecordBody) -> io::Result<()> {
        self.codec.encode(Record::new(id, body), &mut self.buf)
    }

    /// Queues `data` as a stream of records no bigger than one record may be.
    /// Nothing is queued for empty data; the end-of-stream marker is separate.
    pub fn stream(&mut self, id: RequestId, wrap: fn(Bytes) -> RecordBody, mut data: Bytes)
        -> io::Result<()>
    {
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_CONTENT_LEN));
            self.push(id, wrap(chunk))?;
        }
        Ok(())
    }

    pub fn append(&mut self, other: Outbound) {
        self.buf.unsplit(other.buf);
    }
}

pub(crate) struct Multiplexer<S> {
    pub read_buf: BytesMut,
    codec: RecordCodec,
    pub out: Outbound,
    pub requests: HashMap<RequestId, S>,
    /// None until someone subscribes; events before that are not kept.
    events: Option<EventSender<ConnectionEvent>>,
    subscribed: bool,
    /// Set once the connection should stop reading and wind down.
    pub closing: bool,
    closed: bool,
}

impl<S> Multiplexer<S> {
    pub fn new() -> Multiplexer<S> {
        Multiplexer {
            read_buf: BytesMut::new(),
            codec: RecordCodec,
            out: Outbound::default(),
            requests: HashMap::new(),
            events: None,
            subscribed: false,
            closing: false,
            closed: false,
        }
    }

    /// Starts delivering connection events. Only the first call subscribes.
    pub fn subscribe(&mut self) -> Option<Events<ConnectionEvent>> {
        if self.subscribed {
            return None;
        }
        self.subscribed = true;
        let (tx, events) = event::channel();
        self.events = Some(tx);
        Some(events)
    }

    #[cfg(test)]
    pub fn buffer(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
    }

    /// Decodes the next record, but only once all of it has arrived.
    pub fn next_frame(&mut self) -> io::Result<Option<Record>> {
        if !has_complete_frame(&self.read_buf) {
            return Ok(None);
        }
        self.codec.decode(&mut self.read_buf)
    }

    pub fn emit(&self, event: ConnectionEvent) {
        if let Some(ref events) = self.events {
            events.emit(event);
        }
    }

    pub fn report(&self, id: Option<RequestId>, error: Error) {
        match id {
            Some(id) => warn!("request {}: {}", id, error),
            None => warn!("{}", error),
        }
        self.emit(ConnectionEvent::Error { id, error });
    }

    pub fn unknown_request(&self, id: RequestId) {
        self.report(None, Error::UnknownRequestId(id));
    }

    /// Queues a record, reporting it against the request if it can't be encoded.
    pub fn send(&mut self, id: RequestId, body: RecordBody) {
        if let Err(e) = self.out.push(id, body) {
            self.report(Some(id), e.into());
        }
    }

    pub fn send_stream(&mut self, id: RequestId, wrap: fn(Bytes) -> RecordBody, data: Bytes) {
        if let Err(e) = self.out.stream(id, wrap, data) {
            self.report(Some(id), e.into());
        }
    }

    pub fn close(&mut self) {
        if !self.closing {
            debug!("closing connection");
            self.closing = true;
        }
    }

    /// Emits `Close`, the first time only.
    pub fn closed(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closing = true;
            self.emit(ConnectionEvent::Close);
        }
    }
}

impl<S> Drop for Multiplexer<S> {
    fn drop(&mut self) {
        self.closed();
    }
}
