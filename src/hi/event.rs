//! Notifications about connections and requests.
//!
//! Each connection and each client request has its own channel; events are
//! only ever seen by whoever holds the matching `Events` value.

use crate::error::Error;
use crate::lowlevel::RequestId;

use futures::channel::mpsc;
use futures::future::FutureExt;
use futures::stream::{Stream, StreamExt};
use http::{HeaderMap, StatusCode};

use std::pin::Pin;
use std::task::{Context, Poll};

/// Something that happened on a connection.
///
/// Servers emit every variant. Clients emit `Begin`, connection-scoped
/// `Error`s and `Close`; the rest of a client request's life is reported
/// through its own `RequestEvent`s.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A request started.
    Begin(RequestId),
    /// The handler produced a response for a request.
    Response { id: RequestId, status: StatusCode },
    /// A request finished and was removed from the connection.
    End(RequestId),
    /// The peer aborted a request.
    Abort(RequestId),
    /// A fault, scoped to a request if one could be identified.
    Error { id: Option<RequestId>, error: Error },
    /// The connection is gone. Sent exactly once, last.
    Close,
}

/// Something that happened to one client request.
#[derive(Debug)]
pub enum RequestEvent {
    /// The response head arrived. Sent at most once.
    Headers { status: StatusCode, headers: HeaderMap },
    /// The request completed, normally or not. Sent at most once.
    End,
    /// The request was aborted. Sent at most once, after `End`.
    Abort,
    Error(Error),
}

/// A stream of events. Events nobody reads are dropped along with this value.
pub struct Events<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Events<E> {
    /// Returns an event if one is already waiting, without blocking.
    pub fn try_next_event(&mut self) -> Option<E> {
        self.rx.next().now_or_never().flatten()
    }
}

impl<E> Stream for Events<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        self.rx.poll_next_unpin(cx)
    }
}

pub(crate) struct EventSender<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> EventSender<E> {
    pub fn emit(&self, event: E) {
        // Nobody listening is fine.
        let _ = self.tx.unbounded_send(event);
    }
}

pub(crate) fn channel<E>() -> (EventSender<E>, Events<E>) {
    let (tx, rx) = mpsc::unbounded();
    (EventSender { tx }, Events { rx })
}
