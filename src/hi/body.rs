//! Request and response bodies: finite, non-restartable streams of bytes.

use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use futures::stream::{BoxStream, Stream, StreamExt};

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// A body, either already in memory or produced a chunk at a time.
///
/// `Body` implements `Stream<Item = io::Result<Bytes>>`; the stream ends when
/// the body does. Chunk boundaries carry no meaning.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Full(Option<Bytes>),
    Channel(mpsc::UnboundedReceiver<io::Result<Bytes>>, Arc<AtomicUsize>),
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl Body {
    pub fn empty() -> Body {
        Body { kind: Kind::Full(None) }
    }

    /// Creates a body fed by the returned sender. The body ends when the
    /// sender is finished; a sender dropped before that makes the body fail
    /// with `UnexpectedEof`.
    pub fn channel() -> (BodySender, Body) {
        let (tx, rx) = mpsc::unbounded();
        let buffered = Arc::new(AtomicUsize::new(0));
        let sender = BodySender { tx, buffered: Arc::clone(&buffered), finished: false };
        (sender, Body { kind: Kind::Channel(rx, buffered) })
    }

    pub fn wrap_stream<S>(stream: S) -> Body
        where S: Stream<Item = io::Result<Bytes>> + Send + 'static
    {
        Body { kind: Kind::Stream(stream.boxed()) }
    }

    /// The length of the body, if it is already in memory.
    pub fn size(&self) -> Option<usize> {
        match self.kind {
            Kind::Full(Some(ref data)) => Some(data.len()),
            Kind::Full(None) => Some(0),
            _ => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        self.size().is_none()
    }

    /// Reads the rest of the body into memory.
    pub async fn into_bytes(mut self) -> io::Result<Bytes> {
        if let Kind::Full(ref mut data) = self.kind {
            return Ok(data.take().unwrap_or_default());
        }
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    /// Hands back the bytes of an in-memory body, or the body itself if it streams.
    pub(crate) fn try_into_full(self) -> Result<Bytes, Body> {
        match self.kind {
            Kind::Full(data) => Ok(data.unwrap_or_default()),
            kind => Err(Body { kind }),
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Kind::Full(_) => "full",
            Kind::Channel(..) => "channel",
            Kind::Stream(_) => "stream",
        };
        f.debug_struct("Body")
            .field("kind", &kind)
            .field("size", &self.size())
            .finish()
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.kind {
            Kind::Full(ref mut data) => Poll::Ready(data.take().filter(|d| !d.is_empty()).map(Ok)),
            Kind::Channel(ref mut rx, ref buffered) => {
                let chunk = rx.poll_next_unpin(cx);
                if let Poll::Ready(Some(Ok(ref data))) = chunk {
                    buffered.fetch_sub(data.len(), Ordering::Relaxed);
                }
                chunk
            },
            Kind::Stream(ref mut stream) => stream.poll_next_unpin(cx),
        }
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Body {
        Body { kind: Kind::Full(Some(data)) }
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Body {
        Body::from(Bytes::from(data))
    }
}

impl From<String> for Body {
    fn from(data: String) -> Body {
        Body::from(Bytes::from(data))
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Body {
        Body::from(Bytes::from_static(data.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(data: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(data))
    }
}

/// The writing end of `Body::channel`.
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::UnboundedSender<io::Result<Bytes>>,
    /// Bytes sent that the body's reader hasn't taken yet.
    buffered: Arc<AtomicUsize>,
    finished: bool,
}

impl BodySender {
    /// Pushes a chunk into the body. Returns false if the body has already
    /// ended or its reader is gone; the chunk is dropped in that case.
    pub fn send(&mut self, data: Bytes) -> bool {
        if self.finished {
            return false;
        }
        let len = data.len();
        if self.tx.unbounded_send(Ok(data)).is_err() {
            return false;
        }
        self.buffered.fetch_add(len, Ordering::Relaxed);
        true
    }

    /// Ends the body with an error instead of a clean end.
    pub fn fail(&mut self, error: io::Error) {
        if !self.finished {
            let _ = self.tx.unbounded_send(Err(error));
            self.finish();
        }
    }

    /// How many sent bytes are still waiting to be read.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Ends the body. Only the first call has any effect.
    pub fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.tx.close_channel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for BodySender {
    fn drop(&mut self) {
        if !self.finished {
            self.fail(io::Error::new(io::ErrorKind::UnexpectedEof, "body ended early"));
        }
    }
}
