use crate::error::BoxError;
use crate::hi::body::Body;

use futures::future::{BoxFuture, Future, FutureExt};
use http::{Request, Response};
use tokio::sync::watch;

use std::fmt;

/// Application code that answers requests arriving on a server connection.
///
/// `call` runs on the connection's task, so it should hand anything slow to
/// a `Reply::Deferred` future instead of blocking.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request<Body>) -> Reply;
}

impl<F> Handler for F
    where F: Fn(Request<Body>) -> Reply + Send + Sync + 'static
{
    fn call(&self, request: Request<Body>) -> Reply {
        self(request)
    }
}

/// What a handler did with a request.
pub enum Reply {
    /// Respond right away.
    Response(Response<Body>),
    /// Respond when the future completes. Failing rejects the request.
    Deferred(BoxFuture<'static, Result<Response<Body>, BoxError>>),
    /// Don't respond; the request is ended with `UnknownRole`.
    NoResponse,
}

impl Reply {
    pub fn deferred<F>(future: F) -> Reply
        where F: Future<Output = Result<Response<Body>, BoxError>> + Send + 'static
    {
        Reply::Deferred(future.boxed())
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Reply::Response(ref response) => f.debug_tuple("Response").field(response).finish(),
            Reply::Deferred(_) => f.write_str("Deferred"),
            Reply::NoResponse => f.write_str("NoResponse"),
        }
    }
}

impl From<Response<Body>> for Reply {
    fn from(response: Response<Body>) -> Reply {
        Reply::Response(response)
    }
}

impl From<Option<Response<Body>>> for Reply {
    fn from(response: Option<Response<Body>>) -> Reply {
        response.map_or(Reply::NoResponse, Reply::Response)
    }
}

/// Tells a handler that the web server gave up on its request.
///
/// Every server request carries one in its extensions.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits until the request is aborted. Never completes for a request that
    /// finishes normally.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

pub(crate) fn abort_pair() -> (AbortSignal, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    (AbortSignal { rx }, tx)
}
