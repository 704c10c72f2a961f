use crate::config::Config;
use crate::error::Error;
use crate::hi::body::{Body, BodySender};
use crate::hi::handler::abort_pair;
use crate::hi::params::ParamAssembler;
use crate::lowlevel::RequestId;

use bytes::Bytes;
use futures::future::AbortHandle;
use http::Request;
use tokio::sync::watch;

use std::io;

/// One request a server connection is working on.
///
/// Parameters come first; once the empty Params record arrives the request
/// is built and from then on Stdin feeds its body.
pub(crate) struct ServerRequestState {
    id: RequestId,
    pub keep_connection: bool,
    params: Option<ParamAssembler>,
    body: Option<BodySender>,
    max_body_buffer: usize,
    /// The empty Stdin record arrived.
    input_finished: bool,
    aborted: bool,
    abort_signal: watch::Sender<bool>,
    /// The handler future or body stream currently running for this request.
    pub task: Option<AbortHandle>,
}

impl ServerRequestState {
    pub fn new(id: RequestId, keep_connection: bool, config: &Config) -> ServerRequestState {
        let (abort_signal, _) = watch::channel(false);
        ServerRequestState {
            id,
            keep_connection,
            params: Some(ParamAssembler::new(config.max_params_len)),
            body: None,
            max_body_buffer: config.max_body_buffer,
            input_finished: false,
            aborted: false,
            abort_signal,
            task: None,
        }
    }

    /// Takes one Params record. Returns the request once the parameters are
    /// complete.
    pub fn write_params(&mut self, data: Bytes) -> Result<Option<Request<Body>>, Error> {
        let assembler = self.params.as_mut().ok_or(Error::ParamsAlreadySet)?;
        if !data.is_empty() {
            if let Err(e) = assembler.write(&data) {
                self.params = None;
                return Err(e);
            }
            return Ok(None);
        }

        let params = match self.params.take() {
            Some(assembler) => assembler.finish()?,
            None => return Err(Error::ParamsAlreadySet),
        };
        debug!("request {}: {} parameters", self.id, params.len());
        let (signal, tx) = abort_pair();
        self.abort_signal = tx;
        let (request, body) = params.into_request(signal)?;
        self.body = Some(body);
        Ok(Some(request))
    }

    /// Takes one Stdin record. `BodyBufferFull` means the handler left too
    /// much of the body unread; the body has then failed and the request
    /// can't go on.
    pub fn write_stdin(&mut self, data: Bytes) -> Result<(), Error> {
        let body = self.body.as_mut().ok_or(Error::ParamsNotSet)?;
        if data.is_empty() {
            self.input_finished = true;
            body.finish();
        } else if body.send(data) {
            if body.buffered() > self.max_body_buffer {
                let error = Error::BodyBufferFull(self.max_body_buffer);
                body.fail(io::Error::new(io::ErrorKind::Other, error.to_string()));
                return Err(error);
            }
        } else if body.is_finished() {
            debug!("request {}: ignoring input after the end of the body", self.id);
        }
        Ok(())
    }

    /// Whether the web server has sent all of its input for this request.
    pub fn input_finished(&self) -> bool {
        self.input_finished
    }

    /// The web server gave up on this request. Returns false if it was
    /// already aborted.
    pub fn write_abort(&mut self) -> bool {
        if self.aborted {
            return false;
        }
        self.aborted = true;
        self.abort_signal.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(ref mut body) = self.body {
            body.finish();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hi::handler::AbortSignal;
    use crate::hi::params::Params;
    use bytes::BytesMut;
    use futures::executor::block_on;
    use http::Method;

    fn config(max_params_len: usize) -> Config {
        Config { max_params_len, max_body_buffer: 8, ..Config::default() }
    }

    fn params(pairs: &[(&str, &str)]) -> Bytes {
        let params: Params = pairs.iter().cloned().collect();
        params.encode().unwrap()
    }

    #[test]
    fn params_then_body() {
        let mut state = ServerRequestState::new(1, true, &config(1024));
        assert!(matches!(state.write_stdin(Bytes::from_static(b"x")), Err(Error::ParamsNotSet)));

        let encoded = params(&[("REQUEST_METHOD", "POST"), ("REQUEST_URI", "/form")]);
        let (first, second) = encoded.split_at(4);
        assert!(state.write_params(Bytes::copy_from_slice(first)).unwrap().is_none());
        assert!(state.write_params(Bytes::copy_from_slice(second)).unwrap().is_none());
        let request = state.write_params(Bytes::new()).unwrap().unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), "/form");

        assert!(matches!(state.write_params(Bytes::from_static(b"\x01\x01ab")), Err(Error::ParamsAlreadySet)));

        state.write_stdin(Bytes::from_static(b"a=1")).unwrap();
        state.write_stdin(Bytes::new()).unwrap();
        state.write_stdin(Bytes::from_static(b"&b=2")).unwrap();
        let body = block_on(request.into_body().into_bytes()).unwrap();
        assert_eq!(body, Bytes::from_static(b"a=1"));
    }

    #[test]
    fn unbuildable_params() {
        let mut state = ServerRequestState::new(1, true, &config(1024));
        let mut dangling = BytesMut::new();
        dangling.extend_from_slice(&[3, 0, b'a']);
        state.write_params(dangling.freeze()).unwrap();
        assert!(matches!(state.write_params(Bytes::new()), Err(Error::MalformedParams(_))));

        let mut state = ServerRequestState::new(1, true, &config(4));
        assert!(matches!(state.write_params(params(&[("LONG", "value")])), Err(Error::ParamsTooLarge(4))));
        assert!(matches!(state.write_params(Bytes::new()), Err(Error::ParamsAlreadySet)));
    }

    #[test]
    fn abort_flips_signal_and_ends_body() {
        let mut state = ServerRequestState::new(1, true, &config(1024));
        let request = state.write_params(Bytes::new()).unwrap().unwrap();
        let signal = request.extensions().get::<AbortSignal>().unwrap().clone();
        assert!(!signal.is_aborted());

        assert!(state.write_abort());
        assert!(!state.write_abort());
        assert!(signal.is_aborted());
        let body = block_on(request.into_body().into_bytes()).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn unread_input_is_bounded() {
        let mut state = ServerRequestState::new(1, true, &config(1024));
        let request = state.write_params(Bytes::new()).unwrap().unwrap();
        state.write_stdin(Bytes::from_static(b"12345")).unwrap();
        assert!(!state.input_finished());
        assert!(matches!(state.write_stdin(Bytes::from_static(b"6789")), Err(Error::BodyBufferFull(8))));
        state.write_stdin(Bytes::from_static(b"more")).unwrap();
        assert!(!state.input_finished());
        assert!(block_on(request.into_body().into_bytes()).is_err());
    }

    #[test]
    fn input_finished_after_empty_stdin() {
        let mut state = ServerRequestState::new(1, true, &config(1024));
        assert!(!state.input_finished());
        let _request = state.write_params(Bytes::new()).unwrap().unwrap();
        state.write_stdin(Bytes::new()).unwrap();
        assert!(state.input_finished());
    }
}
