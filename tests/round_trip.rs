use bytes::Bytes;
use fastcgi_mux::{Body, BoxError, Client, ConnectionEvent, Error, Events, Handler, ProtocolStatus,
                  Reply, RequestEvent, Server};
use futures::{stream, StreamExt};
use http::{Request, Response, StatusCode};
use tokio::net::TcpListener;

use std::future::Future;
use std::time::Duration;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Connects a client to a server over an in-memory pipe and runs both.
fn pair<H: Handler>(handler: H) -> (Client, Events<ConnectionEvent>) {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let mut server_connection = Server::new(handler).connection(server_io);
    let server_events = server_connection.take_events().unwrap();
    tokio::spawn(server_connection.run());

    let (client, client_connection) = Client::new(client_io);
    tokio::spawn(client_connection.run());
    (client, server_events)
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future).await.expect("timed out")
}

fn not_found(_request: Request<Body>) -> Reply {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/plain")
        .body(Body::from("not found"))
        .unwrap()
        .into()
}

async fn echo(request: Request<Body>) -> Result<Response<Body>, BoxError> {
    let (parts, body) = request.into_parts();
    let body = body.into_bytes().await?;
    let mut headers: Vec<String> = parts.headers.iter()
        .map(|(name, value)| format!("{}={}", name, value.to_str().unwrap_or("?")))
        .collect();
    headers.sort();
    let text = format!("{} {} {:?}\n{}\n{}",
                       parts.method, parts.uri, parts.version, headers.join(";"),
                       String::from_utf8_lossy(&body));
    Ok(Response::new(Body::from(text)))
}

#[tokio::test]
async fn not_found_reaches_the_client() {
    init();
    let (mut client, mut server_events) = pair(not_found);

    let mut request = client.send(Request::get("/missing").body(Bytes::new()).unwrap());
    let response = within(request.response()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["content-type"], "text/plain");
    let body = within(response.into_body().into_bytes()).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"not found"));

    match within(request.events().next()).await {
        Some(RequestEvent::Headers { status, headers }) => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(headers["content-type"], "text/plain");
        },
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(within(request.events().next()).await, Some(RequestEvent::End)));

    assert!(matches!(within(server_events.next()).await, Some(ConnectionEvent::Begin(1))));
    assert!(matches!(within(server_events.next()).await,
                     Some(ConnectionEvent::Response { id: 1, status }) if status == StatusCode::NOT_FOUND));
    assert!(matches!(within(server_events.next()).await, Some(ConnectionEvent::End(1))));
}

#[tokio::test]
async fn request_survives_parameter_encoding() {
    init();
    let (mut client, _server_events) = pair(|request: Request<Body>| Reply::deferred(echo(request)));

    let request = Request::post("/submit?x=1")
        .header("Accept", "a/b")
        .header("X-Custom", "1")
        .header("Content-Type", "text/plain")
        .body(Bytes::from_static(b"hello"))
        .unwrap();
    let response = within(client.send(request).response()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = within(response.into_body().into_bytes()).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&body),
               "POST /submit?x=1 HTTP/1.1\n\
                accept=a/b;content-length=5;content-type=text/plain;x-custom=1\n\
                hello");
}

#[tokio::test]
async fn large_streaming_body() {
    init();
    let handler = |_: Request<Body>| -> Reply {
        let chunks = (0..3u8).map(|i| Ok::<_, std::io::Error>(Bytes::from(vec![b'a' + i; 70_000])));
        Response::new(Body::wrap_stream(stream::iter(chunks))).into()
    };
    let (mut client, _server_events) = pair(handler);

    let response = within(client.send(Request::get("/big").body(Bytes::new()).unwrap()).response())
        .await
        .unwrap();
    let body = within(response.into_body().into_bytes()).await.unwrap();
    assert_eq!(body.len(), 210_000);
    assert!(body[..70_000].iter().all(|&b| b == b'a'));
    assert!(body[140_000..].iter().all(|&b| b == b'c'));
}

#[tokio::test]
async fn concurrent_requests_stay_apart() {
    init();
    let handler = |request: Request<Body>| -> Reply {
        Reply::deferred(async move {
            // Later requests answer first.
            let n: u64 = request.uri().path().trim_start_matches('/').parse()?;
            tokio::time::sleep(Duration::from_millis(60 - n * 20)).await;
            Ok::<_, BoxError>(Response::new(Body::from(request.uri().to_string())))
        })
    };
    let (mut client, _server_events) = pair(handler);

    let mut requests: Vec<_> = (0..3)
        .map(|n| client.send(Request::get(format!("/{}", n)).body(Bytes::new()).unwrap()))
        .collect();
    for (n, request) in requests.iter_mut().enumerate() {
        let response = within(request.response()).await.unwrap();
        let body = within(response.into_body().into_bytes()).await.unwrap();
        assert_eq!(body, Bytes::from(format!("/{}", n)));
    }
}

#[tokio::test]
async fn no_response_fails_the_request() {
    init();
    let (mut client, _server_events) = pair(|_: Request<Body>| Reply::NoResponse);
    let mut request = client.send(Request::get("/").body(Bytes::new()).unwrap());
    match within(request.response()).await {
        Err(Error::NoResponse(ProtocolStatus::UnknownRole)) => {},
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(within(request.events().next()).await, Some(RequestEvent::End)));
}

#[tokio::test]
async fn abort_before_headers() {
    init();
    let handler = |_: Request<Body>| Reply::deferred(futures::future::pending());
    let (mut client, mut server_events) = pair(handler);

    let mut request = client.send(Request::get("/slow").body(Bytes::new()).unwrap());
    assert!(matches!(within(server_events.next()).await, Some(ConnectionEvent::Begin(1))));
    request.abort();
    request.abort();

    assert!(matches!(within(request.response()).await, Err(Error::Aborted)));
    assert!(matches!(within(request.events().next()).await, Some(RequestEvent::End)));
    assert!(matches!(within(request.events().next()).await, Some(RequestEvent::Abort)));
    assert!(matches!(within(server_events.next()).await, Some(ConnectionEvent::Abort(1))));
    assert!(request.events().try_next_event().is_none());
}

#[tokio::test]
async fn over_tcp() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { Server::new(not_found).serve(listener).await });

    let (mut client, mut connection) = within(Client::connect(addr)).await.unwrap();
    let mut events = connection.take_events().unwrap();
    let driver = tokio::spawn(connection.run());

    let response = within(client.send(Request::get("/").body(Bytes::new()).unwrap()).response())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = within(response.into_body().into_bytes()).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"not found"));

    client.close();
    within(driver).await.unwrap().unwrap();
    assert!(matches!(within(events.next()).await, Some(ConnectionEvent::Begin(1))));
    assert!(matches!(within(events.next()).await, Some(ConnectionEvent::Close)));
    assert!(within(events.next()).await.is_none());
}
