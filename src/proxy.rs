//! Request forwarding and the listener that feeds it
//!
//! Every accepted request is forwarded verbatim to the target base URL with
//! the hop-by-hop headers stripped, and the target's answer is streamed back.
//! Failures are contained in the request: the client sees a JSON 500 and the
//! listener keeps serving.

use crate::events::{LogEvent, LogSink};
use bytes::Bytes;
use chrono::Local;
use futures_util::TryStreamExt;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD,
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, ORIGIN, TRANSFER_ENCODING,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::error::Error as StdError;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Upper bound on a single forwarded exchange
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// How long open connections get to finish once shutdown begins
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const RESTRICTED_REQUEST_HEADERS: [HeaderName; 4] =
    [HOST, CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION];
const RESTRICTED_RESPONSE_HEADERS: [HeaderName; 2] = [TRANSFER_ENCODING, CONNECTION];

pub type BoxError = Box<dyn StdError + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid target URL '{url}'")]
    InvalidTarget {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to read request body")]
    RequestBody(#[source] BoxError),

    #[error(transparent)]
    Upstream(#[from] reqwest::Error),
}

/// Forwards single requests to the target and reports each one to a sink
#[derive(Clone)]
pub struct Forwarder {
    target_base: Arc<str>,
    client: reqwest::Client,
    sink: Arc<dyn LogSink>,
}

impl Forwarder {
    pub fn new(target_base: &str, client: reqwest::Client, sink: Arc<dyn LogSink>) -> Self {
        Self {
            target_base: Arc::from(target_base.trim_end_matches('/')),
            client,
            sink,
        }
    }

    /// The outbound client: trust-all TLS, fixed timeout, redirects relayed
    /// rather than followed, no system proxy.
    pub fn build_client() -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(FORWARD_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
    }

    pub fn target_base(&self) -> &str {
        &self.target_base
    }

    /// Handle one inbound request. Never fails; exactly one [`LogEvent`] is
    /// recorded for it, even if the returned future is dropped early.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let mut record = RequestRecord::begin(
            Arc::clone(&self.sink),
            req.method(),
            path_and_query(req.uri()),
        );
        let has_origin = req.headers().contains_key(ORIGIN);

        let mut response = if is_preflight(req.method(), req.headers()) {
            preflight_response(req.headers())
        } else {
            match self.forward(req).await {
                Ok(response) => response,
                Err(e) => {
                    let message = error_chain(&e);
                    warn!("{} {} failed: {}", record.method, record.path, message);
                    error_response(&message)
                }
            }
        };

        if has_origin && !response.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN) {
            response
                .headers_mut()
                .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        }

        record.status = response.status().as_u16();
        response
    }

    async fn forward<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let url = target_url(&self.target_base, &parts.uri)?;
        debug!("Forwarding {} {}", parts.method, url);

        let mut outbound = self
            .client
            .request(parts.method.clone(), url)
            .headers(forwarded_request_headers(&parts.headers));

        if declares_body(&parts.headers) {
            let bytes = body
                .collect()
                .await
                .map_err(|e| ForwardError::RequestBody(e.into()))?
                .to_bytes();
            outbound = outbound.body(bytes);
        }

        let upstream = outbound.send().await?;
        let status = upstream.status();
        let headers = relayed_response_headers(upstream.headers());

        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);

        let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Emits the request's [`LogEvent`] when dropped. The status starts out as
/// 500 and is only overwritten once a response exists.
struct RequestRecord {
    sink: Arc<dyn LogSink>,
    started: chrono::DateTime<Local>,
    method: String,
    path: String,
    status: u16,
}

impl RequestRecord {
    fn begin(sink: Arc<dyn LogSink>, method: &Method, path: &str) -> Self {
        Self {
            sink,
            started: Local::now(),
            method: method.to_string(),
            path: path.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }
}

impl Drop for RequestRecord {
    fn drop(&mut self) {
        let event = LogEvent {
            timestamp: self.started,
            method: std::mem::take(&mut self.method),
            path: std::mem::take(&mut self.path),
            status_code: self.status,
        };
        debug!("{} {} -> {}", event.method, event.path, event.status_code);

        let sink = &self.sink;
        if panic::catch_unwind(AssertUnwindSafe(|| sink.record(event))).is_err() {
            warn!("Request log sink panicked; event discarded");
        }
    }
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map_or("/", |pq| pq.as_str())
}

/// Target base plus the request's path and query. Dot segments in the path
/// are resolved by the URL parser; the query is left alone.
fn target_url(target_base: &str, uri: &Uri) -> Result<reqwest::Url, ForwardError> {
    let target = format!("{}{}", target_base, path_and_query(uri));
    reqwest::Url::parse(&target).map_err(|source| ForwardError::InvalidTarget {
        url: target.clone(),
        source,
    })
}

fn forwarded_request_headers(headers: &HeaderMap) -> HeaderMap {
    copy_headers_except(headers, &RESTRICTED_REQUEST_HEADERS)
}

fn relayed_response_headers(headers: &HeaderMap) -> HeaderMap {
    copy_headers_except(headers, &RESTRICTED_RESPONSE_HEADERS)
}

fn copy_headers_except(headers: &HeaderMap, restricted: &[HeaderName]) -> HeaderMap {
    let mut copied = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !restricted.contains(name) {
            copied.append(name.clone(), value.clone());
        }
    }
    copied
}

/// A positive `Content-Length` or any `Transfer-Encoding` means a body follows
fn declares_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .is_some_and(|length| length > 0)
}

fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::OPTIONS
        && headers.contains_key(ORIGIN)
        && headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
}

fn preflight_response(headers: &HeaderMap) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::NO_CONTENT;

    let allow = response.headers_mut();
    allow.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    if let Some(method) = headers.get(ACCESS_CONTROL_REQUEST_METHOD) {
        allow.insert(ACCESS_CONTROL_ALLOW_METHODS, method.clone());
    }
    if let Some(requested) = headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
        allow.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
    response
}

/// `{"error": "<message>"}` with status 500
fn error_response(message: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Display an error followed by each of its sources
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A bound listener with its accept loop running in the background
pub struct ProxyServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ProxyServer {
    /// Bind `0.0.0.0:port` and start accepting. Returns once the listener is
    /// ready, so connections made after this succeed.
    pub async fn bind(
        port: u16,
        tls: Option<TlsAcceptor>,
        forwarder: Forwarder,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, signal) = watch::channel(false);

        info!(
            "Proxy listening on {} ({}) -> {}",
            local_addr,
            if tls.is_some() { "https" } else { "http" },
            forwarder.target_base()
        );
        let accept_task = tokio::spawn(accept_loop(listener, tls, forwarder, signal));

        Ok(Self {
            local_addr,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, let open connections finish for up to
    /// [`SHUTDOWN_GRACE`], then abort whatever is left.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.accept_task.await {
            warn!("Proxy accept loop ended abnormally: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    forwarder: Forwarder,
    mut signal: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    connections.spawn(serve_connection(
                        stream,
                        remote_addr,
                        tls.clone(),
                        forwarder.clone(),
                        signal.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = signal.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    debug!("Listener closed, draining {} connections", connections.len());

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "{} connections still open after {:?}, aborting",
            connections.len(),
            SHUTDOWN_GRACE
        );
        connections.shutdown().await;
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    forwarder: Forwarder,
    signal: watch::Receiver<bool>,
) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => serve_http(TokioIo::new(stream), remote_addr, forwarder, signal).await,
            Err(e) => debug!("TLS handshake with {} failed: {}", remote_addr, e),
        },
        None => serve_http(TokioIo::new(stream), remote_addr, forwarder, signal).await,
    }
}

async fn serve_http<I>(
    io: I,
    remote_addr: SocketAddr,
    forwarder: Forwarder,
    mut signal: watch::Receiver<bool>,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let forwarder = forwarder.clone();
        async move { Ok::<_, Infallible>(forwarder.handle(req).await) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = signal.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    if let Err(e) = result {
        debug!("Connection error from {}: {}", remote_addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RequestLog;

    fn forwarder(target: &str) -> (Forwarder, Arc<RequestLog>) {
        let log = Arc::new(RequestLog::new());
        let sink: Arc<dyn LogSink> = log.clone();
        let client = Forwarder::build_client().unwrap();
        (Forwarder::new(target, client, sink), log)
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn outbound(target_base: &str, uri: &str) -> String {
        target_url(target_base, &uri.parse::<Uri>().unwrap())
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_target_url_keeps_ordinary_paths() {
        let base = "http://127.0.0.1:5059";
        assert_eq!(
            outbound(base, "/search?q=a%20b&x=1"),
            "http://127.0.0.1:5059/search?q=a%20b&x=1"
        );
        assert_eq!(outbound(base, "/files/a%2Fb"), "http://127.0.0.1:5059/files/a%2Fb");
    }

    #[test]
    fn test_target_url_resolves_dot_segments() {
        let base = "http://127.0.0.1:5059";
        assert_eq!(outbound(base, "/a/../b"), "http://127.0.0.1:5059/b");
        assert_eq!(outbound(base, "/a/./b"), "http://127.0.0.1:5059/a/b");
        assert_eq!(outbound(base, "/%2e%2e/x"), "http://127.0.0.1:5059/x");
        assert_eq!(outbound(base, "/../../etc"), "http://127.0.0.1:5059/etc");
        assert_eq!(
            outbound(base, "/a/../b?next=../c"),
            "http://127.0.0.1:5059/b?next=../c"
        );
    }

    #[test]
    fn test_target_url_dot_segments_can_leave_base_path_but_not_host() {
        let base = "http://127.0.0.1:5059/api";
        assert_eq!(outbound(base, "/v1/../users"), "http://127.0.0.1:5059/api/users");
        assert_eq!(outbound(base, "/%2E%2E/admin"), "http://127.0.0.1:5059/admin");
        assert_eq!(
            outbound(base, "//other.host/x"),
            "http://127.0.0.1:5059/api//other.host/x"
        );
    }

    #[test]
    fn test_request_headers_strip_restricted_set() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("192.168.1.20:3000"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.append("x-trace", HeaderValue::from_static("a"));
        headers.append("x-trace", HeaderValue::from_static("b"));

        let forwarded = forwarded_request_headers(&headers);
        for name in RESTRICTED_REQUEST_HEADERS {
            assert!(!forwarded.contains_key(&name), "forwarded {}", name);
        }
        assert_eq!(forwarded[CONTENT_TYPE], "application/json");
        assert_eq!(forwarded.get_all("x-trace").iter().count(), 2);
    }

    #[test]
    fn test_response_headers_keep_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("11"));
        headers.insert("set-cookie", HeaderValue::from_static("session=1"));

        let relayed = relayed_response_headers(&headers);
        assert!(!relayed.contains_key(TRANSFER_ENCODING));
        assert!(!relayed.contains_key(CONNECTION));
        assert_eq!(relayed[CONTENT_LENGTH], "11");
        assert_eq!(relayed["set-cookie"], "session=1");
    }

    #[test]
    fn test_declares_body() {
        let mut headers = HeaderMap::new();
        assert!(!declares_body(&headers));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(!declares_body(&headers));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert!(declares_body(&headers));

        let mut chunked = HeaderMap::new();
        chunked.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        assert!(declares_body(&chunked));
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let inner = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let outer = ForwardError::RequestBody(Box::new(inner));
        assert_eq!(
            error_chain(&outer),
            "failed to read request body: connection refused"
        );
    }

    #[tokio::test]
    async fn test_unreachable_target_gives_json_500_and_one_event() {
        let (forwarder, log) = forwarder("http://127.0.0.1:1");
        let request = Request::builder()
            .uri("/anything?x=1")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = forwarder.handle(request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert!(!response.headers().contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));

        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(!body["error"].as_str().unwrap().is_empty());

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method, "GET");
        assert_eq!(entries[0].path, "/anything?x=1");
        assert_eq!(entries[0].status_code, 500);
    }

    #[tokio::test]
    async fn test_error_response_allows_any_origin() {
        let (forwarder, _log) = forwarder("http://127.0.0.1:1");
        let request = Request::builder()
            .uri("/")
            .header(ORIGIN, "http://phone.local")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = forwarder.handle(request).await;
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_preflight_answered_locally() {
        let (forwarder, log) = forwarder("http://127.0.0.1:1");
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/items")
            .header(ORIGIN, "http://phone.local")
            .header(ACCESS_CONTROL_REQUEST_METHOD, "PUT")
            .header(ACCESS_CONTROL_REQUEST_HEADERS, "content-type, x-token")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = forwarder.handle(request).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], "PUT");
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_HEADERS],
            "content-type, x-token"
        );

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method, "OPTIONS");
        assert_eq!(entries[0].status_code, 204);
    }

    #[tokio::test]
    async fn test_plain_options_is_forwarded() {
        let (forwarder, log) = forwarder("http://127.0.0.1:1");
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let response = forwarder.handle(request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(log.entries()[0].status_code, 500);
    }

    #[test]
    fn test_dropped_request_logs_500() {
        let log = Arc::new(RequestLog::new());
        let sink: Arc<dyn LogSink> = log.clone();
        drop(RequestRecord::begin(sink, &Method::POST, "/upload"));

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method, "POST");
        assert_eq!(entries[0].status_code, 500);
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let sink: Arc<dyn LogSink> = Arc::new(|_event: LogEvent| panic!("sink failure"));
        drop(RequestRecord::begin(sink, &Method::GET, "/"));
    }
}
