//! HTTP service
//!
//! Translates hyper requests into cache exchanges and exchange replies back
//! into responses. Each request passes, in order:
//!
//! ```text
//! authenticate (401) → authorize (403) → throttle (429)
//!     → TRACE echo
//!     → GET/PUT: resolve key (400) → exchange
//!     → anything else (405)
//! ```

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE,
    RETRY_AFTER, WWW_AUTHENTICATE,
};
use hyper::{Method, Request, Response, StatusCode};
use tokio::sync::Mutex;
use tokio::time::error::Elapsed;
use tracing::{debug, trace, warn};

use super::handler::{CacheHandler, Exchange};
use super::idle::IdleTimeouts;
use super::proxy::ProxyProtocolConfig;
use super::routing::ServerPrefix;
use crate::auth::{Authenticator, Authorizer, BasicAuthenticator, Principal, RoleAuthorizer};
use crate::cache::SharedBackend;
use crate::config::{AuthenticationConfig, Configuration};
use crate::error::Error;
use crate::metrics;
use crate::protocol::{CacheMessage, CacheValueMetadata};
use crate::throttling::{BucketManager, BucketThrottler, ThrottleDecision, ThrottlingGate};

/// Response body type of every cache response
pub type ResponseBody = UnsyncBoxBody<Bytes, Error>;

const OCTET_STREAM: &str = "application/octet-stream";
const MESSAGE_HTTP: &str = "message/http";

// =============================================================================
// Server Context
// =============================================================================

/// State shared by every connection
pub struct ServerContext {
    pub backend: SharedBackend,
    pub prefix: ServerPrefix,
    /// `None` when authentication is disabled
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub authorizer: Arc<dyn Authorizer>,
    pub throttling: ThrottlingGate,
    pub max_request_size: u64,
    pub idle_timeouts: IdleTimeouts,
    pub proxy_protocol: ProxyProtocolConfig,
}

impl ServerContext {
    pub fn new(config: &Configuration, backend: SharedBackend) -> Self {
        let authenticator: Option<Arc<dyn Authenticator>> = match config.authentication {
            AuthenticationConfig::None => None,
            AuthenticationConfig::Basic => Some(Arc::new(BasicAuthenticator::new(
                &config.users,
                &config.groups,
            ))),
        };

        let buckets = BucketManager::new(&config.users, &config.groups);
        let throttling = if buckets.is_empty() {
            ThrottlingGate::disabled()
        } else {
            ThrottlingGate::new(
                Arc::new(BucketThrottler::new(buckets)),
                config.rate_limiter.delay_request,
                config.throttle_delay_threshold(),
            )
        };

        Self {
            backend,
            prefix: ServerPrefix::new(config.server_path.as_deref()),
            authenticator,
            authorizer: Arc::new(RoleAuthorizer),
            throttling,
            max_request_size: config.connection.max_request_size,
            idle_timeouts: IdleTimeouts::from_config(&config.connection),
            proxy_protocol: config.proxy_protocol.clone(),
        }
    }
}

// =============================================================================
// Cache Service
// =============================================================================

/// Per-connection service; cloned into every request future
#[derive(Clone)]
pub struct CacheService {
    context: Arc<ServerContext>,
    peer: SocketAddr,
    handler: Arc<Mutex<CacheHandler>>,
}

impl CacheService {
    pub fn new(context: Arc<ServerContext>, peer: SocketAddr) -> Self {
        let handler = CacheHandler::new(Arc::clone(&context.backend));
        Self {
            context,
            peer,
            handler: Arc::new(Mutex::new(handler)),
        }
    }

    pub async fn call<B>(&self, request: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Display,
    {
        let method = request.method().clone();
        debug!(%method, path = %request.uri().path(), "Request received");

        let response = self.route(request).await;

        metrics::REQUESTS_TOTAL
            .with_label_values(&[method.as_str(), response.status().as_str()])
            .inc();
        debug!(%method, status = %response.status(), "Response ready");
        response
    }

    async fn route<B>(&self, request: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Display,
    {
        let principal = match &self.context.authenticator {
            None => Principal::unauthenticated(),
            Some(authenticator) => {
                let Some(principal) = authenticator
                    .authenticate(self.peer, request.headers())
                    .await
                else {
                    return unauthorized();
                };
                if !self
                    .context
                    .authorizer
                    .authorize(&principal.roles, request.method())
                {
                    debug!(user = ?principal.user, method = %request.method(), "Forbidden");
                    return status_response(StatusCode::FORBIDDEN);
                }
                principal
            }
        };

        if let ThrottleDecision::Reject { retry_after } =
            self.context.throttling.admit(&principal, self.peer).await
        {
            debug!(user = ?principal.user, wait = ?retry_after, "Request throttled");
            let mut response = status_response(StatusCode::TOO_MANY_REQUESTS);
            let seconds = retry_after.as_secs();
            if seconds >= 1 {
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(seconds));
            }
            return response;
        }

        let method = request.method().clone();
        if method == Method::TRACE {
            return trace_echo(request);
        }
        if method != Method::GET && method != Method::PUT {
            warn!(%method, "Got request with unhandled method");
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        let Some(key) = self.context.prefix.resolve_key(request.uri().path()) else {
            warn!(path = %request.uri().path(), "Got request for unhandled path");
            return status_response(StatusCode::BAD_REQUEST);
        };

        if method == Method::GET {
            self.get(key).await
        } else {
            self.put(key, request).await
        }
    }

    async fn get(&self, key: String) -> Response<ResponseBody> {
        let mut exchange = Exchange::begin(Arc::clone(&self.handler)).await;
        let reply = exchange.handle(CacheMessage::GetRequest { key }).await;
        match reply {
            Some(CacheMessage::ValueFound { metadata, .. }) => {
                let mut response = Response::new(
                    StreamBody::new(content_frames(exchange)).boxed_unsync(),
                );
                let content_type = metadata.mime_type.as_deref().unwrap_or(OCTET_STREAM);
                set_header(response.headers_mut(), CONTENT_TYPE, content_type);
                if let Some(disposition) = metadata.content_disposition.as_deref() {
                    set_header(response.headers_mut(), CONTENT_DISPOSITION, disposition);
                }
                response
            }
            Some(CacheMessage::ValueNotFound) => status_response(StatusCode::NOT_FOUND),
            reply => reply_response(reply),
        }
    }

    async fn put<B>(&self, key: String, request: Request<B>) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Display,
    {
        let limit = self.context.max_request_size;
        if declared_length(request.headers()).is_some_and(|length| length > limit) {
            warn!(key = %key, limit, "Declared request body too large");
            return error_response(&Error::ContentTooLarge { limit });
        }

        let metadata = CacheValueMetadata::from_headers(request.headers());
        let mut body = request.into_body();
        let mut exchange = Exchange::begin(Arc::clone(&self.handler)).await;
        if let Some(reply) = exchange
            .handle(CacheMessage::PutRequest { key, metadata })
            .await
        {
            return reply_response(Some(reply));
        }

        let mut received: u64 = 0;
        loop {
            let frame = match next_frame(&mut body, self.context.idle_timeouts.read).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "Request body aborted");
                    let reply = exchange.exception_caught(Error::ConnectionClosed);
                    return reply_response(Some(reply));
                }
                Err(_) => {
                    debug!(received, "Request body stalled");
                    let reply = exchange.exception_caught(Error::ConnectionClosed);
                    let mut response = reply_response(Some(reply));
                    response
                        .headers_mut()
                        .insert(CONNECTION, HeaderValue::from_static("close"));
                    return response;
                }
            };
            let Ok(chunk) = frame.into_data() else {
                continue;
            };
            received += chunk.len() as u64;
            if received > limit {
                let reply = exchange.exception_caught(Error::ContentTooLarge { limit });
                return reply_response(Some(reply));
            }
            trace!(len = chunk.len(), received, "Request chunk");
            if let Some(reply) = exchange.handle(CacheMessage::Content(chunk)).await {
                return reply_response(Some(reply));
            }
        }

        match exchange.handle(CacheMessage::LastContent(Bytes::new())).await {
            Some(CacheMessage::PutResponse { key }) => {
                let mut response = Response::new(full(key));
                *response.status_mut() = StatusCode::CREATED;
                response
            }
            reply => reply_response(reply),
        }
    }
}

/// Next request body frame, or `Elapsed` when none arrives within `limit`
async fn next_frame<B>(
    body: &mut B,
    limit: Duration,
) -> Result<Option<Result<Frame<B::Data>, B::Error>>, Elapsed>
where
    B: Body + Unpin,
{
    if limit.is_zero() {
        return Ok(body.frame().await);
    }
    tokio::time::timeout(limit, body.frame()).await
}

/// Stream an exchange's outbound content as body frames
fn content_frames(exchange: Exchange) -> impl Stream<Item = Result<Frame<Bytes>, Error>> + Send {
    stream::unfold(Some(exchange), |state| async move {
        let mut exchange = state?;
        loop {
            match exchange.next_outbound().await {
                Some(CacheMessage::Content(chunk)) if chunk.is_empty() => continue,
                Some(CacheMessage::Content(chunk)) => {
                    trace!(len = chunk.len(), "Response chunk");
                    return Some((Ok(Frame::data(chunk)), Some(exchange)));
                }
                Some(CacheMessage::LastContent(chunk)) if !chunk.is_empty() => {
                    return Some((Ok(Frame::data(chunk)), None));
                }
                Some(CacheMessage::ExceptionCaught(e)) => return Some((Err(e), None)),
                _ => return None,
            }
        }
    })
}

/// Echo the request head, then the request body, as `message/http`
fn trace_echo<B>(request: Request<B>) -> Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display,
{
    let mut head = BytesMut::new();
    let target = request
        .uri()
        .path_and_query()
        .map_or("/", |target| target.as_str());
    head.extend_from_slice(format!("TRACE {target} {:?}\r\n", request.version()).as_bytes());
    for (name, value) in request.headers() {
        head.extend_from_slice(title_case(name.as_str()).as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    let body = BodyStream::new(request.into_body()).map(|frame| {
        frame.map_err(|e| {
            debug!(error = %e, "Trace body aborted");
            Error::ConnectionClosed
        })
    });
    let frames = stream::once(async move { Ok(Frame::data(head.freeze())) }).chain(body);

    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    set_header(response.headers_mut(), CONTENT_TYPE, MESSAGE_HTTP);
    response
}

/// `x-test` → `X-Test`
fn title_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

fn set_header(headers: &mut HeaderMap, name: hyper::header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn empty() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn full(content: impl Into<Bytes>) -> ResponseBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

fn error_response(error: &Error) -> Response<ResponseBody> {
    status_response(error.status_code())
}

fn unauthorized() -> Response<ResponseBody> {
    let mut response = status_response(StatusCode::UNAUTHORIZED);
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"buildcache\""),
    );
    response
}

/// Response for a reply that ends an exchange without content
fn reply_response(reply: Option<CacheMessage>) -> Response<ResponseBody> {
    match reply {
        Some(CacheMessage::ExceptionCaught(e)) => error_response(&e),
        Some(CacheMessage::ValueNotFound) => status_response(StatusCode::NOT_FOUND),
        other => {
            let name = other.as_ref().map_or("nothing", CacheMessage::name);
            error_response(&Error::ProtocolViolation(format!(
                "exchange ended with {name}"
            )))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::hash_password;
    use crate::auth::{GroupConfig, Role, UserConfig};
    use crate::cache::{InMemoryCache, InMemoryCacheConfig};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn service_with(config: &Configuration) -> CacheService {
        let backend = InMemoryCache::new(InMemoryCacheConfig::default(), 4).unwrap();
        let context = ServerContext::new(config, Arc::new(backend));
        CacheService::new(Arc::new(context), peer())
    }

    fn service() -> CacheService {
        service_with(&Configuration {
            server_path: Some("/cache".into()),
            ..Default::default()
        })
    }

    fn request(method: Method, path: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    async fn body_of(response: Response<ResponseBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let service = service();
        let put = Request::builder()
            .method(Method::PUT)
            .uri("/cache/abc")
            .header(CONTENT_TYPE, "text/plain")
            .header(CONTENT_DISPOSITION, "attachment; filename=\"abc.txt\"")
            .body(Full::new(Bytes::from_static(b"some cached bytes")))
            .unwrap();
        let response = service.call(put).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_of(response).await, "abc");

        let response = service.call(request(Method::GET, "/cache/abc", b"")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"abc.txt\""
        );
        assert_eq!(body_of(response).await, "some cached bytes");
    }

    #[tokio::test]
    async fn test_missing_key_and_default_content_type() {
        let service = service();
        let response = service.call(request(Method::GET, "/cache/nope", b"")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        service.call(request(Method::PUT, "/cache/empty", b"")).await;
        let response = service.call(request(Method::GET, "/cache/empty", b"")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], OCTET_STREAM);
        assert!(body_of(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_paths_outside_prefix_rejected() {
        let service = service();
        for path in ["/other/abc", "/cache/../etc/passwd", "/cache/a/b", "/cache"] {
            let response = service.call(request(Method::GET, path, b"")).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
        }
        let response = service.call(request(Method::PUT, "/x/abc", b"data")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsupported_methods() {
        let service = service();
        for method in [Method::DELETE, Method::POST, Method::HEAD, Method::OPTIONS] {
            let response = service.call(request(method.clone(), "/cache/abc", b"")).await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{method}");
        }
    }

    #[tokio::test]
    async fn test_trace_echo() {
        let service = service();
        let trace = Request::builder()
            .method(Method::TRACE)
            .uri("/anything?x=1&y")
            .header("x-test", "1")
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap();
        let response = service.call(trace).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], MESSAGE_HTTP);
        let body = String::from_utf8(body_of(response).await.to_vec()).unwrap();
        assert!(body.starts_with("TRACE /anything?x=1&y HTTP/1.1\r\n"), "{body}");
        assert!(body.contains("X-Test: 1\r\n"));
        assert!(body.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_oversized_body_rolled_back() {
        let service = service_with(&Configuration {
            server_path: Some("/cache".into()),
            connection: crate::config::ConnectionConfig {
                max_request_size: 8,
                ..Default::default()
            },
            ..Default::default()
        });

        let declared = Request::builder()
            .method(Method::PUT)
            .uri("/cache/big")
            .header(CONTENT_LENGTH, "100")
            .body(Full::new(Bytes::from_static(b"x")))
            .unwrap();
        assert_eq!(
            service.call(declared).await.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );

        let chunks = stream::iter(vec![
            Ok::<_, std::io::Error>(Frame::data(Bytes::from_static(b"12345"))),
            Ok(Frame::data(Bytes::from_static(b"67890"))),
        ]);
        let streamed = Request::builder()
            .method(Method::PUT)
            .uri("/cache/big")
            .body(StreamBody::new(chunks))
            .unwrap();
        assert_eq!(
            service.call(streamed).await.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );

        let response = service.call(request(Method::GET, "/cache/big", b"")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_aborted_body_rolled_back() {
        let service = service();
        let chunks = stream::iter(vec![
            Ok(Frame::data(Bytes::from_static(b"partial"))),
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "gone")),
        ]);
        let put = Request::builder()
            .method(Method::PUT)
            .uri("/cache/partial")
            .body(StreamBody::new(chunks))
            .unwrap();
        service.call(put).await;

        let response = service.call(request(Method::GET, "/cache/partial", b"")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stalled_body_rolled_back() {
        let service = service_with(&Configuration {
            server_path: Some("/cache".into()),
            connection: crate::config::ConnectionConfig {
                read_idle_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            ..Default::default()
        });
        let chunks = stream::iter(vec![Ok::<_, std::io::Error>(Frame::data(
            Bytes::from_static(b"partial"),
        ))])
        .chain(stream::pending());
        let put = Request::builder()
            .method(Method::PUT)
            .uri("/cache/stalled")
            .body(StreamBody::new(chunks))
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), service.call(put))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[CONNECTION], "close");

        let response = service.call(request(Method::GET, "/cache/stalled", b"")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    #[tokio::test]
    async fn test_authentication_and_roles() {
        let config = Configuration {
            authentication: AuthenticationConfig::Basic,
            users: vec![
                UserConfig::new("writer")
                    .with_password_hash(hash_password("secret").unwrap())
                    .with_groups(["writers"]),
                UserConfig::new("reader")
                    .with_password_hash(hash_password("secret").unwrap())
                    .with_groups(["readers"]),
            ],
            groups: vec![
                GroupConfig::new("writers", [Role::Reader, Role::Writer]),
                GroupConfig::new("readers", [Role::Reader]),
            ],
            ..Default::default()
        };
        let service = service_with(&config);

        let response = service.call(request(Method::GET, "/abc", b"")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(WWW_AUTHENTICATE));

        let with_auth = |method: Method, auth: String, body: &'static [u8]| {
            Request::builder()
                .method(method)
                .uri("/abc")
                .header(hyper::header::AUTHORIZATION, auth)
                .body(Full::new(Bytes::from_static(body)))
                .unwrap()
        };

        let response = service
            .call(with_auth(Method::PUT, basic("writer", "wrong"), b"v"))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = service
            .call(with_auth(Method::PUT, basic("reader", "secret"), b"v"))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = service
            .call(with_auth(Method::PUT, basic("writer", "secret"), b"v"))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = service
            .call(with_auth(Method::GET, basic("reader", "secret"), b""))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = service
            .call(with_auth(Method::TRACE, basic("reader", "secret"), b""))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = service
            .call(with_auth(Method::DELETE, basic("writer", "secret"), b""))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_throttled_request_gets_retry_after() {
        let mut anonymous = UserConfig::new(crate::auth::ANONYMOUS_USER).with_groups(["everyone"]);
        anonymous.quota = Some(crate::throttling::Quota::new(1, Duration::from_secs(120)));
        let config = Configuration {
            authentication: AuthenticationConfig::Basic,
            users: vec![anonymous],
            groups: vec![GroupConfig::new("everyone", Role::all())],
            ..Default::default()
        };
        let service = service_with(&config);

        let response = service.call(request(Method::GET, "/abc", b"")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = service.call(request(Method::GET, "/abc", b"")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()[RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=120).contains(&retry_after));
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("x-test"), "X-Test");
        assert_eq!(title_case("content-type"), "Content-Type");
        assert_eq!(title_case("host"), "Host");
    }
}
