//! Single-target HTTP forwarding.
//!
//! # Responsibilities
//! - Rewrite inbound requests onto the backend target (URI, `Host`)
//! - Add `X-Forwarded-*` headers and strip hop-by-hop headers
//! - Stream the backend's response back unchanged
//! - Route backend failures through an [`ErrorHandler`]
//!
//! # Design Decisions
//! - Never retried; every failure is a single-shot error response
//! - Client disconnects are classified structurally, not by message text

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, request, HeaderValue, Request, StatusCode, Uri, Version};
use axum::response::Response;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::config::BackendTarget;
use crate::http::request::request_id;
use crate::http::response::{error_response, strip_hop_by_hop};
use crate::resilience::{with_timeout, Elapsed};

/// HTTP client used to reach the backend.
pub type HttpClient = Client<HttpConnector, Body>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Why a request could not be forwarded.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The client went away before the backend answered.
    #[error("client canceled the request")]
    ClientCanceled,
    #[error(transparent)]
    Timeout(#[from] Elapsed),
    #[error("failed to connect to backend: {0}")]
    Connect(#[source] hyper_util::client::legacy::Error),
    #[error("backend request failed: {0}")]
    Upstream(#[source] hyper_util::client::legacy::Error),
    #[error("failed to build backend request: {0}")]
    Request(#[from] axum::http::Error),
}

impl ForwardError {
    pub fn is_client_canceled(&self) -> bool {
        matches!(self, ForwardError::ClientCanceled)
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::ClientCanceled => "client_canceled",
            ForwardError::Timeout(_) => "timeout",
            ForwardError::Connect(_) => "connect",
            ForwardError::Upstream(_) => "upstream",
            ForwardError::Request(_) => "request",
        }
    }
}

impl From<hyper_util::client::legacy::Error> for ForwardError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if caused_by_client(&err) {
            ForwardError::ClientCanceled
        } else if err.is_connect() {
            ForwardError::Connect(err)
        } else {
            ForwardError::Upstream(err)
        }
    }
}

/// True when the failure originates on the client side: hyper reports the
/// request as canceled, or reading the inbound body (the only `axum::Error`
/// source in a forwarded request) failed.
fn caused_by_client(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_canceled() {
                return true;
            }
        }
        if e.is::<axum::Error>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Callback invoked when forwarding fails.
///
/// Returning `None` writes nothing further; use it when the client is gone.
/// It is called at most once per request.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(&self, request: &request::Parts, error: &ForwardError) -> Option<Response>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&request::Parts, &ForwardError) -> Option<Response> + Send + Sync + 'static,
{
    fn handle(&self, request: &request::Parts, error: &ForwardError) -> Option<Response> {
        self(request, error)
    }
}

/// Client disconnects are logged at INFO and get no response; everything
/// else is logged at ERROR and answered with `502 Bad Gateway`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle(&self, request: &request::Parts, error: &ForwardError) -> Option<Response> {
        let request_id = request_id(&request.headers);
        if error.is_client_canceled() {
            tracing::info!(
                request_id = %request_id,
                method = %request.method,
                path = %request.uri.path(),
                "Client disconnected before backend responded"
            );
            return None;
        }

        tracing::error!(
            request_id = %request_id,
            method = %request.method,
            path = %request.uri.path(),
            error = %error,
            "Proxy error"
        );
        Some(error_response(StatusCode::BAD_GATEWAY, "Proxy error"))
    }
}

/// Forwards ordinary requests to one backend target.
#[derive(Clone)]
pub struct Forwarder {
    target: Arc<BackendTarget>,
    client: HttpClient,
    response_timeout: Duration,
    error_handler: Arc<dyn ErrorHandler>,
}

impl Forwarder {
    /// Create a forwarder with the default error policy.
    pub fn new(target: Arc<BackendTarget>, connect_timeout: Duration, response_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            target,
            client,
            response_timeout,
            error_handler: Arc::new(DefaultErrorHandler),
        }
    }

    /// Replace the error callback.
    pub fn with_error_handler(mut self, handler: impl ErrorHandler) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Forward `request` and return the backend's response, or the error
    /// handler's response if forwarding failed.
    pub async fn forward(&self, request: Request<Body>, client_addr: Option<SocketAddr>) -> Response {
        let snapshot = snapshot(&request);
        let mut in_flight = InFlight::new(request_id(&snapshot.headers).to_string());

        let result = self.try_forward(request, client_addr).await;
        in_flight.finish();

        match result {
            Ok(response) => response,
            Err(error) => {
                metrics::counter!("proxy_upstream_errors_total", "kind" => error.kind()).increment(1);
                self.error_handler
                    .handle(&snapshot, &error)
                    .unwrap_or_else(client_gone)
            }
        }
    }

    async fn try_forward(
        &self,
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response, ForwardError> {
        let outbound = self.prepare(request, client_addr)?;
        let response = with_timeout("backend response", self.response_timeout, self.client.request(outbound))
            .await??;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    /// Rewrite an inbound request for the backend.
    pub fn prepare(
        &self,
        request: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Request<Body>, ForwardError> {
        let (parts, body) = request.into_parts();
        let authority = self.target.authority();

        let uri = Uri::builder()
            .scheme("http")
            .authority(authority.as_str())
            .path_and_query(
                self.target
                    .rewrite_path_and_query(parts.uri.path(), parts.uri.query()),
            )
            .build()?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.insert(
            header::HOST,
            HeaderValue::from_str(&authority).map_err(axum::http::Error::from)?,
        );

        if let Some(addr) = client_addr {
            let ip = addr.ip().to_string();
            let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
                _ => ip,
            };
            headers.insert(
                X_FORWARDED_FOR,
                HeaderValue::from_str(&forwarded_for).map_err(axum::http::Error::from)?,
            );
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

        let mut outbound = Request::new(body);
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = uri;
        *outbound.version_mut() = Version::HTTP_11;
        *outbound.headers_mut() = headers;
        Ok(outbound)
    }
}

/// Copy of the parts of a request the error handler may inspect.
fn snapshot(request: &Request<Body>) -> request::Parts {
    let (mut parts, ()) = Request::new(()).into_parts();
    parts.method = request.method().clone();
    parts.uri = request.uri().clone();
    parts.version = request.version();
    parts.headers = request.headers().clone();
    parts
}

/// Placeholder for a response nobody will read (nginx's 499 convention).
fn client_gone() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST);
    response
}

/// Logs a client disconnect if the forwarding future is dropped mid-flight,
/// which is how hyper surfaces a client that hangs up before the backend
/// answers.
struct InFlight {
    request_id: String,
    armed: bool,
}

impl InFlight {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            armed: true,
        }
    }

    fn finish(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            tracing::info!(request_id = %self.request_id, "Client disconnected before backend responded");
            metrics::counter!("proxy_upstream_errors_total", "kind" => "client_canceled").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(url: &str) -> Forwarder {
        let target = Arc::new(BackendTarget::parse(url).unwrap());
        Forwarder::new(target, Duration::from_secs(1), Duration::from_secs(1))
    }

    fn parts() -> request::Parts {
        Request::get("/x").body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn prepare_rewrites_target_and_host() {
        let forwarder = forwarder("http://127.0.0.1:3000/api");
        let request = Request::post("/users?page=2")
            .header("host", "proxy.example.com")
            .header("connection", "keep-alive")
            .header("keep-alive", "timeout=5")
            .header("x-forwarded-for", "10.0.0.1")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let client: SocketAddr = "192.0.2.7:5555".parse().unwrap();
        let outbound = forwarder.prepare(request, Some(client)).unwrap();

        assert_eq!(outbound.method(), "POST");
        assert_eq!(outbound.uri().to_string(), "http://127.0.0.1:3000/api/users?page=2");
        assert_eq!(outbound.headers()[header::HOST], "127.0.0.1:3000");
        assert_eq!(outbound.headers()[X_FORWARDED_FOR], "10.0.0.1, 192.0.2.7");
        assert_eq!(outbound.headers()[X_FORWARDED_PROTO], "https");
        assert_eq!(outbound.headers()[header::CONTENT_TYPE], "application/json");
        assert!(outbound.headers().get(header::CONNECTION).is_none());
        assert!(outbound.headers().get("keep-alive").is_none());
        assert_eq!(outbound.version(), Version::HTTP_11);
    }

    #[test]
    fn default_handler_answers_502() {
        let error = ForwardError::Timeout(Elapsed {
            operation: "backend response",
            after: Duration::from_secs(1),
        });
        let response = DefaultErrorHandler.handle(&parts(), &error).unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn default_handler_is_silent_on_client_cancel() {
        assert!(DefaultErrorHandler
            .handle(&parts(), &ForwardError::ClientCanceled)
            .is_none());
    }

    #[test]
    fn body_errors_count_as_client_side() {
        let err = axum::Error::new(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(caused_by_client(&err));

        let unrelated = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(!caused_by_client(&unrelated));
    }

    #[tokio::test]
    async fn unreachable_backend_yields_502() {
        // Port 1 on loopback is never listening in test environments.
        let forwarder = forwarder("http://127.0.0.1:1");
        let response = forwarder
            .forward(Request::get("/").body(Body::empty()).unwrap(), None)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Proxy error\n");
    }

    #[tokio::test]
    async fn custom_handler_sees_error_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let forwarder = forwarder("http://127.0.0.1:1").with_error_handler(
            move |parts: &request::Parts, error: &ForwardError| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(parts.uri.path(), "/probe");
                assert!(!error.is_client_canceled());
                Some(error_response(StatusCode::SERVICE_UNAVAILABLE, "custom"))
            },
        );

        let response = forwarder
            .forward(Request::get("/probe").body(Body::empty()).unwrap(), None)
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_forward_never_reaches_error_handler() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::AsyncReadExt;

        // Accepts and reads, never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let seen_tx = seen_tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = seen_tx.send(());
                    let _ = socket.read_to_end(&mut Vec::new()).await;
                });
            }
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let target = Arc::new(BackendTarget::parse(&format!("http://{}", backend)).unwrap());
        let forwarder = Forwarder::new(target, Duration::from_secs(1), Duration::from_secs(30))
            .with_error_handler(move |_: &request::Parts, _: &ForwardError| {
                counted.fetch_add(1, Ordering::SeqCst);
                None::<Response>
            });

        let pending = forwarder.forward(Request::get("/slow").body(Body::empty()).unwrap(), None);
        let client = async {
            seen_rx.recv().await.unwrap();
        };
        // The client hangs up once the backend has the request.
        tokio::select! {
            _ = pending => panic!("backend never answers"),
            _ = client => {}
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
