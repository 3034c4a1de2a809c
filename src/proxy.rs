//! HTTP-mode forwarding.
//!
//! This module implements the HTTP proxy front-end on `hyper`. It handles:
//! - HTTP CONNECT tunneling: dial the routed address, answer 200, take over
//!   the client connection and splice bytes in both directions
//! - Plain requests: point the request URI at the routed address and replay
//!   it through an outbound HTTP client, copying the response back verbatim
//!
//! Every failure is answered on the request that caused it; none of them
//! stop the listener.

use crate::addr::{Command, DestinationSpec, RequestMeta, ResolvedAddr};
use crate::error::{ProxyError, Result};
use crate::pipeline::Pipeline;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, HOST};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

/// Response body type produced by the forwarder.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// HTTP proxy front-end.
#[derive(Clone)]
pub struct ConnectionForwarder {
    pipeline: Pipeline,
    client: Client<HttpConnector, Incoming>,
    connect_timeout: Duration,
}

impl ConnectionForwarder {
    /// Creates a forwarder. `connect_timeout` bounds both the CONNECT dial
    /// and the outbound client's connection setup.
    pub fn new(pipeline: Pipeline, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            pipeline,
            client,
            connect_timeout,
        }
    }

    /// Accepts connections forever, one task per connection.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = accept_retrying(|| listener.accept()).await;
            trace!(peer = %peer_addr, "Accepted HTTP connection");

            let forwarder = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let forwarder = forwarder.clone();
                    async move { Ok::<_, Infallible>(forwarder.handle(req).await) }
                });

                if let Err(e) = http1::Builder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!(peer = %peer_addr, error = %e, "HTTP connection ended with error");
                }
            });
        }
    }

    /// Handles a single proxy request.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let is_connect = req.method() == Method::CONNECT;

        let Some((host, port)) = request_target(&req) else {
            warn!(method = %req.method(), uri = %req.uri(), "Request without target host");
            return error_response(StatusCode::BAD_REQUEST, "missing target host");
        };

        // The outbound client speaks plain HTTP only; TLS origins go through CONNECT.
        if !is_connect && req.uri().scheme() == Some(&Scheme::HTTPS) {
            warn!(uri = %req.uri(), "Plain request with https scheme");
            return error_response(
                StatusCode::BAD_REQUEST,
                "https requests must be tunneled with CONNECT",
            );
        }

        let command = if is_connect {
            Command::Connect
        } else {
            Command::Http(req.method().clone())
        };
        let request = RequestMeta::new(command, DestinationSpec::from_host(&host, port));

        let routed = match self.pipeline.route(&request).await {
            Ok(routed) => routed,
            Err(e) => {
                warn!(host = %host, error = %e, "Resolution failed");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
            }
        };

        if is_connect {
            self.tunnel(req, routed).await
        } else {
            self.relay(req, routed).await
        }
    }

    /// Establishes a CONNECT tunnel to `routed`.
    async fn tunnel(&self, mut req: Request<Incoming>, routed: ResolvedAddr) -> Response<ProxyBody> {
        let target = routed.addr;

        let upstream = match dial(target, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target = %target, error = %e, "Tunnel dial failed");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
            }
        };

        let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
            error!(target = %target, "Connection does not support upgrades");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Hijacking not supported");
        };

        info!(requested = %routed, target = %target, "Tunnel established");

        tokio::spawn(async move {
            let client = match on_upgrade.await {
                Ok(upgraded) => TokioIo::new(upgraded),
                Err(e) => {
                    let e = ProxyError::Upgrade {
                        message: e.to_string(),
                    };
                    warn!(target = %target, error = %e, "Tunnel aborted");
                    return;
                }
            };

            let (uplink, downlink) = splice(client, upstream).await;
            debug!(
                target = %target,
                uplink = ?uplink,
                downlink = ?downlink,
                "Tunnel closed"
            );
        });

        Response::new(empty())
    }

    /// Replays a plain request against `routed` and returns the origin's
    /// response unchanged.
    async fn relay(&self, req: Request<Incoming>, routed: ResolvedAddr) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        parts.uri = match retarget_uri(&parts.uri, routed.addr) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(uri = %parts.uri, error = %e, "Cannot rewrite request URI");
                return error_response(StatusCode::BAD_REQUEST, e.to_string());
            }
        };
        trace!(method = %parts.method, uri = %parts.uri, "Sending upstream request");

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                trace!(status = %response.status(), target = %routed.addr, "Received upstream response");
                response.map(|body| body.boxed())
            }
            Err(e) => {
                let e = ProxyError::Transport {
                    message: e.to_string(),
                };
                warn!(target = %routed.addr, error = %e, "Upstream request failed");
                error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        }
    }
}

/// Extracts the target host and port of a proxy request.
///
/// Absolute-form and authority-form URIs carry the target; origin-form
/// requests fall back to the `Host` header.
fn request_target<B>(req: &Request<B>) -> Option<(String, u16)> {
    let uri = req.uri();
    let default_port = if req.method() == Method::CONNECT || uri.scheme() == Some(&Scheme::HTTPS) {
        443
    } else {
        80
    };

    if let Some(host) = uri.host() {
        return Some((host.to_string(), uri.port_u16().unwrap_or(default_port)));
    }

    let authority: Authority = req.headers().get(HOST)?.to_str().ok()?.parse().ok()?;
    Some((
        authority.host().to_string(),
        authority.port_u16().unwrap_or(default_port),
    ))
}

/// Points a request URI at `addr`, preserving scheme, path and query.
fn retarget_uri(uri: &Uri, addr: SocketAddr) -> Result<Uri> {
    let mut parts = uri.clone().into_parts();
    if parts.scheme.is_none() {
        parts.scheme = Some(Scheme::HTTP);
    }
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    parts.authority = Some(
        addr.to_string()
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::Transport {
                message: e.to_string(),
            })?,
    );

    Uri::from_parts(parts).map_err(|e| ProxyError::Transport {
        message: e.to_string(),
    })
}

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Runs `accept` until it yields a connection.
///
/// Accept failures (descriptor exhaustion, aborted handshakes) only concern
/// the connection being accepted, so they are logged and retried after a
/// short pause instead of ending the listener.
pub async fn accept_retrying<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Opens a TCP connection with a bounded connect time.
pub async fn dial(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let result = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")));

    result.map_err(|source| ProxyError::Dial {
        addr: addr.to_string(),
        source,
    })
}

/// Relays bytes between `client` and `upstream` until both directions end.
///
/// Each direction runs as its own task: it copies until end-of-stream or an
/// error on its read side, then shuts down the write side it was copying
/// into. The directions are independent, so one finishing leaves the other
/// running (half-close).
///
/// Returns the byte counts (or errors) for client→upstream and
/// upstream→client.
pub async fn splice<C, U>(client: C, upstream: U) -> (io::Result<u64>, io::Result<u64>)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let uplink = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    });
    let downlink = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    });

    let (up, down) = tokio::join!(uplink, downlink);
    (joined(up), joined(down))
}

fn joined(
    result: std::result::Result<io::Result<u64>, tokio::task::JoinError>,
) -> io::Result<u64> {
    result.unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Interrupted, e.to_string())))
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut body = message.into();
    body.push('\n');

    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn request(method: Method, uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_request_target() {
        let req = request(Method::CONNECT, "example.com:8443", None);
        assert_eq!(request_target(&req), Some(("example.com".to_string(), 8443)));

        let req = request(Method::GET, "http://example.com/index.html", None);
        assert_eq!(request_target(&req), Some(("example.com".to_string(), 80)));

        let req = request(Method::GET, "https://example.com/", None);
        assert_eq!(request_target(&req), Some(("example.com".to_string(), 443)));

        let req = request(Method::GET, "http://[::1]:8080/", None);
        assert_eq!(request_target(&req), Some(("[::1]".to_string(), 8080)));

        let req = request(Method::GET, "/path", Some("origin.test:81"));
        assert_eq!(request_target(&req), Some(("origin.test".to_string(), 81)));

        let req = request(Method::GET, "/path", None);
        assert_eq!(request_target(&req), None);
    }

    #[test]
    fn test_retarget_uri() {
        let uri: Uri = "http://example.com/a/b?q=1".parse().unwrap();
        let out = retarget_uri(&uri, "10.0.0.1:8080".parse().unwrap()).unwrap();
        assert_eq!(out.to_string(), "http://10.0.0.1:8080/a/b?q=1");

        let uri: Uri = "/only/path".parse().unwrap();
        let out = retarget_uri(&uri, "[::1]:80".parse().unwrap()).unwrap();
        assert_eq!(out.to_string(), "http://[::1]:80/only/path");
    }

    #[test]
    fn test_error_response() {
        let resp = error_response(StatusCode::SERVICE_UNAVAILABLE, "no route");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_accept_retries_after_errors() {
        let mut failures = vec![
            io::Error::new(io::ErrorKind::ConnectionAborted, "aborted"),
            io::Error::from_raw_os_error(24),
        ];
        let mut calls = 0;

        let accepted = accept_retrying(|| {
            calls += 1;
            let next = failures.pop();
            async move {
                match next {
                    Some(e) => Err(e),
                    None => Ok("connection"),
                }
            }
        })
        .await;

        assert_eq!(accepted, "connection");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = dial(addr, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProxyError::Dial { .. })));
    }

    #[tokio::test]
    async fn test_splice_half_close_keeps_other_direction() {
        let (mut client, client_far) = tokio::io::duplex(1024);
        let (mut server, server_far) = tokio::io::duplex(1024);
        let relay = tokio::spawn(splice(client_far, server_far));

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");

        // The client finished sending, but can still receive.
        server.write_all(b"pong!").await.unwrap();
        server.shutdown().await.unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong!");

        let (uplink, downlink) = relay.await.unwrap();
        assert_eq!(uplink.unwrap(), 4);
        assert_eq!(downlink.unwrap(), 5);
    }
}
