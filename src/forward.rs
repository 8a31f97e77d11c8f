use bytes::Bytes;
use http::uri::{Parts, PathAndQuery};
use http::{HeaderMap, HeaderValue, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder;
use hyper::header::HOST;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityIo};
use crate::dial::dial_with_fallback;
use crate::error::{ProxyError, ProxyResult};
use crate::registry::ConnectionRole;
use crate::server::{text_response, ProxyContext, ProxyShared};

/// Port assumed when an absolute-form target has none
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Request headers that only concern the client-to-proxy hop
pub const STRIPPED_REQUEST_HEADERS: [&str; 3] = ["proxy-connection", "connection", "keep-alive"];

/// Response headers that must not be relayed back to the client
pub const HOP_BY_HOP_RESPONSE_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Origin a plain HTTP request is relayed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub host: String,
    pub port: u16,
    /// Value for the outbound `Host` header
    pub authority: String,
    pub path: PathAndQuery,
}

impl HttpTarget {
    /// Parse an absolute-form request target such as `http://example.com:8080/a?b`
    pub fn from_uri(uri: &Uri) -> ProxyResult<Self> {
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::InvalidTarget(format!("missing host in {}", uri)))?;

        let authority = match uri.port_u16() {
            Some(port) if port != DEFAULT_HTTP_PORT => format!("{}:{}", host, port),
            _ => host.to_string(),
        };

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT),
            authority,
            path: uri
                .path_and_query()
                .cloned()
                .unwrap_or_else(|| PathAndQuery::from_static("/")),
        })
    }
}

/// Relay one non-CONNECT request to its origin
pub async fn handle_http(
    req: Request<Incoming>,
    ctx: &ProxyContext,
    shared: &ProxyShared,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if !shared.acl.is_allowed(&ctx.client_ip) {
        warn!(
            "Denied {} {} from {} (peer {})",
            req.method(),
            req.uri(),
            ctx.client_ip,
            ctx.peer
        );
        return text_response(StatusCode::FORBIDDEN, "Access denied: client IP not allowed");
    }

    let target = match HttpTarget::from_uri(req.uri()) {
        Ok(target) => target,
        Err(e) => {
            warn!("Rejecting request from {}: {}", ctx.client_ip, e);
            return text_response(StatusCode::BAD_REQUEST, "HTTP request missing host");
        }
    };

    debug!(
        "{} {}:{}{} for {}",
        req.method(),
        target.host,
        target.port,
        target.path,
        ctx.client_ip
    );

    let outbound = match build_outbound_request(req, &target) {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!("Could not build outbound request: {}", e);
            return text_response(StatusCode::BAD_REQUEST, "Invalid request target");
        }
    };

    match exchange(outbound, &target, shared).await {
        Ok(resp) => {
            let (mut parts, body) = resp.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Response::from_parts(parts, body.boxed())
        }
        Err(ProxyError::Timeout(after)) => {
            warn!(
                "Request to {}:{} timed out after {:?}",
                target.host, target.port, after
            );
            text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
        }
        Err(e) if e.is_resolution() => {
            warn!("Fallback dial to {} failed: {}", target.authority, e);
            text_response(StatusCode::BAD_GATEWAY, format!("Proxy error: {}", e))
        }
        Err(ProxyError::ShuttingDown) => {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "Proxy is shutting down")
        }
        Err(e) => {
            warn!("Request to {} failed: {}", target.authority, e);
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Proxy error: {}", e),
            )
        }
    }
}

/// Rewrite the client's request for the origin: origin-form URI, `Host` set to
/// the target authority, proxy-hop headers removed, body passed through as-is
fn build_outbound_request(
    req: Request<Incoming>,
    target: &HttpTarget,
) -> Result<Request<Incoming>, http::Error> {
    let (mut parts, body) = req.into_parts();

    let mut uri_parts = Parts::default();
    uri_parts.path_and_query = Some(target.path.clone());
    parts.uri = Uri::from_parts(uri_parts)?;
    parts.version = http::Version::HTTP_11;

    for name in STRIPPED_REQUEST_HEADERS {
        parts.headers.remove(name);
    }
    parts
        .headers
        .insert(HOST, HeaderValue::from_str(&target.authority)?);

    Ok(Request::from_parts(parts, body))
}

/// Dial, hand the request to a fresh HTTP/1.1 client connection and wait for
/// the response head
///
/// The origin socket is dropped once it has moved no bytes for the idle
/// bound, before or after the head arrives.
async fn exchange(
    outbound: Request<Incoming>,
    target: &HttpTarget,
    shared: &ProxyShared,
) -> ProxyResult<Response<Incoming>> {
    let idle_timeout = shared.idle_timeout;

    let upstream = shared
        .registry
        .track(ConnectionRole::HttpServer)
        .ok_or(ProxyError::ShuttingDown)?;

    let stream = timeout(idle_timeout, dial_with_fallback(&target.host, target.port))
        .await
        .map_err(|_| ProxyError::Timeout(idle_timeout))??;

    let activity = Activity::new();
    let (mut sender, conn) = Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(ActivityIo::new(stream, activity.clone())))
        .await?;

    let conn_id = upstream.id().to_string();
    let driver_activity = activity.clone();
    // The driver owns the origin socket until the response body is done
    let driver = tokio::spawn(async move {
        tokio::select! {
            res = conn => {
                if let Err(err) = res {
                    debug!("HTTP #{} origin connection error: {}", upstream.id(), err);
                }
            }
            _ = upstream.closed() => {
                info!("HTTP #{} force-closed", upstream.id());
            }
            _ = driver_activity.idle_for(idle_timeout) => {
                warn!("HTTP #{} idle for {:?}, closing", upstream.id(), idle_timeout);
            }
        }
    });

    tokio::select! {
        res = sender.send_request(outbound) => match res {
            Ok(resp) => Ok(resp),
            Err(e) => {
                driver.abort();
                if activity.is_idle(idle_timeout) {
                    return Err(ProxyError::Timeout(idle_timeout));
                }
                debug!("HTTP #{} request failed: {}", conn_id, e);
                Err(e.into())
            }
        },
        _ = activity.idle_for(idle_timeout) => {
            driver.abort();
            Err(ProxyError::Timeout(idle_timeout))
        }
    }
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_RESPONSE_HEADERS {
        headers.remove(name);
    }
}
