//! CONNECT handling.
//!
//! Per request: ACL check, dial (IPv4 first, one dual-stack retry on a
//! resolution failure), then `200 Connection Established` and an opaque
//! byte splice until either side closes, errors, idles out, or is
//! force-closed by the registry. TLS is never terminated here.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::copy_bidirectional_with_sizes;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityIo};
use crate::dial::dial_with_fallback;
use crate::registry::{ConnectionRole, TrackedConnection};
use crate::server::{close_after, empty, text_response, ProxyContext, ProxyShared};

/// Port assumed when a CONNECT target has none, or an unparsable one
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Per-direction relay buffer
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// `host:port` from a CONNECT request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Parse `host:port`, `[v6]:port`, or a bare host
    pub fn parse(authority: &str) -> Option<Self> {
        let authority = authority.trim();

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest.split_once(']')?;
            (host, after.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return None;
        }

        Some(Self {
            host: host.to_string(),
            port: port
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(DEFAULT_CONNECT_PORT),
        })
    }
}

/// Answer a CONNECT request and, on success, spawn the tunnel
pub async fn handle_connect(
    req: Request<Incoming>,
    ctx: &ProxyContext,
    shared: &ProxyShared,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if !shared.acl.is_allowed(&ctx.client_ip) {
        warn!(
            "Denied CONNECT {} from {} (peer {})",
            req.uri(),
            ctx.client_ip,
            ctx.peer
        );
        return close_after(text_response(
            StatusCode::FORBIDDEN,
            "Access denied: client IP not allowed",
        ));
    }

    let Some(target) = req
        .uri()
        .authority()
        .and_then(|authority| ConnectTarget::parse(authority.as_str()))
    else {
        warn!("CONNECT target is not host:port: {:?}", req.uri());
        return close_after(text_response(
            StatusCode::BAD_REQUEST,
            "CONNECT must be to a socket address",
        ));
    };

    if shared.registry.is_closing() {
        return close_after(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Proxy is shutting down",
        ));
    }

    let idle_timeout = shared.idle_timeout;
    let server = match tokio::time::timeout(
        idle_timeout,
        dial_with_fallback(&target.host, target.port),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("CONNECT {}:{} failed: {}", target.host, target.port, e);
            return connection_failed();
        }
        Err(_) => {
            warn!(
                "CONNECT {}:{} timed out after {:?}",
                target.host, target.port, idle_timeout
            );
            return connection_failed();
        }
    };

    let Some(server_conn) = shared.registry.track(ConnectionRole::TunnelServer) else {
        return connection_failed();
    };

    info!(
        "Tunnel #{} {} -> {}:{}",
        server_conn.id(),
        ctx.client_ip,
        target.host,
        target.port
    );

    let registry = Arc::clone(&shared.registry);
    tokio::task::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("upgrade error: {}", e);
                return;
            }
        };
        // The HTTP-client record ends with the upgrade; the socket is
        // re-registered under its tunnel role
        let Some(client_conn) = registry.track(ConnectionRole::TunnelClient) else {
            debug!("Tunnel #{} dropped during shutdown", server_conn.id());
            return;
        };
        if let Err(e) = tunnel(upgraded, server, client_conn, server_conn, idle_timeout).await {
            debug!("Tunnel to {}:{} ended with error: {}", target.host, target.port, e);
        }
    });

    let mut resp = Response::new(empty());
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    resp
}

/// `500 Connection Failed`, then close the client
fn connection_failed() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp.extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Failed"));
    close_after(resp)
}

/// Splice the upgraded client connection with the origin socket
///
/// Bytes the client sent right after the CONNECT head are still buffered in
/// `upgraded` and come out of its first reads, so they reach the origin first.
/// The relay is raced against the idle bound and both force-close handles, so
/// a direction stuck on a full socket buffer cannot keep the tunnel alive.
async fn tunnel(
    upgraded: Upgraded,
    server: TcpStream,
    client_conn: TrackedConnection,
    server_conn: TrackedConnection,
    idle_timeout: Duration,
) -> io::Result<()> {
    let conn_id = server_conn.id().to_string();
    let activity = Activity::new();
    let mut client = ActivityIo::new(TokioIo::new(upgraded), activity.clone());
    let mut server = ActivityIo::new(server, activity.clone());

    tokio::select! {
        res = copy_bidirectional_with_sizes(
            &mut client,
            &mut server,
            RELAY_BUFFER_SIZE,
            RELAY_BUFFER_SIZE,
        ) => {
            let (up, down) = res?;
            debug!(
                "Tunnel #{} closed: {} bytes up, {} bytes down",
                conn_id, up, down
            );
        }
        _ = activity.idle_for(idle_timeout) => {
            warn!("Tunnel #{} idle for {:?}, closing", conn_id, idle_timeout);
        }
        _ = client_conn.closed() => {
            debug!("Tunnel #{} client side force-closed", conn_id);
        }
        _ = server_conn.closed() => {
            debug!("Tunnel #{} server side force-closed", conn_id);
        }
    }

    Ok(())
}
