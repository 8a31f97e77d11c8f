use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use http::StatusCode;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::acl::{client_ip, AccessControlList};
use crate::forward::handle_http;
use crate::registry::{ConnectionRegistry, ConnectionRole};
use crate::shutdown::ShutdownState;
use crate::tunnel::handle_connect;

/// State shared by every connection handler
pub struct ProxyShared {
    pub acl: AccessControlList,
    pub registry: Arc<ConnectionRegistry>,
    /// Inactivity bound for outbound exchanges and tunnels
    pub idle_timeout: Duration,
}

/// Per-request facts used by both handlers
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub peer: SocketAddr,
    /// Address the ACL is evaluated against
    pub client_ip: String,
}

/// Accept connections until shutdown begins
///
/// Returning drops the listener; connections already accepted keep running.
pub async fn serve(
    listener: TcpListener,
    shared: Arc<ProxyShared>,
    shutdown: Arc<ShutdownState>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.accepting_stopped() => {
                info!("Listener closed, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    tokio::task::spawn(serve_connection(stream, peer, shared));
                }
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<ProxyShared>) {
    let Some(client) = shared.registry.track(ConnectionRole::HttpClient) else {
        debug!("Dropping connection from {} during shutdown", peer);
        return;
    };

    let io = TokioIo::new(stream);
    let service_shared = Arc::clone(&shared);
    let service = service_fn(move |req| proxy(req, peer, Arc::clone(&service_shared)));

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades();

    tokio::select! {
        res = conn => {
            if let Err(err) = res {
                // Clients hanging up mid-request are routine
                if !err.is_incomplete_message() {
                    warn!("Connection from {} error: {}", peer, err);
                }
            }
        }
        _ = client.closed() => {
            debug!("{} #{} from {} force-closed", client.role(), client.id(), peer);
        }
    }
}

/// Route one request by method
pub async fn proxy(
    req: Request<Incoming>,
    peer: SocketAddr,
    shared: Arc<ProxyShared>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    let ctx = ProxyContext {
        peer,
        client_ip: client_ip(req.headers(), peer),
    };

    if Method::CONNECT == req.method() {
        Ok(handle_connect(req, &ctx, &shared).await)
    } else {
        Ok(handle_http(req, &ctx, &shared).await)
    }
}

pub fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response generated by the proxy itself
pub fn text_response<T: Into<Bytes>>(
    status: StatusCode,
    msg: T,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(msg));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Ask hyper to close the client connection after this response
pub fn close_after(
    mut resp: Response<BoxBody<Bytes, hyper::Error>>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    resp.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    resp
}
