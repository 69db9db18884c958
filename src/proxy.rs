use crate::error::{json_error_response, AppError, ProxyErrorCode};
use crate::registry::Registry;
use crate::resolver;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// HTTP front that routes each request to the application named by its host
pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        async move { handle_request(req, registry, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    registry: Arc<Registry>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    // Overwrite rather than append: this proxy is the first hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(value) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let name = resolver::application_name_for(&host, registry.settings());
    debug!(host, app = %name, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let connection = match connect(&registry, &name).await {
        Ok(connection) => connection,
        Err(e) => {
            error!(host, app = %name, error = %e, "Failed to reach application");
            let message = match &e {
                AppError::NoSuchApplication { .. } => format!("No application configured for {}", host),
                other => other.to_string(),
            };
            return Ok(json_error_response(e.code(), message));
        }
    };
    let worker = connection.worker_number();

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(connection)).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(app = %name, error = %e, "HTTP handshake with application failed");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to application",
            ));
        }
    };

    // The connection owns the worker checkout; it is released when this task ends
    let app_name = name.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(app = %app_name, error = %e, "Application connection closed with error");
        }
    });

    match sender.send_request(req).await {
        Ok(response) => {
            debug!(app = %name, ?worker, status = %response.status(), request_id, "Forwarded request");
            Ok(response.map(|body| body.boxed()))
        }
        Err(e) => {
            warn!(app = %name, ?worker, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to forward request to application",
            ))
        }
    }
}

async fn connect(registry: &Registry, name: &str) -> Result<crate::app::Connection, AppError> {
    let app = registry.get(name).await?;
    app.acquire_connection().await
}

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Host header value with the port kept, or `None` if absent or malformed
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let value = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())?
        .trim();

    let hostname = resolver::strip_port(value);
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, dot and the brackets/colons of IPv6 literals
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']'))
    {
        return None;
    }

    Some(value.to_ascii_lowercase())
}
