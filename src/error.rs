//! Error taxonomy for application resolution and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors surfaced by the registry and applications.
///
/// None of these are fatal to the proxy itself: the registry and the
/// application objects stay usable for the next request.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Name does not resolve to a usable entry under the host root
    #[error("no such application: {name}")]
    NoSuchApplication { name: String },

    /// Worker did not become ready (timeout or process exited early)
    #[error("can't start application {name}: {reason}")]
    CantStartApplication { name: String, reason: String },

    /// Nothing accepted the connection on a forwarded port
    #[error("port forwarding to {name} on localhost:{port} failed: {source}")]
    PortForwardingConnectionError {
        name: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AppError {
    pub(crate) fn no_such_app(name: &str) -> Self {
        AppError::NoSuchApplication {
            name: name.to_string(),
        }
    }

    pub(crate) fn cant_start(name: &str, reason: impl Into<String>) -> Self {
        AppError::CantStartApplication {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Io {
            context: context.into(),
            source,
        }
    }

    /// Error code used when rendering this error to a client
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            AppError::NoSuchApplication { .. } => ProxyErrorCode::NoSuchApplication,
            AppError::CantStartApplication { .. } => ProxyErrorCode::CantStartApplication,
            AppError::PortForwardingConnectionError { .. } => {
                ProxyErrorCode::PortForwardingConnectionError
            }
            AppError::Io { .. } => ProxyErrorCode::InternalError,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Host resolved to an application that does not exist
    NoSuchApplication,
    /// Application worker failed to start
    CantStartApplication,
    /// Forwarded port refused or reset the connection
    PortForwardingConnectionError,
    /// Failed to talk HTTP to the application
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoSuchApplication => StatusCode::NOT_FOUND,
            ProxyErrorCode::CantStartApplication => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::PortForwardingConnectionError => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::NoSuchApplication => "NO_SUCH_APPLICATION",
            ProxyErrorCode::CantStartApplication => "CANT_START_APPLICATION",
            ProxyErrorCode::PortForwardingConnectionError => "PORT_FORWARDING_CONNECTION_ERROR",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
