use http::StatusCode;
use thiserror::Error;

/// A `Result` typedef to use with the [`ProxyError`] type.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// The error surface of the proxy.
///
/// Each kind maps to the HTTP status it is surfaced with when it reaches a
/// client; errors on an in-flight cached object are recorded on the object
/// and dispatched to every waiter through its condition.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The client request could not be parsed.
    #[error("bad request: {0}")]
    BadRequest(&'static str),
    /// Proxy authentication is configured and the request failed it.
    #[error("proxy authentication required")]
    AuthRequired,
    /// The request method is not one the proxy implements.
    #[error("method not implemented")]
    MethodNotImplemented,
    /// The URL policy hook denied the request.
    #[error("forbidden")]
    Forbidden,
    /// The request carried an Expect directive other than 100-continue.
    #[error("expectation failed")]
    ExpectationFailed,
    /// The requested byte range cannot be satisfied by the object.
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,
    /// An If-Match or If-Unmodified-Since precondition failed.
    #[error("precondition failed")]
    PreconditionFailed,
    /// A client conditional matched; the response is 304 with no body.
    #[error("not modified")]
    NotModified,
    /// DNS resolution or the upstream connect failed.
    #[error("couldn't connect to upstream: {0}")]
    UpstreamConnectFail(String),
    /// The upstream response violated HTTP framing.
    #[error("upstream protocol error: {0}")]
    UpstreamProtoError(&'static str),
    /// The proxy is offline and the object is not cached.
    #[error("disconnected operation and object not in cache")]
    DisconnectedNoCache,
    /// The request said only-if-cached and the object is not cached.
    #[error("object not in cache")]
    ObjectNotInCache,
    /// Chunk memory is exhausted and eviction could not reclaim any.
    #[error("out of chunk memory")]
    AllocFail,
    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    InternalInvariant(&'static str),
    /// An I/O error on a client, server, or disk file descriptor.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// The HTTP status this error is surfaced with.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::AuthRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::MethodNotImplemented => StatusCode::NOT_IMPLEMENTED,
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::ExpectationFailed => StatusCode::EXPECTATION_FAILED,
            ProxyError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ProxyError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ProxyError::NotModified => StatusCode::NOT_MODIFIED,
            ProxyError::UpstreamConnectFail(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamProtoError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::DisconnectedNoCache => StatusCode::BAD_GATEWAY,
            ProxyError::ObjectNotInCache => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::AllocFail => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::InternalInvariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Io(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ProxyError::BadRequest("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::AuthRequired.status().as_u16(), 407);
        assert_eq!(
            ProxyError::UpstreamConnectFail("refused".into()).status().as_u16(),
            504
        );
        assert_eq!(ProxyError::UpstreamProtoError("framing").status().as_u16(), 502);
        assert_eq!(ProxyError::ObjectNotInCache.status().as_u16(), 504);
        assert_eq!(ProxyError::AllocFail.status().as_u16(), 503);
    }
}
