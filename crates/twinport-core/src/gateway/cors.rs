//! Cross-origin policy applied in front of every gateway route.
//!
//! The policy echoes whatever `Origin` the request carries and answers
//! preflight requests itself. It grants every origin access and is only safe
//! for development or for deployments where no untrusted origin can reach the
//! gateway. It is not a security boundary.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_REQUEST_METHOD, ORIGIN,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

/// Headers a preflight is told it may send.
pub const ALLOWED_HEADERS: &str = "Content-Type,Accept";

/// Methods a preflight is told it may use.
pub const ALLOWED_METHODS: &str = "GET,HEAD,POST,PUT,DELETE";

/// Outcome of evaluating the policy for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsDecision {
    /// Pass the request on; add `headers` to whatever response comes back.
    Forward { headers: HeaderMap },
    /// Answer with 200 and an empty body carrying `headers`.
    Preflight { headers: HeaderMap },
}

impl CorsDecision {
    pub fn headers(&self) -> &HeaderMap {
        match self {
            CorsDecision::Forward { headers } | CorsDecision::Preflight { headers } => headers,
        }
    }

    pub fn is_preflight(&self) -> bool {
        matches!(self, CorsDecision::Preflight { .. })
    }
}

/// Decide how to treat a request given its method and headers.
pub fn evaluate(method: &Method, request_headers: &HeaderMap) -> CorsDecision {
    let mut headers = HeaderMap::new();

    // An empty header counts as absent.
    let Some(origin) = request_headers.get(ORIGIN).filter(|v| !v.is_empty()) else {
        return CorsDecision::Forward { headers };
    };
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());

    let requests_method = request_headers
        .get(ACCESS_CONTROL_REQUEST_METHOD)
        .is_some_and(|v| !v.is_empty());
    if method == Method::OPTIONS && requests_method {
        headers.insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        );
        headers.insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        return CorsDecision::Preflight { headers };
    }

    CorsDecision::Forward { headers }
}

/// Middleware form of [`evaluate`], installed with `axum::middleware::from_fn`.
pub async fn allow_cors(request: Request, next: Next) -> Response {
    match evaluate(request.method(), request.headers()) {
        CorsDecision::Preflight { headers } => {
            info!("preflight request for {}", request.uri().path());
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::OK;
            response.headers_mut().extend(headers);
            response
        }
        CorsDecision::Forward { headers } => {
            let mut response = next.run(request).await;
            response.headers_mut().extend(headers);
            response
        }
    }
}
