//! Client identity
//!
//! Authentication happens upstream. The upgrade handler only reads a
//! [`ClientIdentity`] from the request extensions; an embedding application
//! either inserts it in its own middleware or installs an [`IdentityFn`]
//! through `GatewayBuilder::identity`.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Header carrying the authenticated user id when identity headers are trusted
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the authenticated role when identity headers are trusted
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Verified identity of a connecting client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: String,
    /// Upper-cased role
    pub role: String,
}

impl ClientIdentity {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into().to_uppercase(),
        }
    }
}

/// Request context passed to the identity callback
#[derive(Debug, Clone)]
pub struct IdentityRequest {
    /// HTTP method (GET for upgrades)
    pub method: Method,
    /// Full request URI (path + query string)
    pub uri: Uri,
    /// HTTP headers from the request
    pub headers: HeaderMap,
}

impl IdentityRequest {
    /// Get a header value as string
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the Bearer token from Authorization header
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|auth| auth.strip_prefix("Bearer "))
    }

    /// Get a query parameter value by name (no URL decoding)
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.uri.query().and_then(|query| {
            query.split('&').find_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                (key == name).then_some(value)
            })
        })
    }
}

/// Identity callback result: the identity, or the response that denies the request
pub type IdentityResponse = Result<ClientIdentity, Response>;

/// Type alias for the async identity callback
pub type IdentityFn = Arc<
    dyn Fn(IdentityRequest) -> Pin<Box<dyn Future<Output = IdentityResponse> + Send>>
        + Send
        + Sync,
>;

/// Helper to create an identity callback from a closure
pub fn identity_fn<F, Fut>(f: F) -> IdentityFn
where
    F: Fn(IdentityRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = IdentityResponse> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Identity taken from `X-User-Id` / `X-User-Role`.
///
/// Only for deployments behind a proxy that authenticates the request and
/// overwrites these headers.
pub fn trusted_headers() -> IdentityFn {
    identity_fn(|req: IdentityRequest| async move {
        let user_id = req.header(USER_ID_HEADER).filter(|v| !v.is_empty());
        let role = req.header(USER_ROLE_HEADER).unwrap_or_default();
        match user_id {
            Some(user_id) => Ok(ClientIdentity::new(user_id, role)),
            None => Err(deny(StatusCode::UNAUTHORIZED, "missing identity")),
        }
    })
}

/// Middleware running an [`IdentityFn`] and storing the identity in the
/// request extensions
pub async fn resolve_identity(
    State(resolver): State<IdentityFn>,
    mut request: Request,
    next: Next,
) -> Response {
    let identity_request = IdentityRequest {
        method: request.method().clone(),
        uri: request.uri().clone(),
        headers: request.headers().clone(),
    };

    match resolver(identity_request).await {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(response) => {
            tracing::warn!(uri = %request.uri(), "Connection denied by identity check");
            response
        }
    }
}

/// Helper to create a simple error response
pub fn deny(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&'static str, &'static str)], uri: &str) -> IdentityRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, value.parse().unwrap());
        }
        IdentityRequest {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            headers: map,
        }
    }

    #[test]
    fn request_helpers() {
        let req = request(&[("authorization", "Bearer abc")], "/ws?tenant=t1&x=2");
        assert_eq!(req.bearer_token(), Some("abc"));
        assert_eq!(req.query_param("tenant"), Some("t1"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[tokio::test]
    async fn trusted_headers_resolves_identity() {
        let resolver = trusted_headers();
        let identity = resolver(request(&[("x-user-id", "42"), ("x-user-role", "admin")], "/ws"))
            .await
            .ok()
            .expect("identity resolved");
        assert_eq!(identity, ClientIdentity::new("42", "ADMIN"));
    }

    #[tokio::test]
    async fn trusted_headers_denies_without_user() {
        let resolver = trusted_headers();
        let denied = resolver(request(&[], "/ws")).await.unwrap_err();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    }
}
