use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use std::convert::Infallible;
use std::net::SocketAddr;

/// Caller identity used as the rate-limit key: the first `X-Forwarded-For`
/// hop, else the peer address, else `"unknown"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return Ok(Self(ip.to_string()));
        }

        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(Self(addr.ip().to_string()));
        }

        Ok(Self("unknown".to_string()))
    }
}

/// `X-Correlation-Id`, used when the body does not carry one.
pub fn correlation_header(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn identify(req: Request<()>) -> String {
        let (mut parts, _) = req.into_parts();
        ClientIdentity::from_request_parts(&mut parts, &()).await.unwrap().0
    }

    #[tokio::test]
    async fn test_first_forwarded_hop_wins() {
        let mut req = Request::builder()
            .header("x-forwarded-for", " 203.0.113.7 , 10.0.0.1")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 9], 4000))));
        assert_eq!(identify(req).await, "203.0.113.7");
    }

    #[tokio::test]
    async fn test_falls_back_to_peer_then_unknown() {
        let mut req = Request::builder().body(()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 9], 4000))));
        assert_eq!(identify(req).await, "10.0.0.9");

        assert_eq!(identify(Request::builder().body(()).unwrap()).await, "unknown");
    }
}
