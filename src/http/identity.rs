//! Identifying the caller of an inbound request.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Identifier used when nothing identifies the caller.
const ANONYMOUS: &str = "anonymous";

/// The verified caller, inserted as a request extension by an upstream
/// authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
    /// Subscription tier, used for tiered limits
    pub tier: Option<String>,
}

impl AuthenticatedUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: None,
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }
}

/// Extracts an identifier from a request.
pub type IdentifierFn = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// Which attribute of a request is counted against the limit.
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// The client address
    #[default]
    Ip,
    /// The [`AuthenticatedUser`] id, falling back to the client address
    User,
    /// The `X-API-Key` header, falling back to the client address
    ApiKey,
    /// A caller-supplied extractor, falling back to the client address
    Custom(IdentifierFn),
}

impl KeyStrategy {
    pub fn custom<F>(extract: F) -> Self
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        KeyStrategy::Custom(Arc::new(extract))
    }

    /// The identifier for `request`. Never empty.
    ///
    /// `trusted_proxy_headers` are consulted for the client address before
    /// the socket peer; see [`client_ip`].
    pub fn identify(&self, request: &Request, trusted_proxy_headers: &[String]) -> String {
        let identified = match self {
            KeyStrategy::Ip => None,
            KeyStrategy::User => request
                .extensions()
                .get::<AuthenticatedUser>()
                .map(|user| format!("user:{}", user.id)),
            KeyStrategy::ApiKey => request
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .filter(|key| !key.is_empty())
                .map(|key| format!("apikey:{}", key)),
            KeyStrategy::Custom(extract) => extract(request),
        };

        identified.unwrap_or_else(|| {
            client_ip(request, trusted_proxy_headers)
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| ANONYMOUS.to_string())
        })
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Ip => f.write_str("Ip"),
            KeyStrategy::User => f.write_str("User"),
            KeyStrategy::ApiKey => f.write_str("ApiKey"),
            KeyStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// The client address: `trusted_proxy_headers` in order, then the socket
/// peer.
///
/// Only list headers that a proxy in front of the service overwrites.
/// Otherwise a client can pick a fresh address per request.
pub fn client_ip(request: &Request, trusted_proxy_headers: &[String]) -> Option<IpAddr> {
    for header in trusted_proxy_headers {
        let Some(value) = request.headers().get(header.as_str()) else {
            continue;
        };
        if let Ok(value) = value.to_str() {
            // X-Forwarded-For lists the originating client first.
            let first = value.split(',').next().unwrap_or(value).trim();
            if let Ok(ip) = first.parse() {
                return Some(ip);
            }
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}
