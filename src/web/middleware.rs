//! Consumption middleware.
//!
//! [`RateLimitLayer`] wraps an HTTP service with one [`Limiter`]. Each
//! request is either bypassed, allowed with `X-RateLimit-*` headers, or
//! answered with `429 Too Many Requests` without reaching the inner service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::ConnectInfo;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use futures::future::BoxFuture;
use http::{Extensions, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use crate::ratelimit::{ConsumeResult, Limiter};

/// Header that skips rate limiting when its value is exactly `true`.
pub const BYPASS_HEADER: HeaderName = HeaderName::from_static("x-bypass-rate-limit");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Client key used when the extractor finds no identity.
pub const UNKNOWN_CLIENT_KEY: &str = "unknown";

const REJECTION_MESSAGE: &str = "Too many requests";

/// How requests are treated when the counter store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorPolicy {
    /// Reject with 429.
    #[default]
    FailClosed,
    /// Let the request through without rate limit headers.
    FailOpen,
}

/// Derives the rate limit key for a request.
pub trait KeyExtractor: Send + Sync {
    /// Return the client key, or `None` if the request carries no identity.
    fn extract(&self, headers: &HeaderMap, extensions: &Extensions) -> Option<String>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&HeaderMap, &Extensions) -> Option<String> + Send + Sync,
{
    fn extract(&self, headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
        self(headers, extensions)
    }
}

/// Keys requests by the client's IP address.
///
/// The peer address comes from axum's [`ConnectInfo`], so the router must be
/// served with `into_make_service_with_connect_info::<SocketAddr>()`. Behind a
/// trusted proxy, the first `X-Forwarded-For` hop is used instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerIpExtractor {
    trust_forwarded_for: bool,
}

impl PeerIpExtractor {
    pub fn new(trust_forwarded_for: bool) -> Self {
        Self { trust_forwarded_for }
    }
}

impl KeyExtractor for PeerIpExtractor {
    fn extract(&self, headers: &HeaderMap, extensions: &Extensions) -> Option<String> {
        if self.trust_forwarded_for {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|hop| !hop.is_empty());
            if let Some(hop) = forwarded {
                return Some(hop.to_string());
            }
        }
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

#[derive(Clone)]
struct Settings {
    limiter: Arc<Limiter>,
    extractor: Arc<dyn KeyExtractor>,
    bypass_header: HeaderName,
    on_store_error: StoreErrorPolicy,
    store_error_retry_after_secs: u64,
}

impl Settings {
    fn is_bypassed(&self, headers: &HeaderMap) -> bool {
        headers
            .get(&self.bypass_header)
            .is_some_and(|v| v.as_bytes() == b"true")
    }

    fn client_key(&self, headers: &HeaderMap, extensions: &Extensions) -> String {
        self.extractor
            .extract(headers, extensions)
            .unwrap_or_else(|| UNKNOWN_CLIENT_KEY.to_string())
    }

    fn capacity(&self) -> u64 {
        self.limiter.policy().capacity()
    }

    fn too_many_requests(&self, retry_after_secs: u64, ms_before_next: u64) -> Response {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorBody {
                error: REJECTION_MESSAGE,
            }),
        )
            .into_response();
        let headers = response.headers_mut();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        insert_rate_limit_headers(headers, self.capacity(), 0, ms_before_next);
        response
    }
}

/// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
pub fn insert_rate_limit_headers(headers: &mut HeaderMap, limit: u64, remaining: u64, ms_before_next: u64) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    if let Ok(reset) = HeaderValue::from_str(&reset_timestamp(Utc::now(), ms_before_next)) {
        headers.insert(X_RATELIMIT_RESET, reset);
    }
}

/// ISO-8601 instant `ms_before_next` after `now`, with millisecond precision.
pub fn reset_timestamp(now: DateTime<Utc>, ms_before_next: u64) -> String {
    let delta = i64::try_from(ms_before_next)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A layer that enforces a [`Limiter`] on every request.
#[derive(Clone)]
pub struct RateLimitLayer {
    settings: Settings,
}

impl RateLimitLayer {
    /// Create a layer keyed by peer IP, failing closed on store errors.
    pub fn new(limiter: Arc<Limiter>) -> Self {
        Self {
            settings: Settings {
                limiter,
                extractor: Arc::new(PeerIpExtractor::default()),
                bypass_header: BYPASS_HEADER,
                on_store_error: StoreErrorPolicy::default(),
                store_error_retry_after_secs: 1,
            },
        }
    }

    /// Derive client keys with `extractor`.
    pub fn with_key_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.settings.extractor = Arc::new(extractor);
        self
    }

    /// Use a different bypass header name.
    pub fn with_bypass_header(mut self, header: HeaderName) -> Self {
        self.settings.bypass_header = header;
        self
    }

    /// Choose the store failure policy and the `Retry-After` sent when failing closed.
    pub fn with_store_error_policy(mut self, policy: StoreErrorPolicy, retry_after_secs: u64) -> Self {
        self.settings.on_store_error = policy;
        self.settings.store_error_retry_after_secs = retry_after_secs;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            settings: Arc::new(self.settings.clone()),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    settings: Arc<Settings>,
}

impl<S, B> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let settings = self.settings.clone();

        Box::pin(async move {
            // Checked before any store access so it works while the store is down.
            if settings.is_bypassed(req.headers()) {
                trace!(uri = %req.uri(), "Rate limit bypassed");
                return inner.call(req).await;
            }

            let key = settings.client_key(req.headers(), req.extensions());

            match settings.limiter.consume(&key).await {
                Ok(result) if result.allowed => {
                    let mut response = inner.call(req).await?;
                    insert_rate_limit_headers(
                        response.headers_mut(),
                        settings.capacity(),
                        result.remaining_points,
                        result.ms_before_next,
                    );
                    Ok(response)
                }
                Ok(result) => {
                    debug!(
                        key = %key,
                        namespace = %settings.limiter.namespace(),
                        rejection = ?result.rejection,
                        ms_before_next = result.ms_before_next,
                        "Request rejected"
                    );
                    Ok(reject(&settings, &result))
                }
                Err(err) => {
                    warn!(
                        key = %key,
                        namespace = %settings.limiter.namespace(),
                        error = %err,
                        policy = ?settings.on_store_error,
                        "Rate limiter unavailable"
                    );
                    match settings.on_store_error {
                        StoreErrorPolicy::FailOpen => inner.call(req).await,
                        StoreErrorPolicy::FailClosed => {
                            let retry_after = settings.store_error_retry_after_secs;
                            Ok(settings.too_many_requests(retry_after, retry_after.saturating_mul(1000)))
                        }
                    }
                }
            }
        })
    }
}

fn reject(settings: &Settings, result: &ConsumeResult) -> Response {
    settings.too_many_requests(result.retry_after_secs(), result.ms_before_next)
}
