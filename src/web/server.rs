//! HTTP server wiring.

use std::net::SocketAddr;

use axum::routing::any;
use axum::Router;
use http::HeaderName;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{PeerIpExtractor, RateLimitLayer};
use crate::config::QuotagateConfig;
use crate::error::{QuotagateError, Result};
use crate::ratelimit::LimiterRegistry;

/// Build a router with one rate limited route per configured entry.
///
/// Routes sharing a policy share a limiter through `registry`.
pub fn build_router(config: &QuotagateConfig, registry: &LimiterRegistry) -> Result<Router> {
    let settings = &config.rate_limiting;
    let bypass_header = HeaderName::try_from(settings.bypass_header.as_str()).map_err(|e| {
        QuotagateError::Config(format!("bypass_header {:?}: {}", settings.bypass_header, e))
    })?;
    let extractor = PeerIpExtractor::new(config.server.trust_forwarded_for);

    let mut router = Router::new();
    for route in &settings.routes {
        let limiter = registry.get_or_create(route.policy(settings.block_secs)?)?;
        info!(
            path = %route.path,
            namespace = %limiter.namespace(),
            block = ?limiter.policy().block(),
            "Registered rate limited route"
        );

        let layer = RateLimitLayer::new(limiter)
            .with_key_extractor(extractor)
            .with_bypass_header(bypass_header.clone())
            .with_store_error_policy(settings.on_store_error, settings.store_error_retry_after_secs);

        let body = route.body.clone();
        let handler = move || {
            let body = body.clone();
            async move { body }
        };
        router = router.route(&route.path, any(handler).layer(layer));
    }
    Ok(router)
}

/// HTTP server for the rate limited routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The application router
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves. Peer
    /// addresses are recorded so requests can be keyed by client IP.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            QuotagateError::Io(e)
        })
    }
}
