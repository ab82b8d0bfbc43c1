//! HTTP surface: the consumption middleware and server wiring.

mod middleware;
mod server;

pub use middleware::{
    insert_rate_limit_headers, reset_timestamp, KeyExtractor, PeerIpExtractor, RateLimitLayer,
    RateLimitService, StoreErrorPolicy, BYPASS_HEADER, UNKNOWN_CLIENT_KEY, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{build_router, HttpServer};
