//! HTTP server and rate limiting middleware.

mod middleware;
mod server;

pub use middleware::{
    default_key_extractor, rate_limit, KeyExtractor, RateLimitRejection, RateLimitState,
    SkipPredicate, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
};
pub use server::{AppLimiters, HttpServer};
