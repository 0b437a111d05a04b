//! Authentication and rate limiting.

pub mod gate;
pub mod rate_limit;

pub use gate::AuthGate;
pub use rate_limit::RateLimiter;
