//! Authentication: credential resolution, the authorizer, and the
//! brute-force rate limiter.

pub mod credentials;
pub mod rate_limit;

pub use credentials::{authorize, resolve_auth, AuthMethod, AuthMode, AuthResult, ResolvedAuth};
pub use rate_limit::{AuthRateLimiter, RateLimitConfig};
