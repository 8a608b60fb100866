// Scheduling middleware: credential pool and per-credential rate limiting

pub mod credential_pool;
pub mod rate_limiter;

pub use credential_pool::{Credential, CredentialPool, CredentialView};
pub use rate_limiter::{Acquire, RateLimitPolicy, RateLimiter};
