use async_trait::async_trait;

use crate::error::Result;

/**
 * Opaque outbound rate limiter consulted before every send on a connection.
 *
 * Bucket policy (weights, refill cadence, per-endpoint rules) is exchange-specific
 * and out of scope here; the core only needs `acquire` to suspend until a token is
 * available, or fail, per the limiter's own policy.
 */
#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    async fn acquire(&self, weight: u32) -> Result<()>;
}
