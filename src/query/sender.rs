use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::Query;

/**
 * Narrow seam a [`crate::auth::Authenticator`] or a [`crate::subscription::SubscriptionHandle`]
 * uses to round-trip a query on whatever connection is driving it, without depending on the
 * full Socket Connection type.
 */
#[async_trait]
pub trait QuerySender: Send + Sync {
    /**
     * Registers `query` in the connection's pending-queries set, transmits it, and suspends
     * until a matching frame arrives, the query times out, or `cancel` fires.
     *
     * A timeout is reported the same way as cancellation: [`crate::error::Error::CancellationRequested`].
     */
    async fn send_and_wait_query(&self, query: Query, cancel: CancellationToken) -> Result<Value>;
}
