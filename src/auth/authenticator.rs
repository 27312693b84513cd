use async_trait::async_trait;

use crate::error::Result;
use crate::query::QuerySender;

/**
 * Exchange-specific authentication hook invoked during connect/reconnect for any
 * connection that needs to carry an authenticated subscription.
 *
 * The core only knows that, given something it can send a query on,
 * authentication either succeeds (the connection is marked authenticated) or
 * fails (the connection is closed, per
 * [`crate::error::Error::AuthenticationFailed`]). Concrete signing schemes
 * live outside this crate.
 */
#[async_trait]
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    async fn authenticate(&self, connection: &dyn QuerySender) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    use crate::error::Error;
    use crate::query::Query;

    #[derive(Debug)]
    struct AlwaysOk;

    #[async_trait]
    impl Authenticator for AlwaysOk {
        async fn authenticate(&self, connection: &dyn QuerySender) -> Result<()> {
            let query = Query::new(Value::Null, true, |_| true);
            connection
                .send_and_wait_query(query, CancellationToken::new())
                .await?;
            Ok(())
        }
    }

    struct MockSender {
        fail: bool,
    }

    #[async_trait]
    impl QuerySender for MockSender {
        async fn send_and_wait_query(
            &self,
            _query: Query,
            _cancel: CancellationToken,
        ) -> Result<Value> {
            if self.fail {
                Err(Error::server_error("logon rejected"))
            } else {
                Ok(Value::Null)
            }
        }
    }

    #[tokio::test]
    async fn authenticate_succeeds_when_logon_query_succeeds() {
        let auth = AlwaysOk;
        let sender = MockSender { fail: false };
        assert!(auth.authenticate(&sender).await.is_ok());
    }

    #[tokio::test]
    async fn authenticate_propagates_query_failure() {
        let auth = AlwaysOk;
        let sender = MockSender { fail: true };
        assert!(auth.authenticate(&sender).await.is_err());
    }
}
