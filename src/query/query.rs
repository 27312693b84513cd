use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

/// Default window a [`Query`] is allowed to wait for its matching reply.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/**
 * A one-shot request/response exchange sent on a connection.
 *
 * `matches` is a predicate over a parsed inbound frame; the connection's
 * dispatch loop runs it against every pending query in insertion order
 * and completes the first one that matches. A `Query` does not own its
 * completion primitive; the connection pairs it with a `oneshot::Sender`
 * in its pending-queries collection, since the same connection may have
 * many queries in flight concurrently.
 */
#[derive(Clone)]
pub struct Query {
    request_id: String,
    payload: Value,
    authenticated: bool,
    timeout: Duration,
    continue_on_query_response: bool,
    matcher: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl Query {
    /// `request_id` is a fresh v4 UUID, the same correlation-id scheme the
    /// teacher stamps onto its own logon/subscribe/request payloads
    /// (`Uuid::new_v4().to_string()` in its connection handler) — used here
    /// purely for tracing/log correlation, not for matching; `matches` stays
    /// the caller's own predicate since reply shapes are exchange-specific.
    pub fn new(
        payload: Value,
        authenticated: bool,
        matcher: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            payload,
            authenticated,
            timeout: DEFAULT_QUERY_TIMEOUT,
            continue_on_query_response: false,
            matcher: Arc::new(matcher),
        }
    }

    /// Correlation id for tracing spans and log lines; not transmitted unless
    /// the caller embeds it in `payload` itself.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// When set, a frame that completes this query is still offered to
    /// matching subscriptions afterward. Defaults to `false`: a query
    /// response is consumed by the query alone.
    pub fn with_continue_on_query_response(mut self, continue_on_query_response: bool) -> Self {
        self.continue_on_query_response = continue_on_query_response;
        self
    }

    pub fn continue_on_query_response(&self) -> bool {
        self.continue_on_query_response
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn matches(&self, message: &Value) -> bool {
        (self.matcher)(message)
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("request_id", &self.request_id)
            .field("payload", &self.payload)
            .field("authenticated", &self.authenticated)
            .field("timeout", &self.timeout)
            .field("continue_on_query_response", &self.continue_on_query_response)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_delegates_to_predicate() {
        let query = Query::new(Value::Null, false, |msg| msg.get("id") == Some(&Value::from(7)));
        assert!(query.matches(&serde_json::json!({ "id": 7 })));
        assert!(!query.matches(&serde_json::json!({ "id": 8 })));
    }

    #[test]
    fn with_timeout_overrides_default() {
        let query = Query::new(Value::Null, false, |_| true).with_timeout(Duration::from_millis(5));
        assert_eq!(query.timeout(), Duration::from_millis(5));
    }

    #[test]
    fn continue_on_query_response_defaults_false() {
        let query = Query::new(Value::Null, false, |_| true);
        assert!(!query.continue_on_query_response());
        let query = query.with_continue_on_query_response(true);
        assert!(query.continue_on_query_response());
    }

    #[test]
    fn each_query_gets_a_distinct_request_id() {
        let a = Query::new(Value::Null, false, |_| true);
        let b = Query::new(Value::Null, false, |_| true);
        assert_ne!(a.request_id(), b.request_id());
        assert!(uuid::Uuid::parse_str(a.request_id()).is_ok());
    }
}
