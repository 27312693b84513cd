use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::MessageInterceptor;
use crate::rate_limit::RateLimiter;

/**
 * Parameters a [`TransportFactory`] needs to open one physical connection.
 *
 * Generalizes the fields a single-stream-type connection would thread
 * through to whatever a pooled Socket Connection needs regardless of which
 * API it belongs to.
 */
#[derive(Clone)]
pub struct TransportParams {
    pub uri: String,
    pub auto_reconnect: bool,
    pub keep_alive_interval: Option<Duration>,
    pub reconnect_interval: Duration,
    pub rate_limiters: Vec<Arc<dyn RateLimiter>>,
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub interceptor: Option<Arc<dyn MessageInterceptor>>,
}

/**
 * A bidirectional, ordered byte-message channel over one physical connection.
 *
 * The Socket Connection is the only caller of `send`/`next_message`/`close` and
 * enforces the single-writer/single-reader discipline itself; the transport does
 * not need internal queuing beyond what's necessary for `&self` method calls.
 */
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identity of this physical connection, exposed for observability.
    fn id(&self) -> u64;

    async fn send(&self, message: Vec<u8>) -> Result<()>;

    /// Sends a transport-level keep-alive frame (e.g. a WebSocket ping).
    async fn ping(&self) -> Result<()>;

    /// Returns `None` once the transport is closed and no further messages will arrive.
    async fn next_message(&self) -> Option<Result<Vec<u8>>>;

    async fn close(&self) -> Result<()>;
}

/**
 * Constructs transports from [`TransportParams`]. The core only depends on
 * this trait, never on a concrete WebSocket library, so the default
 * `tokio-tungstenite` implementation can be swapped for a test double or an
 * alternative transport.
 */
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, params: TransportParams) -> Result<Box<dyn Transport>>;
}
