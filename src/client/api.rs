use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::Authenticator;
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::pipeline::{MessageIdentifier, MessageInterceptor, Pipeline};
use crate::query::Query;
use crate::socket::{Connection, SocketId};
use crate::subscription::SubscriptionHandle;
use crate::transport::TransportFactory;

/// Builds one instance of a system subscription for a freshly created connection.
/// A factory rather than a shared instance because every connection needs its
/// own `confirmed`/invocation-count state: every new connection is born with
/// all registered system subscriptions already attached.
pub type SystemSubscriptionFactory = Arc<dyn Fn() -> Arc<dyn SubscriptionHandle> + Send + Sync>;

/**
 * Pool of Socket Connections for a single API: decides whether to reuse or
 * create a connection, serializes connects through a gate, and provides the
 * Subscribe/Query/Unsubscribe entry points.
 */
pub struct SocketApiClient {
    connections: DashMap<SocketId, Arc<Connection>>,
    sub_locations: DashMap<u64, SocketId>,
    system_subscription_factories: Vec<SystemSubscriptionFactory>,
    connect_gate: AsyncMutex<()>,
    options: Arc<ClientOptions>,
    transport_factory: Arc<dyn TransportFactory>,
    identifier: Arc<dyn MessageIdentifier>,
    interceptor: Option<Arc<dyn MessageInterceptor>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    disposing: AtomicBool,
    next_socket_id: AtomicU64,
}

impl SocketApiClient {
    pub fn new(
        options: ClientOptions,
        transport_factory: Arc<dyn TransportFactory>,
        identifier: Arc<dyn MessageIdentifier>,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            sub_locations: DashMap::new(),
            system_subscription_factories: Vec::new(),
            connect_gate: AsyncMutex::new(()),
            options: Arc::new(options),
            transport_factory,
            identifier,
            interceptor: None,
            authenticator: None,
            disposing: AtomicBool::new(false),
            next_socket_id: AtomicU64::new(1),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Registers a system subscription that every connection this client creates
    /// from now on will carry from birth (past connections are unaffected).
    pub fn with_system_subscription(mut self, factory: SystemSubscriptionFactory) -> Self {
        self.system_subscription_factories.push(factory);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn connections(&self) -> &DashMap<SocketId, Arc<Connection>> {
        &self.connections
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    /**
     * Subscribes `subscription` on a pooled connection: acquire the connect
     * gate, pick-or-create a connection, send the sub-query, then hand the
     * subscription its cancellation hook.
     *
     * Returns the subscription's id, usable with [`SocketApiClient::unsubscribe`].
     */
    #[instrument(skip(self, subscription, cancel), fields(sub_id = subscription.id()))]
    pub async fn subscribe(
        &self,
        subscription: Arc<dyn SubscriptionHandle>,
        cancel: CancellationToken,
    ) -> Result<u64> {
        if self.is_disposing() {
            return Err(Error::InvalidOperation("client is disposing".into()));
        }
        if subscription.authenticated() && self.options.api_credentials.is_none() {
            return Err(Error::NoCredentials);
        }

        let combine_target = self.options.socket_subscriptions_combine_target;
        let mut gate = Some(self.connect_gate.lock().await);

        let connection = loop {
            let connection = self.get_or_create_connection(subscription.authenticated()).await?;
            if !connection.can_add_subscription().await {
                continue;
            }
            if combine_target == 1 {
                gate.take();
            }
            connection.connect(subscription.authenticated()).await?;
            break connection;
        };
        gate.take();

        if connection.paused_activity().await {
            return Err(Error::server_error("socket paused"));
        }

        if let Some(query) = subscription.sub_query() {
            if let Err(err) = connection.send_and_wait_query(query, cancel.clone()).await {
                // The subscription was never registered on `connection` (that
                // happens below, only on success), so there is nothing to
                // remove from its map: fire the best-effort unsub directly
                // from the `Arc` we're already holding instead of going
                // through `Connection::close`, which would both no-op the
                // unsub (nothing to find by id) and, if this connection has
                // no other subscriptions, wrongly tear the whole connection
                // down over a single failed handshake.
                if err.is_cancellation_or_timeout() {
                    connection.send_unsub_query(&subscription).await;
                }
                return Err(err);
            }
        }

        let sub_id = subscription.id();
        let connection_for_cancel = connection.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            let _ = connection_for_cancel.close(Some(sub_id), true).await;
        });

        connection.add_subscription(subscription.clone()).await;
        subscription.mark_confirmed();
        self.sub_locations.insert(sub_id, connection.id());

        info!(sub_id, connection_id = connection.id(), "subscription registered");
        Ok(sub_id)
    }

    /// Same connection-selection dance as `subscribe`, without any subscription
    /// bookkeeping: sends `query` and returns its matched reply.
    #[instrument(skip(self, query, cancel))]
    pub async fn query(&self, query: Query, cancel: CancellationToken) -> Result<Value> {
        if self.is_disposing() {
            return Err(Error::InvalidOperation("client is disposing".into()));
        }
        if query.authenticated() && self.options.api_credentials.is_none() {
            return Err(Error::NoCredentials);
        }

        let connection = {
            let _gate = self.connect_gate.lock().await;
            let connection = self.get_or_create_connection(query.authenticated()).await?;
            connection.connect(query.authenticated()).await?;
            connection
        };

        if connection.paused_activity().await {
            return Err(Error::server_error("socket paused"));
        }

        connection.send_and_wait_query(query, cancel).await
    }

    /// Picks a connection to hand out: eligible connections are those in a
    /// handout-eligible status whose authentication matches the request;
    /// choose the least-loaded one under the combine target, fall back to the
    /// least-loaded one anyway if the pool is saturated, else create new.
    async fn get_or_create_connection(&self, authenticated: bool) -> Result<Arc<Connection>> {
        let mut eligible = Vec::new();
        for entry in self.connections.iter() {
            let connection = entry.value().clone();
            if !connection.status().await.is_eligible_for_handout() {
                continue;
            }
            if authenticated && !connection.authenticated().await {
                continue;
            }
            eligible.push(connection);
        }

        let mut least_loaded: Option<(Arc<Connection>, usize)> = None;
        for connection in &eligible {
            let count = connection.user_subscription_count().await;
            if least_loaded.as_ref().is_none_or(|(_, best)| count < *best) {
                least_loaded = Some((connection.clone(), count));
            }
        }

        let combine_target = self.options.socket_subscriptions_combine_target;
        let max_connections = self
            .options
            .max_connections_per_address
            .unwrap_or(self.options.max_socket_connections);

        if let Some((connection, count)) = least_loaded {
            if count < combine_target {
                return Ok(connection);
            }
            if self.connections.len() >= max_connections {
                debug!(connection_id = connection.id(), count, "saturation fallback: handing out an over-target connection");
                return Ok(connection);
            }
        }

        self.create_connection(authenticated).await
    }

    async fn create_connection(&self, authenticated: bool) -> Result<Arc<Connection>> {
        let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let system_subscriptions: Vec<Arc<dyn SubscriptionHandle>> =
            self.system_subscription_factories.iter().map(|factory| factory()).collect();

        let pipeline = Arc::new(
            Pipeline::new(self.identifier.clone(), self.interceptor.clone())
                .with_keep_raw(self.options.output_original_data),
        );

        let connection = Connection::spawn(
            id,
            self.options.base_address.clone(),
            self.options.base_address.clone(),
            self.options.clone(),
            self.transport_factory.clone(),
            pipeline,
            self.authenticator.clone(),
            self.options.rate_limiters.clone(),
            system_subscriptions,
        );

        self.connections.insert(id, connection.clone());
        info!(connection_id = id, authenticated, "created new pooled connection");
        Ok(connection)
    }

    /// Finds the owning connection by subscription id and closes it there.
    /// Returns `false` if the subscription is not known (idempotent).
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, subscription_id: u64) -> bool {
        let Some((_, socket_id)) = self.sub_locations.remove(&subscription_id) else {
            return false;
        };

        if let Some(connection) = self.connections.get(&socket_id).map(|entry| entry.value().clone()) {
            if let Err(err) = connection.close(Some(subscription_id), true).await {
                warn!(%err, subscription_id, "unsubscribe failed to send unsub-query");
            }
        }

        true
    }

    pub async fn unsubscribe_all(&self) {
        let ids: Vec<u64> = self.sub_locations.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.unsubscribe(id).await;
        }
    }

    pub async fn reconnect_all(&self) {
        let connections: Vec<Arc<Connection>> = self.connections.iter().map(|entry| entry.value().clone()).collect();
        for connection in connections {
            connection.trigger_reconnect().await;
        }
    }

    /// Terminal: marks the client disposing, sends a best-effort unsub for every
    /// live subscription, and tears down every connection.
    #[instrument(skip(self))]
    pub async fn dispose(&self) {
        self.disposing.store(true, Ordering::Release);
        self.unsubscribe_all().await;

        let connections: Vec<Arc<Connection>> = self.connections.iter().map(|entry| entry.value().clone()).collect();
        for connection in connections {
            let _ = connection.close(None, false).await;
            self.connections.remove(&connection.id());
        }

        info!("client disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CrateResult;
    use crate::pipeline::DefaultMessageIdentifier;
    use crate::subscription::{SystemSubscription, TypedSubscriptionBuilder};
    use crate::transport::{Transport, TransportParams};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockTransportInner {
        inbound: Vec<Option<CrateResult<Vec<u8>>>>,
        sent: Vec<Vec<u8>>,
    }

    struct MockTransport {
        inner: Arc<StdMutex<MockTransportInner>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn id(&self) -> u64 {
            1
        }

        async fn send(&self, message: Vec<u8>) -> CrateResult<()> {
            self.inner.lock().unwrap().sent.push(message);
            Ok(())
        }

        async fn ping(&self) -> CrateResult<()> {
            Ok(())
        }

        async fn next_message(&self) -> Option<CrateResult<Vec<u8>>> {
            let next = self.inner.lock().unwrap().inbound.pop();
            match next {
                Some(v) => v,
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn close(&self) -> CrateResult<()> {
            Ok(())
        }
    }

    /// Every transport this factory opens shares `inner` when one is provided
    /// (so a test can inspect everything written across the single connection
    /// it drives); otherwise each transport gets its own, independent state.
    #[derive(Default)]
    struct MockFactory {
        shared: Option<Arc<StdMutex<MockTransportInner>>>,
    }

    impl MockFactory {
        fn with_shared_inner(inner: Arc<StdMutex<MockTransportInner>>) -> Self {
            Self { shared: Some(inner) }
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn open(&self, _params: TransportParams) -> CrateResult<Box<dyn Transport>> {
            let inner = self.shared.clone().unwrap_or_else(|| Arc::new(StdMutex::new(MockTransportInner::default())));
            Ok(Box::new(MockTransport { inner }))
        }
    }

    fn test_client(combine_target: usize, max_connections: usize) -> SocketApiClient {
        let options = ClientOptions::builder("wss://example.com")
            .with_combine_target(combine_target)
            .with_max_socket_connections(max_connections)
            .build();
        SocketApiClient::new(options, Arc::new(MockFactory::default()), Arc::new(DefaultMessageIdentifier))
            .with_system_subscription(Arc::new(|| Arc::new(SystemSubscription::new(["ping"])) as Arc<dyn SubscriptionHandle>))
    }

    #[derive(Debug, Clone, Deserialize, PartialEq)]
    struct Trade {
        price: String,
    }

    fn unauthenticated_subscription(identifier: &str) -> Arc<dyn SubscriptionHandle> {
        let (handle, _typed) = TypedSubscriptionBuilder::<Trade>::new()
            .with_identifier(identifier)
            .build();
        handle
    }

    #[tokio::test]
    async fn coalesces_up_to_combine_target_then_opens_new_connection() {
        let client = test_client(3, 2);

        for i in 0..5 {
            let sub = unauthenticated_subscription(&format!("stream{i}"));
            client.subscribe(sub, CancellationToken::new()).await.unwrap();
        }

        assert_eq!(client.connections.len(), 2);
        let counts: Vec<usize> = {
            let mut out = Vec::new();
            for entry in client.connections.iter() {
                out.push(entry.value().user_subscription_count().await);
            }
            out.sort();
            out
        };
        assert_eq!(counts, vec![2, 3]);
    }

    #[tokio::test]
    async fn saturation_fallback_overloads_single_connection() {
        let client = test_client(2, 1);

        for i in 0..3 {
            let sub = unauthenticated_subscription(&format!("stream{i}"));
            client.subscribe(sub, CancellationToken::new()).await.unwrap();
        }

        assert_eq!(client.connections.len(), 1);
        let entry = client.connections.iter().next().unwrap();
        assert_eq!(entry.value().user_subscription_count().await, 3);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_for_unknown_id() {
        let client = test_client(3, 2);
        assert!(!client.unsubscribe(9999).await);
    }

    #[tokio::test]
    async fn dispose_rejects_further_subscribes() {
        let client = test_client(3, 2);
        let sub = unauthenticated_subscription("stream0");
        client.subscribe(sub, CancellationToken::new()).await.unwrap();

        client.dispose().await;

        let sub2 = unauthenticated_subscription("stream1");
        let result = client.subscribe(sub2, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn cancelling_mid_handshake_fails_the_subscribe_without_hanging() {
        let inner = Arc::new(StdMutex::new(MockTransportInner::default()));
        let options = ClientOptions::builder("wss://example.com").with_combine_target(3).with_max_socket_connections(2).build();
        let client = SocketApiClient::new(options, Arc::new(MockFactory::with_shared_inner(inner.clone())), Arc::new(DefaultMessageIdentifier))
            .with_system_subscription(Arc::new(|| Arc::new(SystemSubscription::new(["ping"])) as Arc<dyn SubscriptionHandle>));

        let (handle, _typed) = TypedSubscriptionBuilder::<Trade>::new()
            .with_identifier("stream0")
            .with_sub_query(|| Some(Query::new(serde_json::json!({"op": "sub"}), false, |_| false)))
            .with_unsub_query(|| Some(Query::new(serde_json::json!({"op": "unsub"}), false, |_| false)))
            .build();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });

        let result = client.subscribe(handle, cancel).await;
        let err = result.unwrap_err();
        assert!(err.is_cancellation_or_timeout());

        let unsub_frames = inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|bytes| serde_json::from_slice::<serde_json::Value>(bytes).unwrap()["op"] == "unsub")
            .count();
        assert_eq!(unsub_frames, 1);
    }
}
