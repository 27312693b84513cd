use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::Authenticator;
use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::pipeline::{ParseOutcome, Pipeline};
use crate::query::{Query, QuerySender};
use crate::rate_limit::RateLimiter;
use crate::subscription::SubscriptionHandle;
use crate::transport::{Transport, TransportFactory, TransportParams};

use super::types::{ConnectionStatus, SocketId};

const MAX_BACKOFF_MULTIPLIER: u32 = 32;

type PendingQuery = (Query, oneshot::Sender<Result<Value>>);

struct ConnectionState {
    status: ConnectionStatus,
    transport: Option<Arc<dyn Transport>>,
    authenticated: bool,
    paused_activity: bool,
    subscriptions: HashMap<u64, Arc<dyn SubscriptionHandle>>,
    pending_queries: Vec<PendingQuery>,
    reconnect_attempts: u32,
    last_activity_at: Instant,
}

impl ConnectionState {
    fn user_subscription_count(&self) -> usize {
        self.subscriptions.values().filter(|s| !s.is_system()).count()
    }
}

enum Command {
    TriggerReconnect,
    Dispose(oneshot::Sender<()>),
}

/**
 * One pooled WebSocket connection: owns the transport, hosts many
 * subscriptions, dispatches inbound messages, tracks liveness, and drives
 * its own reconnect-and-resubscribe cycle.
 *
 * A single background task holds exclusive read access to the current
 * transport at all times (the "single writer" is enforced by the transport
 * implementation itself, which serializes `send`). External callers share
 * mutable state, subscriptions and pending queries, through an internal
 * mutex rather than a command bus, since a fixed command enum can't model
 * many independent queries in flight on the same connection at once.
 */
pub struct Connection {
    id: SocketId,
    tag: String,
    connection_uri: String,
    state: Mutex<ConnectionState>,
    command_tx: mpsc::UnboundedSender<Command>,
    options: Arc<ClientOptions>,
    transport_factory: Arc<dyn TransportFactory>,
    pipeline: Arc<Pipeline>,
    authenticator: Option<Arc<dyn Authenticator>>,
    rate_limiters: Vec<Arc<dyn RateLimiter>>,
    incoming_bytes: AtomicU64,
    disposed: AtomicBool,
}

impl Connection {
    /// Creates a connection in the `None` state and spawns its background dispatch task.
    /// Does not attempt to connect; call [`Connection::connect`] to do that.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: SocketId,
        tag: String,
        connection_uri: String,
        options: Arc<ClientOptions>,
        transport_factory: Arc<dyn TransportFactory>,
        pipeline: Arc<Pipeline>,
        authenticator: Option<Arc<dyn Authenticator>>,
        rate_limiters: Vec<Arc<dyn RateLimiter>>,
        system_subscriptions: Vec<Arc<dyn SubscriptionHandle>>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let mut subscriptions = HashMap::new();
        for sub in system_subscriptions {
            subscriptions.insert(sub.id(), sub);
        }

        let connection = Arc::new(Self {
            id,
            tag,
            connection_uri,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::None,
                transport: None,
                authenticated: false,
                paused_activity: false,
                subscriptions,
                pending_queries: Vec::new(),
                reconnect_attempts: 0,
                last_activity_at: Instant::now(),
            }),
            command_tx,
            options,
            transport_factory,
            pipeline,
            authenticator,
            rate_limiters,
            incoming_bytes: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        });

        let task_connection = connection.clone();
        tokio::spawn(async move {
            task_connection.run(command_rx).await;
        });

        connection
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn connection_uri(&self) -> &str {
        &self.connection_uri
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn authenticated(&self) -> bool {
        self.state.lock().await.authenticated
    }

    pub async fn paused_activity(&self) -> bool {
        self.state.lock().await.paused_activity
    }

    pub async fn user_subscription_count(&self) -> usize {
        self.state.lock().await.user_subscription_count()
    }

    pub async fn incoming_kbps(&self, window: Duration) -> f64 {
        let bytes = self.incoming_bytes.swap(0, Ordering::Relaxed);
        (bytes as f64 * 8.0) / 1000.0 / window.as_secs_f64()
    }

    pub async fn stream_identifiers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .subscriptions
            .values()
            .flat_map(|s| s.stream_identifiers().to_vec())
            .collect()
    }

    pub async fn subscription_ids(&self) -> Vec<u64> {
        self.state.lock().await.subscriptions.keys().copied().collect()
    }

    /// Snapshot of every attached subscription, for observability dumps.
    pub async fn subscriptions(&self) -> Vec<Arc<dyn SubscriptionHandle>> {
        self.state.lock().await.subscriptions.values().cloned().collect()
    }

    /// True iff not closing/disposed. The combine-target/saturation capacity
    /// decision belongs to the client's `get_or_create_connection`; this only
    /// reports whether the connection is still in a state that can accept a
    /// hand-out at all.
    pub async fn can_add_subscription(&self) -> bool {
        self.state.lock().await.status.is_eligible_for_handout()
    }

    #[instrument(skip(self), fields(socket_id = self.id, uri = %self.connection_uri))]
    pub async fn connect(&self, authenticate: bool) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.status == ConnectionStatus::Connected {
                return Ok(());
            }
        }

        let params = self.transport_params();
        let transport = self
            .transport_factory
            .open(params)
            .await
            .map_err(|err| Error::cant_connect(err.to_string()))?;

        if self.options.delay_after_connect > Duration::ZERO {
            tokio::time::sleep(self.options.delay_after_connect).await;
        }

        {
            let mut state = self.state.lock().await;
            state.transport = Some(Arc::from(transport));
            state.status = ConnectionStatus::Connected;
            state.last_activity_at = Instant::now();
        }

        info!("connection established");

        if authenticate {
            if let Some(authenticator) = &self.authenticator {
                authenticator.authenticate(self).await.map_err(|err| {
                    Error::authentication_failed("authentication failed on connect", err.into())
                })?;
                self.state.lock().await.authenticated = true;
                info!("connection authenticated");
            }
        }

        Ok(())
    }

    pub async fn add_subscription(&self, subscription: Arc<dyn SubscriptionHandle>) {
        let mut state = self.state.lock().await;
        state.subscriptions.insert(subscription.id(), subscription);
    }

    /**
     * Removes a subscription, sends its unsub-query when applicable, and
     * schedules teardown once the connection has no user subscriptions left.
     * With `subscription_id = None` tears down everything.
     */
    #[instrument(skip(self))]
    pub async fn close(&self, subscription_id: Option<u64>, send_unsub: bool) -> Result<()> {
        match subscription_id {
            Some(id) => {
                let (subscription, remaining) = {
                    let mut state = self.state.lock().await;
                    let subscription = state.subscriptions.remove(&id);
                    (subscription, state.user_subscription_count())
                };

                if let (Some(subscription), true) = (&subscription, send_unsub) {
                    self.send_unsub_query(subscription).await;
                }

                if remaining == 0 {
                    self.teardown().await?;
                }
                Ok(())
            }
            None => self.teardown().await,
        }
    }

    /**
     * Fires `subscription`'s unsub-query (if any) directly on the current
     * transport, without touching `state.subscriptions`. Used both by
     * [`Connection::close`] for a registered subscription and by callers
     * whose subscribe handshake failed before the subscription was ever
     * added to this connection — in that case there is nothing to remove
     * from the map, but a best-effort unsub still has to go out so a
     * late-arriving server ack doesn't leak a live subscription.
     */
    pub(crate) async fn send_unsub_query(&self, subscription: &Arc<dyn SubscriptionHandle>) {
        let Some(query) = subscription.unsub_query() else { return };
        let transport = self.state.lock().await.transport.clone();
        let Some(transport) = transport else { return };
        if let Ok(bytes) = serde_json::to_vec(query.payload()) {
            let _ = transport.send(bytes).await;
        }
    }

    /// Drops the entry for `request_id` from the pending-queries collection
    /// without completing its responder, so a stale cancelled/timed-out
    /// query can never again steal a later matching frame from a genuinely
    /// pending one.
    async fn remove_pending_query(&self, request_id: &str) {
        let mut state = self.state.lock().await;
        state.pending_queries.retain(|(q, _)| q.request_id() != request_id);
    }

    async fn teardown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::Dispose(tx)).is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn trigger_reconnect(&self) {
        let _ = self.command_tx.send(Command::TriggerReconnect);
    }

    fn transport_params(&self) -> TransportParams {
        TransportParams {
            uri: self.connection_uri.clone(),
            auto_reconnect: self.options.auto_reconnect,
            keep_alive_interval: Some(self.options.keep_alive_interval),
            reconnect_interval: self.options.reconnect_interval,
            rate_limiters: self.rate_limiters.clone(),
            proxy: self.options.proxy.clone(),
            timeout: self.options.socket_no_data_timeout,
            interceptor: None,
        }
    }

    fn backoff_delay(&self, attempts: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        let multiplier = multiplier.min(MAX_BACKOFF_MULTIPLIER);
        let base = self.options.reconnect_interval * multiplier;
        let jitter_ms = rand::rng().random_range(0..100);
        base + Duration::from_millis(jitter_ms)
    }

    /// Dispatches one already-parsed frame: pending queries first (in insertion
    /// order, first match wins), then every subscription whose identifiers
    /// intersect the message's.
    async fn dispatch_parsed(&self, identifiers: &[String], value: &Value) {
        let query_match = {
            let mut state = self.state.lock().await;
            let position = state.pending_queries.iter().position(|(q, _)| q.matches(value));
            position.map(|idx| state.pending_queries.remove(idx))
        };

        if let Some((query, responder)) = query_match {
            let continue_after_query = query.continue_on_query_response();
            let _ = responder.send(Ok(value.clone()));
            if !continue_after_query {
                return;
            }
        }

        let matched_subscriptions: Vec<Arc<dyn SubscriptionHandle>> = {
            let state = self.state.lock().await;
            state
                .subscriptions
                .values()
                .filter(|sub| sub.stream_identifiers().iter().any(|id| identifiers.contains(id)))
                .cloned()
                .collect()
        };

        if matched_subscriptions.is_empty() {
            if self.options.unhandled_expected {
                debug!(?identifiers, "unhandled message (expected)");
            } else {
                warn!(?identifiers, "unhandled message");
            }
            return;
        }

        for identifier in identifiers {
            for subscription in &matched_subscriptions {
                if subscription.stream_identifiers().iter().any(|id| id == identifier) {
                    if let Err(err) = subscription.handle(identifier, value.clone()) {
                        warn!(%err, subscription_id = subscription.id(), "subscription handler failed");
                    }
                }
            }
        }
    }

    async fn dispatch_frame(&self, raw: Vec<u8>) {
        self.incoming_bytes.fetch_add(raw.len() as u64, Ordering::Relaxed);
        self.state.lock().await.last_activity_at = Instant::now();

        match self.pipeline.parse(raw) {
            ParseOutcome::Parsed(msg) => self.dispatch_parsed(&msg.identifiers, &msg.value).await,
            ParseOutcome::Unparseable(bytes) => {
                debug!(len = bytes.len(), "unparseable inbound frame");
            }
        }
    }

    /// Sends `query` on `transport` and pumps `transport.next_message()` until
    /// it matches, times out, or the transport errors. Used only while
    /// resubscribing, where this task is the sole reader of the new transport
    /// and cannot rely on its own main loop (not yet running on it) to resolve
    /// the reply.
    async fn send_query_inline(&self, transport: &dyn Transport, query: &Query) -> Result<Value> {
        let bytes = serde_json::to_vec(query.payload()).map_err(|e| Error::from(anyhow::Error::new(e)))?;
        transport.send(bytes).await?;

        let deadline = Instant::now() + query.timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::CancellationRequested);
            }

            match tokio::time::timeout(remaining, transport.next_message()).await {
                Ok(Some(Ok(raw))) => {
                    self.incoming_bytes.fetch_add(raw.len() as u64, Ordering::Relaxed);
                    match self.pipeline.parse(raw) {
                        ParseOutcome::Parsed(msg) => {
                            if query.matches(&msg.value) {
                                return Ok(msg.value);
                            }
                            self.dispatch_parsed(&msg.identifiers, &msg.value).await;
                        }
                        ParseOutcome::Unparseable(_) => {}
                    }
                }
                Ok(Some(Err(err))) => return Err(err),
                Ok(None) => return Err(Error::ConnectionLost),
                Err(_) => return Err(Error::CancellationRequested),
            }
        }
    }

    async fn resubscribe_all(&self, transport: &dyn Transport) -> Result<()> {
        let subscriptions: Vec<Arc<dyn SubscriptionHandle>> = {
            let state = self.state.lock().await;
            state.subscriptions.values().cloned().collect()
        };

        for subscription in subscriptions {
            subscription.clear_confirmed();
            subscription.revitalize_after_reconnect();

            match subscription.sub_query() {
                Some(query) => {
                    let reply = self.send_query_inline(transport, &query).await?;
                    if reply.get("error").is_some() {
                        return Err(Error::server_error("resubscribe rejected by server"));
                    }
                    subscription.mark_confirmed();
                }
                None => subscription.mark_confirmed(),
            }
        }

        Ok(())
    }

    /// Performs the transport-open + optional auth + resubscribe sequence for
    /// one reconnect attempt. On any failure the caller re-enters backoff.
    async fn reconnect_once(&self) -> Result<()> {
        let params = self.transport_params();
        let transport: Arc<dyn Transport> = self
            .transport_factory
            .open(params)
            .await
            .map(Arc::from)
            .map_err(|err| Error::cant_connect(err.to_string()))?;

        let needs_auth = {
            let state = self.state.lock().await;
            state.authenticated
        };

        if needs_auth {
            if let Some(authenticator) = &self.authenticator {
                struct InlineSender<'a> {
                    connection: &'a Connection,
                    transport: &'a dyn Transport,
                }

                #[async_trait::async_trait]
                impl QuerySender for InlineSender<'_> {
                    async fn send_and_wait_query(&self, query: Query, _cancel: CancellationToken) -> Result<Value> {
                        self.connection.send_query_inline(self.transport, &query).await
                    }
                }

                let sender = InlineSender { connection: self, transport: transport.as_ref() };
                authenticator
                    .authenticate(&sender)
                    .await
                    .map_err(|err| Error::authentication_failed("authentication failed on reconnect", err.into()))?;
            }
        }

        self.resubscribe_all(transport.as_ref()).await?;

        let mut state = self.state.lock().await;
        state.transport = Some(transport);
        state.status = ConnectionStatus::Connected;
        state.paused_activity = false;
        state.reconnect_attempts = 0;
        state.last_activity_at = Instant::now();

        Ok(())
    }

    async fn enter_reconnect_loop(&self) {
        {
            let mut state = self.state.lock().await;
            if state.status == ConnectionStatus::Disposed {
                return;
            }
            state.status = ConnectionStatus::Reconnecting;
            state.paused_activity = true;
            state.transport = None;
            for (_, responder) in state.pending_queries.drain(..) {
                let _ = responder.send(Err(Error::ConnectionLost));
            }
        }

        if !self.options.auto_reconnect {
            warn!("auto_reconnect disabled; connection will remain reconnecting indefinitely until disposed");
        }

        loop {
            if self.disposed.load(Ordering::Acquire) {
                return;
            }

            let attempts = {
                let mut state = self.state.lock().await;
                state.reconnect_attempts += 1;
                state.reconnect_attempts
            };

            let delay = self.backoff_delay(attempts);
            debug!(attempts, ?delay, "reconnect backoff");
            tokio::time::sleep(delay).await;

            match self.reconnect_once().await {
                Ok(()) => {
                    info!("reconnect succeeded, all subscriptions resubscribed");
                    return;
                }
                Err(err) => {
                    warn!(%err, attempts, "reconnect attempt failed");
                    continue;
                }
            }
        }
    }

    async fn run(self: Arc<Self>, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        let mut keep_alive = tokio::time::interval(self.options.keep_alive_interval);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.disposed.load(Ordering::Acquire) {
                return;
            }

            let status = self.state.lock().await.status;
            if status != ConnectionStatus::Connected {
                // No transport to read from yet (freshly spawned, or mid-reconnect
                // entered from a command). Wait for a command or a short tick.
                tokio::select! {
                    Some(cmd) = command_rx.recv() => {
                        if self.handle_command(cmd).await {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
                continue;
            }

            let transport = {
                let state = self.state.lock().await;
                state.transport.clone()
            };

            let Some(transport) = transport else { continue };

            let no_data_deadline = {
                let state = self.state.lock().await;
                state.last_activity_at + self.options.socket_no_data_timeout
            };

            tokio::select! {
                maybe = transport.next_message() => {
                    match maybe {
                        Some(Ok(bytes)) => self.dispatch_frame(bytes).await,
                        Some(Err(err)) => {
                            warn!(%err, "transport read error");
                            self.enter_reconnect_loop().await;
                        }
                        None => {
                            warn!("transport closed");
                            self.enter_reconnect_loop().await;
                        }
                    }
                }
                _ = keep_alive.tick() => {
                    if let Err(err) = transport.ping().await {
                        warn!(%err, "keep-alive ping failed");
                        self.enter_reconnect_loop().await;
                    }
                }
                _ = tokio::time::sleep_until(no_data_deadline) => {
                    warn!("no-data timeout, self-triggering reconnect");
                    self.enter_reconnect_loop().await;
                }
                Some(cmd) = command_rx.recv() => {
                    if self.handle_command(cmd).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns true when the task should stop.
    async fn handle_command(&self, command: Command) -> bool {
        match command {
            Command::TriggerReconnect => {
                let transport = {
                    let state = self.state.lock().await;
                    state.transport.clone()
                };
                if let Some(transport) = transport {
                    let _ = transport.close().await;
                }
                self.enter_reconnect_loop().await;
                false
            }
            Command::Dispose(ack) => {
                self.disposed.store(true, Ordering::Release);
                let (subscriptions, transport) = {
                    let mut state = self.state.lock().await;
                    state.status = ConnectionStatus::Disposed;
                    let subs: Vec<Arc<dyn SubscriptionHandle>> = state.subscriptions.values().cloned().collect();
                    for (_, responder) in state.pending_queries.drain(..) {
                        let _ = responder.send(Err(Error::CancellationRequested));
                    }
                    (subs, state.transport.take())
                };

                if let Some(transport) = &transport {
                    for subscription in &subscriptions {
                        if let Some(query) = subscription.unsub_query() {
                            if let Ok(bytes) = serde_json::to_vec(query.payload()) {
                                let _ = transport.send(bytes).await;
                            }
                        }
                    }
                    let _ = transport.close().await;
                }

                let _ = ack.send(());
                true
            }
        }
    }
}

#[async_trait::async_trait]
impl QuerySender for Connection {
    #[instrument(skip(self, query, cancel), fields(request_id = query.request_id()))]
    async fn send_and_wait_query(&self, query: Query, cancel: CancellationToken) -> Result<Value> {
        for limiter in &self.rate_limiters {
            limiter.acquire(1).await?;
        }

        let (responder_tx, responder_rx) = oneshot::channel();
        let transport = {
            let mut state = self.state.lock().await;
            if state.paused_activity {
                return Err(Error::server_error("socket paused"));
            }
            let transport = state.transport.clone().ok_or(Error::ConnectionLost)?;
            state.pending_queries.push((query.clone(), responder_tx));
            transport
        };

        let bytes = serde_json::to_vec(query.payload()).map_err(|e| Error::from(anyhow::Error::new(e)))?;
        transport.send(bytes).await?;

        tokio::select! {
            result = responder_rx => result.map_err(|_| Error::ConnectionLost)?,
            _ = cancel.cancelled() => {
                self.remove_pending_query(query.request_id()).await;
                Err(Error::CancellationRequested)
            }
            _ = tokio::time::sleep(query.timeout()) => {
                self.remove_pending_query(query.request_id()).await;
                Err(Error::CancellationRequested)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{DefaultMessageIdentifier, Pipeline};
    use crate::subscription::{SystemSubscription, TypedSubscriptionBuilder};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockTransportInner {
        sent: Vec<Vec<u8>>,
        inbound: Vec<Option<Result<Vec<u8>>>>,
    }

    struct MockTransport {
        id: u64,
        inner: StdMutex<MockTransportInner>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn id(&self) -> u64 {
            self.id
        }

        async fn send(&self, message: Vec<u8>) -> Result<()> {
            self.inner.lock().unwrap().sent.push(message);
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn next_message(&self) -> Option<Result<Vec<u8>>> {
            let next = self.inner.lock().unwrap().inbound.pop();
            match next {
                Some(v) => v,
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct MockFactory;

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn open(&self, _params: TransportParams) -> Result<Box<dyn Transport>> {
            Ok(Box::new(MockTransport {
                id: 1,
                inner: StdMutex::new(MockTransportInner::default()),
            }))
        }
    }

    fn test_options() -> Arc<ClientOptions> {
        Arc::new(ClientOptions::builder("wss://example.com").build())
    }

    #[tokio::test]
    async fn connect_transitions_to_connected() {
        let pipeline = Arc::new(Pipeline::new(Arc::new(DefaultMessageIdentifier), None));
        let connection = Connection::spawn(
            1,
            "wss://example.com".into(),
            "wss://example.com".into(),
            test_options(),
            Arc::new(MockFactory),
            pipeline,
            None,
            Vec::new(),
            vec![Arc::new(SystemSubscription::new(["ping"]))],
        );

        connection.connect(false).await.unwrap();
        assert_eq!(connection.status().await, ConnectionStatus::Connected);
        assert_eq!(connection.user_subscription_count().await, 0);
    }

    #[tokio::test]
    async fn can_add_subscription_respects_combine_target() {
        let pipeline = Arc::new(Pipeline::new(Arc::new(DefaultMessageIdentifier), None));
        let connection = Connection::spawn(
            1,
            "wss://example.com".into(),
            "wss://example.com".into(),
            test_options(),
            Arc::new(MockFactory),
            pipeline,
            None,
            Vec::new(),
            Vec::new(),
        );

        connection.connect(false).await.unwrap();
        assert!(connection.can_add_subscription().await);

        connection.add_subscription(Arc::new(SystemSubscription::new(["x"]))).await;
        // still eligible regardless of load; capacity is the Client's decision
        assert!(connection.can_add_subscription().await);
    }

    #[tokio::test]
    async fn query_response_does_not_leak_to_subscriptions_by_default() {
        let pipeline = Arc::new(Pipeline::new(Arc::new(DefaultMessageIdentifier), None));
        let sub = Arc::new(SystemSubscription::new(["x"]));
        let connection = Connection::spawn(
            1,
            "wss://example.com".into(),
            "wss://example.com".into(),
            test_options(),
            Arc::new(MockFactory),
            pipeline,
            None,
            Vec::new(),
            vec![sub.clone()],
        );

        let value = serde_json::json!({"id": "x", "result": "ok"});
        let (tx, rx) = oneshot::channel();
        let query = Query::new(serde_json::Value::Null, false, |msg| msg.get("id") == Some(&serde_json::Value::from("x")));
        connection.state.lock().await.pending_queries.push((query, tx));

        connection.dispatch_parsed(&["x".to_string()], &value).await;

        assert_eq!(rx.await.unwrap().unwrap(), value);
        assert_eq!(sub.total_invocations(), 0);
    }

    #[tokio::test]
    async fn query_response_leaks_to_subscriptions_when_opted_in() {
        let pipeline = Arc::new(Pipeline::new(Arc::new(DefaultMessageIdentifier), None));
        let sub = Arc::new(SystemSubscription::new(["x"]));
        let connection = Connection::spawn(
            1,
            "wss://example.com".into(),
            "wss://example.com".into(),
            test_options(),
            Arc::new(MockFactory),
            pipeline,
            None,
            Vec::new(),
            vec![sub.clone()],
        );

        let value = serde_json::json!({"id": "x", "result": "ok"});
        let (tx, rx) = oneshot::channel();
        let query = Query::new(serde_json::Value::Null, false, |msg| msg.get("id") == Some(&serde_json::Value::from("x")))
            .with_continue_on_query_response(true);
        connection.state.lock().await.pending_queries.push((query, tx));

        connection.dispatch_parsed(&["x".to_string()], &value).await;

        assert_eq!(rx.await.unwrap().unwrap(), value);
        assert_eq!(sub.total_invocations(), 1);
    }

    #[tokio::test]
    async fn reconnect_resubscribes_and_restores_confirmed_state() {
        struct SequencedFactory {
            calls: StdAtomicUsize,
        }

        #[async_trait]
        impl TransportFactory for SequencedFactory {
            async fn open(&self, _params: TransportParams) -> Result<Box<dyn Transport>> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    Ok(Box::new(MockTransport {
                        id: 1,
                        inner: StdMutex::new(MockTransportInner {
                            inbound: vec![Some(Err(Error::ConnectionLost))],
                            ..Default::default()
                        }),
                    }))
                } else {
                    Ok(Box::new(MockTransport {
                        id: 2,
                        inner: StdMutex::new(MockTransportInner {
                            inbound: vec![Some(Ok(br#"{"result":"sub-ack"}"#.to_vec()))],
                            ..Default::default()
                        }),
                    }))
                }
            }
        }

        let pipeline = Arc::new(Pipeline::new(Arc::new(DefaultMessageIdentifier), None));
        let (handle, _typed) = TypedSubscriptionBuilder::<serde_json::Value>::new()
            .with_identifier("btcusdt@trade")
            .with_sub_query(|| {
                Some(
                    Query::new(serde_json::json!({"op": "sub"}), false, |msg| msg.get("result").is_some())
                        .with_timeout(Duration::from_millis(200)),
                )
            })
            .build();

        let connection = Connection::spawn(
            1,
            "wss://example.com".into(),
            "wss://example.com".into(),
            test_options(),
            Arc::new(SequencedFactory { calls: StdAtomicUsize::new(0) }),
            pipeline,
            None,
            Vec::new(),
            Vec::new(),
        );

        connection.connect(false).await.unwrap();
        connection.add_subscription(handle.clone()).await;
        handle.mark_confirmed();

        // Give the background task time to read the injected error, run the
        // reconnect loop (open the second transport, resend the sub-query,
        // consume the queued ack), and settle back into Connected.
        for _ in 0..50 {
            if connection.status().await == ConnectionStatus::Connected && handle.is_confirmed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(connection.status().await, ConnectionStatus::Connected);
        assert!(handle.is_confirmed());
    }
}
