use std::fmt::Write as _;
use std::time::Duration;

use crate::client::SocketApiClient;

/// Per-subscription facts surfaced in a [`ConnectionSnapshot`].
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub id: u64,
    pub confirmed: bool,
    pub total_invocations: u64,
    pub stream_identifiers: Vec<String>,
}

/// One connection's observable state.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub uri: String,
    pub status: String,
    pub authenticated: bool,
    pub subscriptions: Vec<SubscriptionSnapshot>,
}

async fn snapshot_connections(client: &SocketApiClient) -> Vec<ConnectionSnapshot> {
    let connections: Vec<_> = client.connections().iter().map(|entry| entry.value().clone()).collect();
    let mut snapshots = Vec::with_capacity(connections.len());

    for connection in connections {
        let subscriptions = connection
            .subscriptions()
            .await
            .into_iter()
            .map(|sub| SubscriptionSnapshot {
                id: sub.id(),
                confirmed: sub.is_confirmed(),
                total_invocations: sub.total_invocations(),
                stream_identifiers: sub.stream_identifiers().to_vec(),
            })
            .collect();

        snapshots.push(ConnectionSnapshot {
            id: connection.id(),
            uri: connection.connection_uri().to_string(),
            status: format!("{:?}", connection.status().await),
            authenticated: connection.authenticated().await,
            subscriptions,
        });
    }

    snapshots
}

/// Number of pooled connections currently tracked by the client.
pub fn current_connections(client: &SocketApiClient) -> usize {
    client.connections().len()
}

/// Total number of user (non-system) subscriptions across every connection.
pub async fn current_subscriptions(client: &SocketApiClient) -> usize {
    let mut total = 0;
    for entry in client.connections().iter() {
        total += entry.value().user_subscription_count().await;
    }
    total
}

/// Aggregate inbound throughput across every connection over `window`.
/// Resets each connection's byte counter, so callers should poll on a
/// steady cadence matching `window` rather than at arbitrary intervals.
pub async fn incoming_kbps(client: &SocketApiClient, window: Duration) -> f64 {
    let mut total = 0.0;
    for entry in client.connections().iter() {
        total += entry.value().incoming_kbps(window).await;
    }
    total
}

/// Renders a textual state dump: per-connection id, URI, status,
/// authenticated flag, then per-subscription id, confirmed flag,
/// invocation count, and stream identifiers.
pub async fn state_dump(client: &SocketApiClient) -> String {
    let snapshots = snapshot_connections(client).await;
    let mut out = String::new();

    for snapshot in &snapshots {
        let _ = writeln!(
            out,
            "connection {} [{}] status={} authenticated={}",
            snapshot.id, snapshot.uri, snapshot.status, snapshot.authenticated
        );
        for sub in &snapshot.subscriptions {
            let _ = writeln!(
                out,
                "  subscription {} confirmed={} invocations={} identifiers={:?}",
                sub.id, sub.confirmed, sub.total_invocations, sub.stream_identifiers
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::error::Result as CrateResult;
    use crate::pipeline::DefaultMessageIdentifier;
    use crate::subscription::TypedSubscriptionBuilder;
    use crate::transport::{Transport, TransportFactory, TransportParams};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct MockTransport;

    #[async_trait]
    impl Transport for MockTransport {
        fn id(&self) -> u64 {
            1
        }
        async fn send(&self, _message: Vec<u8>) -> CrateResult<()> {
            Ok(())
        }
        async fn ping(&self) -> CrateResult<()> {
            Ok(())
        }
        async fn next_message(&self) -> Option<CrateResult<Vec<u8>>> {
            std::future::pending().await
        }
        async fn close(&self) -> CrateResult<()> {
            Ok(())
        }
    }

    struct MockFactory;

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn open(&self, _params: TransportParams) -> CrateResult<Box<dyn Transport>> {
            Ok(Box::new(MockTransport))
        }
    }

    #[derive(Debug, Clone, Deserialize, PartialEq)]
    struct Trade {
        price: String,
    }

    #[tokio::test]
    async fn state_dump_lists_connection_and_subscription_facts() {
        // Best-effort: lets `cargo test -- --nocapture` show the `tracing` spans
        // this module and the connection/client modules emit. Harmless if a
        // subscriber from an earlier test in the same binary already won.
        let _ = tracing_subscriber::fmt::try_init();

        let options = ClientOptions::builder("wss://example.com").build();
        let client = SocketApiClient::new(options, Arc::new(MockFactory), Arc::new(DefaultMessageIdentifier));

        let (handle, _typed) = TypedSubscriptionBuilder::<Trade>::new().with_identifier("btcusdt@trade").build();
        client.subscribe(handle, CancellationToken::new()).await.unwrap();

        assert_eq!(current_connections(&client), 1);
        assert_eq!(current_subscriptions(&client).await, 1);

        let dump = state_dump(&client).await;
        assert!(dump.contains("connection 1"));
        assert!(dump.contains("btcusdt@trade"));
        assert!(dump.contains("confirmed=true"));
    }
}
