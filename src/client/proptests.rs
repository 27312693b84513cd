//! Property tests for the invariants named in spec §8: the sum of each
//! connection's `user_subscription_count` always equals the number of live
//! user subscriptions, and every connection handed to a new subscriber is
//! `None`/`Connected` at hand-out time. Declared as `proptest` strategies
//! over random subscribe/unsubscribe sequences rather than fixed scenarios,
//! since the fixed end-to-end scenarios already live alongside `subscribe`
//! in `api.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::config::ClientOptions;
use crate::error::Result as CrateResult;
use crate::pipeline::DefaultMessageIdentifier;
use crate::subscription::{SubscriptionHandle, TypedSubscriptionBuilder};
use crate::transport::{Transport, TransportFactory, TransportParams};

use super::api::SocketApiClient;

struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
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

struct NullFactory;

#[async_trait]
impl TransportFactory for NullFactory {
    async fn open(&self, _params: TransportParams) -> CrateResult<Box<dyn Transport>> {
        Ok(Box::new(NullTransport))
    }
}

#[derive(Debug, Clone)]
enum Operation {
    Subscribe,
    UnsubscribeOldest,
}

fn operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![3 => Just(Operation::Subscribe), 1 => Just(Operation::UnsubscribeOldest)]
}

fn run_sequence(combine_target: usize, max_connections: usize, ops: Vec<Operation>) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async move {
        let options = ClientOptions::builder("wss://example.com")
            .with_combine_target(combine_target)
            .with_max_socket_connections(max_connections)
            .build();
        let client = SocketApiClient::new(options, Arc::new(NullFactory), Arc::new(DefaultMessageIdentifier));

        let mut live: Vec<u64> = Vec::new();
        let mut next_stream = 0u32;

        for op in ops {
            match op {
                Operation::Subscribe => {
                    let identifier = format!("stream{next_stream}");
                    next_stream += 1;
                    let sub: Arc<dyn SubscriptionHandle> =
                        TypedSubscriptionBuilder::<serde_json::Value>::new().with_identifier(identifier).build().0;
                    let id = client.subscribe(sub, CancellationToken::new()).await.unwrap();
                    live.push(id);
                }
                Operation::UnsubscribeOldest => {
                    if !live.is_empty() {
                        let id = live.remove(0);
                        assert!(client.unsubscribe(id).await);
                    }
                }
            }

            let mut total = 0usize;
            for entry in client.connections().iter() {
                assert!(entry.value().status().await.is_eligible_for_handout());
                total += entry.value().user_subscription_count().await;
            }
            assert_eq!(total, live.len(), "sum(user_subscription_count) must equal live user subscriptions");
        }
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Invariant 1: for all sequences of subscribe/unsubscribe operations,
    /// `sum(user_subscription_count over connections) == count(live user subscriptions)`
    /// holds after every single operation, regardless of combine target or pool cap.
    #[test]
    fn subscription_count_invariant_holds_across_random_sequences(
        combine_target in 1usize..4,
        max_connections in 1usize..4,
        ops in prop::collection::vec(operation_strategy(), 1..20),
    ) {
        run_sequence(combine_target, max_connections, ops);
    }
}
