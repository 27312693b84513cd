use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::query::Query;

use super::{next_subscription_id, SubscriptionHandle};

/**
 * A subscription with no sub/unsub query, installed automatically on every
 * new Connection to absorb server-originated control frames (pings,
 * welcomes) so they don't fall through to `UnhandledMessage`.
 */
pub struct SystemSubscription {
    id: u64,
    stream_identifiers: Vec<String>,
    total_invocations: AtomicU64,
    confirmed: AtomicBool,
}

impl SystemSubscription {
    pub fn new(stream_identifiers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: next_subscription_id(),
            stream_identifiers: stream_identifiers.into_iter().map(Into::into).collect(),
            total_invocations: AtomicU64::new(0),
            confirmed: AtomicBool::new(true),
        }
    }
}

impl SubscriptionHandle for SystemSubscription {
    fn id(&self) -> u64 {
        self.id
    }

    fn authenticated(&self) -> bool {
        false
    }

    fn stream_identifiers(&self) -> &[String] {
        &self.stream_identifiers
    }

    fn is_system(&self) -> bool {
        true
    }

    fn sub_query(&self) -> Option<Query> {
        None
    }

    fn unsub_query(&self) -> Option<Query> {
        None
    }

    fn handle(&self, identifier: &str, value: Value) -> Result<()> {
        self.total_invocations.fetch_add(1, Ordering::Relaxed);
        debug!(identifier, message = %value, "system subscription absorbed control frame");
        Ok(())
    }

    fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    fn mark_confirmed(&self) {
        self.confirmed.store(true, Ordering::Release);
    }

    fn clear_confirmed(&self) {
        // System subscriptions have no handshake to lose; they stay confirmed across reconnects.
    }

    fn total_invocations(&self) -> u64 {
        self.total_invocations.load(Ordering::Relaxed)
    }
}
