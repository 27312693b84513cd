use serde_json::Value;

use crate::error::Result;
use crate::query::Query;

/**
 * Object-safe capability set a Socket Connection drives every registered
 * subscription through: sub/unsub query construction, per-identifier decode
 * and dispatch, and confirmation bookkeeping, collapsed here into a trait
 * object so system subscriptions and typed user subscriptions can live side
 * by side in one connection's map.
 */
pub trait SubscriptionHandle: Send + Sync {
    /// Client-unique identity.
    fn id(&self) -> u64;

    /// Whether this subscription may only attach to an authenticated connection.
    fn authenticated(&self) -> bool;

    /// Fixed routing keys this subscription claims; set at construction and never mutated.
    fn stream_identifiers(&self) -> &[String];

    /// System subscriptions don't count against `user_subscription_count`.
    fn is_system(&self) -> bool {
        false
    }

    /// The request that must be answered OK before this subscription is `confirmed`.
    /// `None` for system subscriptions.
    fn sub_query(&self) -> Option<Query>;

    fn unsub_query(&self) -> Option<Query>;

    /// Refreshes any stored nonce/signature in the sub-query ahead of a resubscribe.
    fn revitalize_after_reconnect(&self) {}

    /// Dispatches one inbound frame matched by `identifier`. Handler failures are
    /// logged by the caller, never fatal to the connection.
    fn handle(&self, identifier: &str, value: Value) -> Result<()>;

    fn is_confirmed(&self) -> bool;

    /// Idempotent; becomes true exactly once per (re)connect cycle.
    fn mark_confirmed(&self);

    fn clear_confirmed(&self);

    fn total_invocations(&self) -> u64;
}
