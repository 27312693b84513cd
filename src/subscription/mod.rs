mod core;
mod handle;
mod system;
mod typed;

pub use handle::SubscriptionHandle;
pub use system::SystemSubscription;
pub use typed::{TypedSubscription, TypedSubscriptionBuilder};

pub(crate) use core::SubscriptionCore;

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_subscription_id() -> u64 {
    NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed)
}
