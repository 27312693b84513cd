mod snapshot;

pub use snapshot::{current_connections, current_subscriptions, incoming_kbps, state_dump, ConnectionSnapshot};
