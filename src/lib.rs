pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod query;
pub mod rate_limit;
pub mod socket;
pub mod subscription;
pub mod transport;

pub use client::{PeriodicHandle, SocketApiClient};
pub use config::{ClientOptions, ClientOptionsBuilder};
pub use error::{Error, Result};
pub use query::{Query, QuerySender};
pub use socket::{Connection, ConnectionStatus, SocketId};
pub use subscription::{SubscriptionHandle, SystemSubscription, TypedSubscription, TypedSubscriptionBuilder};
pub use transport::{Transport, TransportFactory, TransportParams, TungsteniteTransportFactory};
