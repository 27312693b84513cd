mod factory;
mod tungstenite;

pub use factory::{Transport, TransportFactory, TransportParams};
pub use tungstenite::TungsteniteTransportFactory;
