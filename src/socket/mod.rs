mod connection;
mod types;

pub use connection::Connection;
pub use types::{ConnectionStatus, SocketId};
