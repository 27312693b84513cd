use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::query::{Query, QuerySender};
use crate::socket::{Connection, ConnectionStatus};

use super::api::SocketApiClient;

/**
 * Handle to a detached periodic-query task started by [`PeriodicHandle::start`].
 * Dropping or calling [`PeriodicHandle::stop`] signals the loop to exit after
 * its current tick; it does not abort mid-send.
 */
pub struct PeriodicHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PeriodicHandle {
    /// On each `interval` tick while the client isn't disposing, builds a query
    /// for every `Connected` connection via `build_query` and reports its
    /// outcome to `on_result`. A single connection's failure never stops the
    /// loop or the other connections' ticks that same round.
    pub fn start<B, R>(
        client: Arc<SocketApiClient>,
        identifier: impl Into<String>,
        interval: Duration,
        build_query: B,
        on_result: R,
    ) -> Self
    where
        B: Fn(&Connection) -> Option<Query> + Send + Sync + 'static,
        R: Fn(u64, Result<Value>) + Send + Sync + 'static,
    {
        let identifier = identifier.into();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                if client.is_disposing() {
                    return;
                }

                let connections: Vec<Arc<Connection>> =
                    client.connections().iter().map(|entry| entry.value().clone()).collect();

                for connection in connections {
                    if connection.status().await != ConnectionStatus::Connected {
                        continue;
                    }

                    let Some(query) = build_query(&connection) else {
                        continue;
                    };

                    let result = connection.send_and_wait_query(query, CancellationToken::new()).await;
                    on_result(connection.id(), result);
                }

                debug!(identifier = %identifier, "periodic query tick completed");
            }
        });

        Self { cancel, join }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> std::result::Result<(), JoinError> {
        self.cancel.cancel();
        self.join.await
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
