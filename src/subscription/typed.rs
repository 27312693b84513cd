use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::Error;
use crate::query::Query;

use super::core::{DecodeFn, QueryBuilder, SubscriptionCore};
use super::{next_subscription_id, SubscriptionHandle};

const DEFAULT_BUFFER_SIZE: usize = 256;

/**
 * Ergonomic, caller-facing receiver for one subscription's decoded events.
 *
 * Callers `recv()` typed events off a bounded broadcast channel fed by the
 * connection's dispatch loop.
 */
pub struct TypedSubscription<T> {
    id: u64,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> TypedSubscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> std::result::Result<T, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Adapts this subscription into a [`futures_util::Stream`] for callers who
    /// want to `select!`/combine it with other streams rather than calling
    /// `recv()` in a loop. Yields `Err` on a missed-messages lag, mirroring
    /// `broadcast::Receiver`'s own lag reporting.
    pub fn into_stream(self) -> BroadcastStream<T> {
        BroadcastStream::new(self.receiver)
    }
}

/// Builds a [`SubscriptionHandle`] and its paired [`TypedSubscription`] receiver.
pub struct TypedSubscriptionBuilder<T> {
    authenticated: bool,
    buffer_size: usize,
    identifiers: Vec<String>,
    sub_query: QueryBuilder,
    unsub_query: QueryBuilder,
    revitalize: Option<Arc<dyn Fn() + Send + Sync>>,
    _marker: PhantomData<T>,
}

impl<T> Default for TypedSubscriptionBuilder<T> {
    fn default() -> Self {
        Self {
            authenticated: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            identifiers: Vec::new(),
            sub_query: Arc::new(|| None),
            unsub_query: Arc::new(|| None),
            revitalize: None,
            _marker: PhantomData,
        }
    }
}

impl<T> TypedSubscriptionBuilder<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifiers.push(identifier.into());
        self
    }

    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_sub_query(mut self, builder: impl Fn() -> Option<Query> + Send + Sync + 'static) -> Self {
        self.sub_query = Arc::new(builder);
        self
    }

    pub fn with_unsub_query(mut self, builder: impl Fn() -> Option<Query> + Send + Sync + 'static) -> Self {
        self.unsub_query = Arc::new(builder);
        self
    }

    pub fn with_revitalize(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.revitalize = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> (Arc<dyn SubscriptionHandle>, TypedSubscription<T>) {
        let (sender, receiver) = broadcast::channel(self.buffer_size);

        let decode: DecodeFn = Arc::new(|value: Value| {
            serde_json::from_value::<T>(value)
                .map(|typed| Box::new(typed) as Box<dyn Any + Send>)
                .map_err(|err| Error::from(anyhow::Error::new(err)))
        });

        let mut type_mapping = HashMap::new();
        for identifier in &self.identifiers {
            type_mapping.insert(identifier.clone(), decode.clone());
        }

        let id = next_subscription_id();
        let dispatch_sender = sender.clone();
        let core = SubscriptionCore::new(
            id,
            self.authenticated,
            self.identifiers,
            type_mapping,
            Arc::new(move |boxed: Box<dyn Any + Send>| {
                if let Ok(typed) = boxed.downcast::<T>() {
                    let _ = dispatch_sender.send(*typed);
                }
            }),
            self.sub_query,
            self.unsub_query,
            self.revitalize,
        );

        (Arc::new(core), TypedSubscription { id, receiver })
    }
}
