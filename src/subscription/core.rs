use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::query::Query;

use super::SubscriptionHandle;

pub(crate) type DecodeFn = Arc<dyn Fn(Value) -> Result<Box<dyn Any + Send>> + Send + Sync>;
pub(crate) type DispatchFn = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;
pub(crate) type QueryBuilder = Arc<dyn Fn() -> Option<Query> + Send + Sync>;

/**
 * Shared state backing every non-system [`SubscriptionHandle`] implementation:
 * a per-identifier decode function (`type_mapping`) plus a type-erased
 * dispatch closure that forwards the decoded value onward.
 */
pub(crate) struct SubscriptionCore {
    id: u64,
    authenticated: bool,
    stream_identifiers: Vec<String>,
    confirmed: AtomicBool,
    total_invocations: AtomicU64,
    type_mapping: HashMap<String, DecodeFn>,
    dispatch: DispatchFn,
    sub_query: QueryBuilder,
    unsub_query: QueryBuilder,
    revitalize: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl SubscriptionCore {
    pub(crate) fn new(
        id: u64,
        authenticated: bool,
        stream_identifiers: Vec<String>,
        type_mapping: HashMap<String, DecodeFn>,
        dispatch: DispatchFn,
        sub_query: QueryBuilder,
        unsub_query: QueryBuilder,
        revitalize: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            id,
            authenticated,
            stream_identifiers,
            confirmed: AtomicBool::new(false),
            total_invocations: AtomicU64::new(0),
            type_mapping,
            dispatch,
            sub_query,
            unsub_query,
            revitalize,
        }
    }
}

impl SubscriptionHandle for SubscriptionCore {
    fn id(&self) -> u64 {
        self.id
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn stream_identifiers(&self) -> &[String] {
        &self.stream_identifiers
    }

    fn sub_query(&self) -> Option<Query> {
        (self.sub_query)()
    }

    fn unsub_query(&self) -> Option<Query> {
        (self.unsub_query)()
    }

    fn revitalize_after_reconnect(&self) {
        if let Some(revitalize) = &self.revitalize {
            revitalize();
        }
    }

    fn handle(&self, identifier: &str, value: Value) -> Result<()> {
        let decode = self
            .type_mapping
            .get(identifier)
            .ok_or_else(|| Error::server_error(format!("no type mapping for identifier '{identifier}'")))?;
        let decoded = decode(value)?;
        self.total_invocations.fetch_add(1, Ordering::Relaxed);
        (self.dispatch)(decoded);
        Ok(())
    }

    fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    fn mark_confirmed(&self) {
        self.confirmed.store(true, Ordering::Release);
    }

    fn clear_confirmed(&self) {
        self.confirmed.store(false, Ordering::Release);
    }

    fn total_invocations(&self) -> u64 {
        self.total_invocations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn decode_identity() -> DecodeFn {
        Arc::new(|value: Value| Ok(Box::new(value) as Box<dyn Any + Send>))
    }

    #[test]
    fn handle_routes_through_type_mapping_and_dispatch() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        let mut type_mapping = HashMap::new();
        type_mapping.insert("trade".to_string(), decode_identity());

        let core = SubscriptionCore::new(
            1,
            false,
            vec!["trade".to_string()],
            type_mapping,
            Arc::new(move |value| {
                let value = *value.downcast::<Value>().unwrap();
                received_clone.lock().unwrap().push(value);
            }),
            Arc::new(|| None),
            Arc::new(|| None),
            None,
        );

        core.handle("trade", serde_json::json!({"price": 1})).unwrap();
        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(core.total_invocations(), 1);
    }

    #[test]
    fn handle_fails_for_unmapped_identifier() {
        let core = SubscriptionCore::new(
            1,
            false,
            vec!["trade".to_string()],
            HashMap::new(),
            Arc::new(|_| {}),
            Arc::new(|| None),
            Arc::new(|| None),
            None,
        );

        assert!(core.handle("trade", Value::Null).is_err());
    }

    #[test]
    fn confirmed_flag_is_idempotent_and_clearable() {
        let core = SubscriptionCore::new(
            1,
            false,
            vec![],
            HashMap::new(),
            Arc::new(|_| {}),
            Arc::new(|| None),
            Arc::new(|| None),
            None,
        );

        assert!(!core.is_confirmed());
        core.mark_confirmed();
        core.mark_confirmed();
        assert!(core.is_confirmed());
        core.clear_confirmed();
        assert!(!core.is_confirmed());
    }
}
