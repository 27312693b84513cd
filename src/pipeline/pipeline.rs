use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{MessageIdentifier, MessageInterceptor};

/// A frame that survived parsing, carrying its routing identifiers and parsed envelope.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub identifiers: Vec<String>,
    pub value: Value,
    pub raw: Option<Vec<u8>>,
}

/// Result of running one inbound frame through the pipeline.
pub enum ParseOutcome {
    Parsed(ParsedMessage),
    /// Pre-processing or JSON decoding failed; routed to the `UnparsedMessage` sink.
    Unparseable(Vec<u8>),
}

/**
 * Pre-process, then identify, pipeline stages. Type-resolution and decode
 * happen one level up, per-subscription, since the concrete payload type
 * depends on which subscription is receiving the frame.
 */
pub struct Pipeline {
    interceptor: Option<Arc<dyn MessageInterceptor>>,
    identifier: Arc<dyn MessageIdentifier>,
    keep_raw: bool,
}

impl Pipeline {
    pub fn new(identifier: Arc<dyn MessageIdentifier>, interceptor: Option<Arc<dyn MessageInterceptor>>) -> Self {
        Self {
            interceptor,
            identifier,
            keep_raw: false,
        }
    }

    /// Corresponds to `ClientOptions::output_original_data`: retain the raw frame bytes
    /// on each parsed message for callers that want them.
    pub fn with_keep_raw(mut self, keep_raw: bool) -> Self {
        self.keep_raw = keep_raw;
        self
    }

    pub fn parse(&self, raw: Vec<u8>) -> ParseOutcome {
        let processed = match &self.interceptor {
            Some(interceptor) => interceptor.intercept(raw),
            None => raw,
        };

        let value: Value = match serde_json::from_slice(&processed) {
            Ok(value) => value,
            Err(error) => {
                debug!(%error, "unparseable inbound frame");
                return ParseOutcome::Unparseable(processed);
            }
        };

        let identifiers = self.identifier.identify(&value);
        let raw = if self.keep_raw { Some(processed) } else { None };

        ParseOutcome::Parsed(ParsedMessage {
            identifiers,
            value,
            raw,
        })
    }
}
