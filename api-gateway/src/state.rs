//! Shared application state

use std::sync::Arc;

use paasbill_eventstore::EventStore;
use prometheus::Registry;

use crate::auth::Authenticator;

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: EventStore,
    pub authenticator: Arc<dyn Authenticator>,
    /// Collectors served on `/metrics`
    pub registry: Registry,
}

impl AppState {
    pub fn new(store: EventStore, authenticator: Arc<dyn Authenticator>, registry: Registry) -> Self {
        Self {
            store,
            authenticator,
            registry,
        }
    }
}
