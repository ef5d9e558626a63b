//! Everything a connection needs, built once at startup.

use std::sync::Arc;

use tandem_agent::{ContextAssembler, ContextSettings, GenerationGateway, RelevanceEngine};
use tandem_config::AppConfig;
use tandem_core::{
    ChatHistory, EventBus, IdentityValidator, InputLimits, MemoryStore, OwnerDirectory,
    SessionStore,
};

use crate::registry::ConnectionRegistry;

/// Shared services for every connection. Passed explicitly, never global.
pub struct ServerContext {
    pub validator: Arc<dyn IdentityValidator>,
    pub sessions: Arc<dyn SessionStore>,
    pub history: Arc<dyn ChatHistory>,
    pub assembler: Arc<ContextAssembler>,
    pub generation: Arc<GenerationGateway>,
    pub registry: Arc<ConnectionRegistry>,
    pub events: Arc<EventBus>,
    pub limits: InputLimits,
    /// Chat turns sent to the model per reply.
    pub history_window: usize,
}

impl ServerContext {
    /// Wire every capability to one store backend.
    pub fn from_store<S>(
        store: Arc<S>,
        generation: Arc<GenerationGateway>,
        events: Arc<EventBus>,
        config: &AppConfig,
    ) -> Self
    where
        S: IdentityValidator
            + OwnerDirectory
            + SessionStore
            + ChatHistory
            + MemoryStore
            + 'static,
    {
        let assembler = ContextAssembler::new(store.clone(), store.clone(), store.clone())
            .with_relevance(RelevanceEngine::new(config.context.relevance_top_k))
            .with_settings(ContextSettings::from(&config.context));

        Self {
            validator: store.clone(),
            sessions: store.clone(),
            history: store,
            assembler: Arc::new(assembler),
            generation,
            registry: Arc::new(ConnectionRegistry::new()),
            events,
            limits: config.input_limits(),
            history_window: config.context.history_window,
        }
    }
}
