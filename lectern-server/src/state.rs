//! Shared application state: the wired pipeline behind every handler.

use lectern_core::config::LecternConfig;
use lectern_core::gateway::{ChatProvider, EmbeddingProvider, ModelGateway, Transcriber};
use lectern_core::{
    DocumentProcessor, IngestionCoordinator, MemoryRegistry, MemoryVectorIndex, Persistence,
    PromptGuard, RagAgent, RateLimiter, ResponseEvaluator, SemanticCache, TokenCounter,
    VectorIndex,
};
use std::sync::Arc;
use std::time::Duration;

/// Everything a request handler needs, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LecternConfig>,
    pub gateway: Arc<ModelGateway>,
    pub index: Arc<dyn VectorIndex>,
    pub cache: Arc<SemanticCache>,
    pub agent: Arc<RagAgent>,
    pub memory: Arc<MemoryRegistry>,
    pub ingestion: Arc<IngestionCoordinator>,
    pub persistence: Arc<dyn Persistence>,
    pub tenant_limiter: Arc<RateLimiter>,
    pub ip_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Production wiring: providers built from configuration, API keys
    /// resolved from the environment.
    pub fn new(
        config: LecternConfig,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, lectern_core::error::GatewayError> {
        let gateway = Arc::new(ModelGateway::from_config(&config.model, &config.resilience)?);
        Ok(Self::assemble(config, gateway, persistence))
    }

    /// Test/demo wiring with injected providers.
    pub fn with_providers(
        config: LecternConfig,
        chat_providers: Vec<Arc<dyn ChatProvider>>,
        embedder: Arc<dyn EmbeddingProvider>,
        transcriber: Arc<dyn Transcriber>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let gateway = Arc::new(ModelGateway::new(
            chat_providers,
            embedder,
            transcriber,
            &config.resilience,
        ));
        Self::assemble(config, gateway, persistence)
    }

    fn assemble(
        config: LecternConfig,
        gateway: Arc<ModelGateway>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let counter = Arc::new(TokenCounter::for_model(&config.model.chat_model));
        let index: Arc<dyn VectorIndex> = Arc::new(MemoryVectorIndex::new());
        let cache = Arc::new(SemanticCache::new(
            config.cache.tau_cache,
            config.cache.tau_cacheable,
            Duration::from_secs(config.cache.ttl_secs),
        ));
        let processor = Arc::new(DocumentProcessor::new(counter.clone(), &config.chunking));
        let ingestion = Arc::new(IngestionCoordinator::new(
            gateway.clone(),
            processor,
            index.clone(),
            cache.clone(),
            persistence.clone(),
            config.ingest.clone(),
        ));
        let agent = Arc::new(RagAgent::new(
            gateway.clone(),
            index.clone(),
            PromptGuard::new(),
            ResponseEvaluator::new(config.evaluation.tau_review),
            config.retrieval.clone(),
            config.agent.clone(),
            config.model.temperature,
            config.model.max_tokens,
        ));
        let memory = Arc::new(MemoryRegistry::new(counter, config.memory.clone()));
        let tenant_limiter = Arc::new(RateLimiter::per_minute(
            "tenant",
            config.limits.tenant_per_minute,
        ));
        let ip_limiter = Arc::new(RateLimiter::per_minute("ip", config.limits.ip_per_minute));

        Self {
            config: Arc::new(config),
            gateway,
            index,
            cache,
            agent,
            memory,
            ingestion,
            persistence,
            tenant_limiter,
            ip_limiter,
        }
    }
}
