//! Application state wiring all services together.
//!
//! The turn service is generic over its chat and profile repositories;
//! AppState pins it to the SQLite implementations behind the in-memory
//! recent-message cache.

use std::sync::Arc;

use companion_core::cache::repository::CachedChatRepository;
use companion_core::ledger::BoxIdentityProvider;
use companion_core::llm::box_provider::BoxLlmProvider;
use companion_core::persona::BoxPersonaProvider;
use companion_core::speech::box_provider::BoxSpeechProvider;
use companion_core::turn::{TurnDeps, TurnService};
use companion_infra::cache::InMemoryMessageCache;
use companion_infra::config::{load_config, resolve_data_dir, resolve_llm_api_key};
use companion_infra::llm::create_provider;
use companion_infra::speech::HttpSpeechProvider;
use companion_infra::sqlite::chat::SqliteChatRepository;
use companion_infra::sqlite::identity::SqliteIdentityProvider;
use companion_infra::sqlite::persona::SqlitePersonaProvider;
use companion_infra::sqlite::pool::{DatabasePool, database_url};
use companion_infra::sqlite::profile::SqliteProfileRepository;
use companion_types::config::CompanionConfig;

/// Chat store as seen by the turn service.
pub type ConcreteChatRepository = CachedChatRepository<SqliteChatRepository, InMemoryMessageCache>;

pub type ConcreteTurnService = TurnService<ConcreteChatRepository, SqliteProfileRepository>;

/// Shared application state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub turns: Arc<ConcreteTurnService>,
}

impl AppState {
    /// Initialize the application state: load config, connect to the DB,
    /// wire collaborators.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;

        tracing::info!(data_dir = %data_dir.display(), "database ready");
        Self::from_parts(config, db_pool)
    }

    /// Wire services over an open pool.
    pub fn from_parts(config: CompanionConfig, db_pool: DatabasePool) -> anyhow::Result<Self> {
        let api_key = resolve_llm_api_key(&config.llm);
        let llm = create_provider(&config.llm, api_key.as_deref())?;

        let speech = if config.speech.is_active() {
            let provider = HttpSpeechProvider::from_config(&config.speech)?;
            tracing::info!(
                voices = config.speech.voices.len(),
                "speech synthesis enabled"
            );
            Some(Arc::new(BoxSpeechProvider::new(provider)))
        } else {
            tracing::info!("speech synthesis disabled");
            None
        };

        let cache = Arc::new(InMemoryMessageCache::from_config(&config.cache));
        let chat = Arc::new(CachedChatRepository::new(
            Arc::new(SqliteChatRepository::new(db_pool.clone())),
            cache,
        ));

        let deps = TurnDeps {
            chat,
            profiles: Arc::new(SqliteProfileRepository::new(db_pool.clone())),
            llm: Arc::new(llm),
            personas: Arc::new(BoxPersonaProvider::new(SqlitePersonaProvider::new(
                db_pool.clone(),
            ))),
            identity: Arc::new(BoxIdentityProvider::new(SqliteIdentityProvider::new(db_pool))),
            speech,
            knowledge: None,
        };

        Ok(Self {
            turns: Arc::new(TurnService::new(deps, config)),
        })
    }
}
