//! Application state — generalized from the teacher's `AppState` (same
//! Clone-friendly Arc/PgPool shape, gateway-specific fields instead of the
//! teacher's agent/MCP/tool-executor fields).

use std::sync::Arc;
use std::time::Instant;

use sqlx::PgPool;

use crate::concurrency::ConcurrencyLedger;
use crate::config::Config;
use crate::logging_queue::BackgroundLogQueue;
use crate::store::pg::PgStore;
use crate::store::StoreAdapter;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct Settings {
    pub hash_salt: String,
    pub key_hash_pepper: String,
    pub upstream_base_url: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let hash_salt = std::env::var("HASH_SALT").unwrap_or_default();
        let key_hash_pepper = std::env::var("KEY_HASH_PEPPER").unwrap_or_default();

        if let Err(err) = crate::security::validate_hash_config(&hash_salt, &key_hash_pepper) {
            tracing::error!("fatal configuration error: {err}");
            std::process::exit(1);
        }

        let upstream_base_url =
            std::env::var("UPSTREAM_BASE_URL").unwrap_or_else(|_| "http://upstream:4000".to_string());

        Self { hash_salt, key_hash_pepper, upstream_base_url }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StoreAdapter>,
    pub config: Arc<Config>,
    pub settings: Settings,
    pub upstream: Arc<UpstreamClient>,
    pub concurrency: ConcurrencyLedger,
    pub log_queue: BackgroundLogQueue,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(db: PgPool, settings: Settings) -> Self {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        let store: Arc<dyn StoreAdapter> = Arc::new(PgStore::new(db));
        let log_queue = BackgroundLogQueue::spawn(store.clone());

        Self {
            store,
            config: Arc::new(Config::load()),
            upstream: Arc::new(UpstreamClient::new(http_client, settings.upstream_base_url.clone())),
            settings,
            concurrency: ConcurrencyLedger::new(),
            log_queue,
            start_time: Instant::now(),
        }
    }

    /// Test-only constructor — backed by `FakeStore` so no live Postgres is
    /// required, following the teacher's `AppState::new_test` convention.
    #[doc(hidden)]
    pub fn new_test() -> Self {
        use crate::store::fake::FakeStore;

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");

        let store: Arc<dyn StoreAdapter> = Arc::new(FakeStore::new());
        let log_queue = BackgroundLogQueue::spawn(store.clone());
        let settings = Settings {
            hash_salt: "test-salt".to_string(),
            key_hash_pepper: "test-pepper".to_string(),
            upstream_base_url: "http://127.0.0.1:0".to_string(),
        };

        Self {
            store,
            config: Arc::new(Config::load()),
            upstream: Arc::new(UpstreamClient::new(http_client, settings.upstream_base_url.clone())),
            settings,
            concurrency: ConcurrencyLedger::new(),
            log_queue,
            start_time: Instant::now(),
        }
    }
}
