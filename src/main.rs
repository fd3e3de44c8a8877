use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mediaforge::api::{self, AppState};
use mediaforge::artifact::LocalArtifactStore;
use mediaforge::audit::AuditSink;
use mediaforge::catalog::Catalog;
use mediaforge::config::Config;
use mediaforge::db::Db;
use mediaforge::job::JobStore;
use mediaforge::ledger::Ledger;
use mediaforge::orchestrator::Orchestrator;
use mediaforge::provider::http::HttpProvider;
use mediaforge::provider::ProviderRegistry;
use mediaforge::ratelimit::{FixedCap, RateLimiter};
use mediaforge::watchdog::Watchdog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("MEDIAFORGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./mediaforge.yaml"));
    let config = Config::load(Some(&config_path))?;
    std::fs::create_dir_all(&config.data_dir)?;

    let db = Db::open(&config.db_path())?;
    let audit = AuditSink::new(Arc::clone(&db));
    let ledger = Ledger::new(Arc::clone(&db), audit);
    let jobs = JobStore::new(Arc::clone(&db));

    let catalog = match &config.catalog_path {
        Some(path) => Catalog::load(path)?,
        None => Catalog::builtin(),
    };

    let mut providers = ProviderRegistry::new();
    for descriptor in catalog.providers() {
        let api_key = descriptor
            .credentials_ref
            .as_deref()
            .and_then(|name| std::env::var(name.to_uppercase()).ok());
        if api_key.is_none() {
            tracing::warn!(provider = %descriptor.provider_id, "no credentials configured");
        }
        providers.register(Arc::new(HttpProvider::new(descriptor.clone(), api_key)?));
    }

    let artifacts = Arc::new(LocalArtifactStore::new(
        config.artifacts_dir(),
        format!("http://{}/artifacts", config.bind_addr),
    ));
    let limiter = RateLimiter::rolling_hour(Arc::new(FixedCap(config.default_rate_cap)));

    let orchestrator = Orchestrator::new(
        catalog,
        ledger,
        jobs,
        providers,
        artifacts,
        limiter,
        config.poll.clone(),
    );

    let shutdown = CancellationToken::new();
    let watchdog = Watchdog::new(orchestrator.clone(), config.watchdog.clone());
    let watchdog_shutdown = shutdown.clone();
    tokio::spawn(async move {
        watchdog.run(watchdog_shutdown).await;
    });

    let result = api::serve(&config.bind_addr, AppState { orchestrator }).await;
    shutdown.cancel();
    result
}
