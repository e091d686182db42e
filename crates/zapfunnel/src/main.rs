use std::sync::Arc;

use tracing::{info, warn};

use zapfunnel_core::{
    config::Config,
    contacts::ContactBook,
    dispatch::Dispatcher,
    engine::FunnelEngine,
    events::EventProcessor,
    funnel::FunnelRegistry,
    idempotency::IdempotencyGuard,
    snapshot::{self, ContactsSnapshot, ConversationsSnapshot, FunnelExport, StatsSnapshot},
    stats::DailyStats,
    store::ConversationStore,
};
use zapfunnel_evolution::EvolutionClient;
use zapfunnel_http::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    zapfunnel_core::logging::init("zapfunnel")?;

    let cfg = Arc::new(Config::load()?);

    let gateway = Arc::new(EvolutionClient::new(
        cfg.gateway_base_url.clone(),
        cfg.gateway_api_key.clone(),
        cfg.send_timeout,
    ));

    let registry = Arc::new(FunnelRegistry::with_builtins());
    let store = Arc::new(ConversationStore::new());
    let stats = Arc::new(DailyStats::new());
    let contacts = Arc::new(ContactBook::new());
    let dispatcher = Arc::new(Dispatcher::new(
        cfg.instances.clone(),
        gateway,
        store.clone(),
        stats.clone(),
    ));
    let guard = Arc::new(IdempotencyGuard::new(cfg.idempotency_ttl));
    let engine = FunnelEngine::new(
        cfg.clone(),
        registry.clone(),
        store.clone(),
        dispatcher.clone(),
        guard.clone(),
        contacts.clone(),
    );
    let processor = Arc::new(EventProcessor::new(
        cfg.clone(),
        engine.clone(),
        registry.clone(),
        store.clone(),
        guard,
        stats.clone(),
    ));

    restore_snapshots(&cfg, &registry, &store, &contacts, &stats).await;
    info!(
        funnels = registry.len().await,
        conversations = store.len().await,
        contacts = contacts.total().await,
        instances = cfg.instances.len(),
        "state restored"
    );

    spawn_autosave(
        cfg.clone(),
        registry.clone(),
        store.clone(),
        contacts.clone(),
        stats.clone(),
    );

    let state = AppState {
        cfg: cfg.clone(),
        processor,
        engine,
        registry,
        store,
        dispatcher,
        stats,
        contacts,
    };
    zapfunnel_http::serve(state, cfg.http_port).await?;

    Ok(())
}

async fn restore_snapshots(
    cfg: &Config,
    registry: &FunnelRegistry,
    store: &ConversationStore,
    contacts: &ContactBook,
    stats: &DailyStats,
) {
    let dir = &cfg.data_dir;

    match snapshot::load_json::<FunnelExport>(&dir.join("funnels.json")) {
        Ok(Some(doc)) => {
            let (imported, skipped) = registry.import(doc).await;
            info!(imported, skipped, "funnels restored from backup");
        }
        Ok(None) => info!("no funnel backup found, using built-ins"),
        Err(e) => warn!(error = %e, "failed to load funnel backup"),
    }

    match snapshot::load_json::<ConversationsSnapshot>(&dir.join("conversations.json")) {
        Ok(Some(snap)) => {
            let count = snap.conversations.len();
            store.restore(snap).await;
            info!(count, "conversations restored");
        }
        Ok(None) => info!("no prior conversations found"),
        Err(e) => warn!(error = %e, "failed to load conversations"),
    }

    match snapshot::load_json::<ContactsSnapshot>(&dir.join("contacts.json")) {
        Ok(Some(snap)) => {
            contacts.restore(snap).await;
            info!(total = contacts.total().await, "contacts restored");
        }
        Ok(None) => info!("no prior contacts found"),
        Err(e) => warn!(error = %e, "failed to load contacts"),
    }

    match snapshot::load_json::<StatsSnapshot>(&dir.join("daily-stats.json")) {
        Ok(Some(snap)) => stats.restore(snap).await,
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to load daily stats"),
    }
}

fn spawn_autosave(
    cfg: Arc<Config>,
    registry: Arc<FunnelRegistry>,
    store: Arc<ConversationStore>,
    contacts: Arc<ContactBook>,
    stats: Arc<DailyStats>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(cfg.snapshot_interval);
        tick.tick().await; // the first tick fires immediately
        loop {
            tick.tick().await;
            if let Err(e) = save_snapshots(&cfg, &registry, &store, &contacts, &stats).await {
                warn!(error = %e, "snapshot autosave failed");
            }
        }
    });
}

async fn save_snapshots(
    cfg: &Config,
    registry: &FunnelRegistry,
    store: &ConversationStore,
    contacts: &ContactBook,
    stats: &DailyStats,
) -> zapfunnel_core::Result<()> {
    let dir = &cfg.data_dir;
    snapshot::save_json(&dir.join("funnels.json"), &registry.export().await)?;
    snapshot::save_json(&dir.join("conversations.json"), &store.snapshot().await)?;
    snapshot::save_json(&dir.join("contacts.json"), &contacts.snapshot().await)?;
    snapshot::save_json(&dir.join("daily-stats.json"), &stats.snapshot().await)?;
    Ok(())
}
