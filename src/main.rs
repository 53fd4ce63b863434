//! Drive Collector entry point
//!
//! Composition root: every component is built here and wired explicitly,
//! no hidden singletons. The webhook router starts before anything else
//! and keeps listening even when other subsystems fail to boot, so the
//! health endpoint stays alive for the orchestrator.

use drive_collector::clock::SystemClock;
use drive_collector::config::AppConfig;
use drive_collector::coordinator::{
    CoordinatorConfig, InstanceCoordinator, InstanceStore, MemoryInstanceStore,
};
use drive_collector::dispatcher::{
    AuthGuard, Dispatcher, DriveConfigFlow, GroupAggregatorConfig,
};
use drive_collector::drive::DriveProviderFactory;
use drive_collector::kv::{CloudflareKv, KvProvider, KvStore, KvStoreConfig, MemoryKv, UpstashRedis};
use drive_collector::limits::RateLimiter;
use drive_collector::pipeline::{PipelineConfig, TaskManager};
use drive_collector::protocol::{
    BreakerConfig, CircuitBreaker, ClientSupervisor, DetachedTransport, SupervisorConfig,
};
use drive_collector::queue::{DisabledQueue, HttpQueuePublisher, TaskQueue};
use drive_collector::repository::d1::D1Client;
use drive_collector::repository::drives::D1DriveStore;
use drive_collector::repository::instances::D1InstanceStore;
use drive_collector::repository::settings::{D1SettingStore, MemorySettingStore, SettingStore};
use drive_collector::repository::tasks::{D1TaskStore, TaskRepositoryConfig};
use drive_collector::repository::{
    DriveStore, MemoryDriveStore, MemoryTaskStore, SessionStore, SettingsRepository,
    TaskRepository, TaskStore,
};
use drive_collector::server::{self, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("═══════════════════════════════════════════════");
    tracing::info!("  {} v{}", drive_collector::NAME, drive_collector::VERSION);
    tracing::info!("  distributed media-transfer pipeline");
    tracing::info!("═══════════════════════════════════════════════");

    let config = AppConfig::from_env()?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(8)
        .build()?;

    // --- KV facade: Cloudflare primary, Upstash backup ---
    let primary: Arc<dyn KvProvider> = match &config.cf_kv {
        Some(cf) => Arc::new(CloudflareKv::new(
            http.clone(),
            cf.account_id.clone(),
            cf.namespace_id.clone(),
            cf.token.clone(),
        )),
        None => {
            tracing::warn!("CF_KV_* not set; using in-process KV (single node only)");
            Arc::new(MemoryKv::new("memory"))
        }
    };
    let backup: Option<Arc<dyn KvProvider>> = config.upstash.as_ref().map(|upstash| {
        Arc::new(UpstashRedis::new(
            http.clone(),
            upstash.rest_url.clone(),
            upstash.rest_token.clone(),
        )) as Arc<dyn KvProvider>
    });
    if backup.is_some() {
        tracing::info!("KV failover enabled (Upstash backup configured)");
    }
    let kv = Arc::new(KvStore::new(primary, backup, KvStoreConfig::default()));

    // --- Durable stores ---
    let clock = Arc::new(SystemClock);
    let (task_store, drive_store, setting_store, instance_store): (
        Arc<dyn TaskStore>,
        Arc<dyn DriveStore>,
        Arc<dyn SettingStore>,
        Arc<dyn InstanceStore>,
    ) = match &config.d1 {
        Some(d1_config) => {
            let d1 = D1Client::new(http.clone(), d1_config.clone());
            if let Err(err) = d1.ensure_schema().await {
                tracing::error!(error = %err, "schema bootstrap failed; continuing");
            }
            (
                Arc::new(D1TaskStore::new(d1.clone())),
                Arc::new(D1DriveStore::new(d1.clone())),
                Arc::new(D1SettingStore::new(d1.clone())),
                Arc::new(D1InstanceStore::new(d1)),
            )
        }
        None => {
            tracing::warn!("CF_D1_* not set; using in-memory stores (data is not durable)");
            (
                Arc::new(MemoryTaskStore::new()),
                Arc::new(MemoryDriveStore::new()),
                Arc::new(MemorySettingStore::new()),
                Arc::new(MemoryInstanceStore::new()),
            )
        }
    };

    let repo = Arc::new(TaskRepository::new(
        task_store,
        clock.clone(),
        TaskRepositoryConfig::default(),
    ));
    let settings = Arc::new(SettingsRepository::new(kv.clone(), setting_store));
    let sessions = Arc::new(SessionStore::new(kv.clone()));

    // --- Coordinator ---
    let coordinator = Arc::new(InstanceCoordinator::new(
        kv.clone(),
        instance_store,
        clock.clone(),
        CoordinatorConfig {
            activity_timeout: config.activity_timeout,
            ..Default::default()
        },
    ));

    // --- Durable queue ---
    let (queue, signing_key): (Arc<dyn TaskQueue>, String) = match &config.queue {
        Some(queue_config) => (
            Arc::new(HttpQueuePublisher::new(http.clone(), queue_config.clone())),
            queue_config.signing_key.clone(),
        ),
        None => {
            tracing::warn!("QSTASH_*/WEBHOOK_BASE_URL not set; stage publishing disabled");
            // Random key: every inbound signature fails closed.
            (
                Arc::new(DisabledQueue),
                uuid::Uuid::new_v4().to_string(),
            )
        }
    };

    // --- Protocol client ---
    // The wire client is linked by the deployment; without one the
    // supervisor idles and only the webhook surface is active.
    let transport = Arc::new(DetachedTransport);
    tracing::warn!("chat transport not linked; running webhook-only");
    let limiter = Arc::new(RateLimiter::default());
    let supervisor = Arc::new(ClientSupervisor::new(
        transport,
        CircuitBreaker::new(BreakerConfig::default(), clock.clone()),
        coordinator.clone(),
        limiter.clone(),
        SupervisorConfig::default(),
    ));

    // --- Drive providers ---
    // Vendor crates register their builders here.
    let factory = Arc::new(DriveProviderFactory::new(config.remote_folder.clone()));
    if factory.supported_types().is_empty() {
        tracing::warn!("no drive providers registered in this build");
    }

    // --- Pipeline ---
    let manager = Arc::new(TaskManager::new(
        repo.clone(),
        drive_store.clone(),
        factory.clone(),
        queue,
        coordinator.clone(),
        supervisor.clone(),
        limiter,
        PipelineConfig {
            download_dir: config.download_dir.clone(),
            ..Default::default()
        },
    ));
    manager.start();

    // --- Dispatcher ---
    let guard = AuthGuard::new(config.owner_id, settings.clone(), config.access_mode.clone());
    let flow = Arc::new(DriveConfigFlow::new(
        sessions,
        drive_store.clone(),
        factory.clone(),
        supervisor.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        supervisor.clone(),
        coordinator.clone(),
        manager.clone(),
        guard,
        flow,
        drive_store,
        factory,
        repo.clone(),
        GroupAggregatorConfig::default(),
    ));

    // --- HTTP server first; everything else must not take it down ---
    let app = server::router(Arc::new(AppState {
        manager: manager.clone(),
        signing_key,
    }));
    let port = config.port;
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server::serve(app, port).await {
            tracing::error!(error = %err, "webhook server exited");
        }
    });

    // --- Boot the rest; failures are logged, never fatal ---
    if let Err(err) = coordinator.start().await {
        tracing::error!(error = %err, "instance registration failed");
    }
    tokio::spawn(Arc::clone(&coordinator).run_leader_loop(config.leader_ttl));
    tokio::spawn(Arc::clone(&repo).run_flush_loop());
    supervisor.start().await;
    tokio::spawn(dispatcher.run());

    tracing::info!(instance_id = %coordinator.instance_id(), "startup complete");

    tokio::select! {
        _ = server_handle => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            repo.flush().await;
            if let Err(err) = coordinator.shutdown().await {
                tracing::warn!(error = %err, "coordinator shutdown failed");
            }
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}
