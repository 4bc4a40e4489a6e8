//! Courier service process.
//!
//! Connects the agent pool, the relay bot and the retry queue, then runs the
//! background workers (staging sweeper, retry drain) until Ctrl-C. Deliveries
//! are requested by the fulfillment layer that embeds [`DeliveryOrchestrator`];
//! this binary hosts the long-lived state they share.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::{
    config::Config,
    orchestrator::DeliveryOrchestrator,
    pool::SessionPool,
    ports::RelayProducer,
    relay::RelayFallback,
    reporter::AttemptLog,
    retry::RetryPolicy,
    retry_queue::RetryQueue,
    store::{JsonFileStore, RetryQueueStore, SettingsStore},
};
use courier_tdlib::TdlibBridgeConnector;
use courier_telegram::BotRelayProducer;
use courier_tgcli::{TelegramCliConfig, TelegramCliConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_core::logging::init("courier")?;

    let cfg = Config::load().context("loading configuration")?;
    let agents = cfg.load_agents().context("loading agent list")?;

    let store = Arc::new(
        JsonFileStore::open(&cfg.store_file)
            .await
            .with_context(|| format!("opening store {}", cfg.store_file.display()))?,
    );
    if let Some(channel) = cfg.relay_channel_id {
        if store.relay_channel().await?.is_none() {
            store.set_relay_channel(Some(channel)).await?;
        }
    }

    let reporter = Arc::new(AttemptLog::new(&cfg.attempt_log_path, cfg.attempt_log_json));

    let tdlib = Arc::new(TdlibBridgeConnector::new(cfg.tdlib_bridge_url.clone())?);
    let tgcli = Arc::new(TelegramCliConnector::new(TelegramCliConfig::new(
        &cfg.telegram_cli_path,
        &cfg.temp_dir,
    )));
    let pool = Arc::new(
        SessionPool::new(store.clone(), cfg.provider, cfg.session_policy())
            .with_connector(tdlib)
            .with_connector(tgcli)
            .with_connect_timeout(cfg.connect_timeout),
    );

    let mut orchestrator =
        DeliveryOrchestrator::new(pool.clone(), reporter, cfg.delivery_policy());
    let mut retry_queue = RetryQueue::new(store.clone(), cfg.retry_queue);

    let shutdown = CancellationToken::new();
    let mut sweeper = None;
    match &cfg.relay_bot_token {
        Some(token) => match BotRelayProducer::connect(token.clone()).await {
            Ok(producer) => {
                let producer = producer.with_retry_policy(
                    RetryPolicy::new(2, Duration::from_secs(1)).with_max_wait(cfg.retry_max_wait),
                );
                info!(bot = %producer.account(), "relay fallback enabled");
                if let Some(admin) = cfg.admin_chat_id {
                    retry_queue = retry_queue.with_notifier(Arc::new(producer.admin_notifier(admin)));
                    info!(chat = admin, "operator alerts enabled");
                }
                let relay = Arc::new(RelayFallback::new(
                    store.clone(),
                    Arc::new(producer),
                    cfg.relay_channel_title.clone(),
                ));
                sweeper = Some(tokio::spawn(
                    relay
                        .clone()
                        .run_sweeper(cfg.relay_sweep_interval, shutdown.clone()),
                ));
                orchestrator = orchestrator.with_relay(relay);
            }
            Err(e) => warn!(error = %e, "relay bot unavailable, fallback disabled"),
        },
        None => info!("RELAY_BOT_TOKEN not set, relay fallback disabled"),
    }
    let relay_enabled = sweeper.is_some();
    let orchestrator = Arc::new(orchestrator.with_retry_queue(Arc::new(retry_queue)));

    let connected = pool.initialize(&agents).await?;
    for h in pool.health_snapshot().await {
        info!(
            agent_id = %h.agent_id,
            name = %h.name,
            priority = h.priority,
            connected = h.connected,
            alternate = ?h.alternate_provider,
            status = %h.status_message,
            "agent"
        );
    }
    if connected == 0 {
        warn!("no delivery agent connected; deliveries will report pool exhaustion");
    }
    info!(
        provider = %cfg.provider,
        agents = agents.len(),
        connected,
        relay = relay_enabled,
        queued_retries = store.pending_retries().await?,
        "courier ready"
    );

    let retry_worker = tokio::spawn(orchestrator.clone().run_retry_worker(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");

    shutdown.cancel();
    if let Err(e) = retry_worker.await {
        warn!(error = %e, "retry worker task failed");
    }
    if let Some(task) = sweeper {
        if let Err(e) = task.await {
            warn!(error = %e, "relay sweeper task failed");
        }
    }
    pool.disconnect_all().await;
    Ok(())
}
