use anyhow::Result;
use env_logger::Env;
use gstreamer as gst;
use herdwatch::api::{AppState, RestApi};
use herdwatch::config;
use herdwatch::db::repositories::{
    CamerasRepository, FarmsRepository, NotificationsRepository, UserTokensRepository,
};
use herdwatch::db::DatabaseService;
use herdwatch::pipeline::notifier::{DbNotificationSink, DbRecipientResolver};
use herdwatch::pipeline::{NotificationDispatcher, NullDetector, StreamSupervisor};
use herdwatch::push::ExpoPushClient;
use herdwatch::resolver::SourceResolver;
use herdwatch::snapshot::SnapshotStore;
use log::info;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let config = config::load_config(config_path.as_deref().map(Path::new))?;

    env_logger::Builder::from_env(Env::default().default_filter_or(config.api.log_level.clone()))
        .init();
    info!("Starting herdwatch");

    gst::init()?;

    let db = Arc::new(DatabaseService::new(&config.database).await?);
    let cameras = CamerasRepository::new(db.pool.clone());
    let farms = FarmsRepository::new(db.pool.clone());
    let notifications = NotificationsRepository::new(db.pool.clone());
    let tokens = UserTokensRepository::new(db.pool.clone());

    let snapshots = SnapshotStore::new(&config.snapshots)?;
    let push = Arc::new(ExpoPushClient::new(&config.notifications)?);
    let recipients = Arc::new(DbRecipientResolver::new(
        cameras.clone(),
        farms,
        tokens.clone(),
    ));
    let sink = Arc::new(DbNotificationSink::new(notifications.clone()));
    let dispatcher = Arc::new(NotificationDispatcher::new(
        snapshots,
        recipients,
        sink,
        push,
        config.notifications.title.clone(),
        config.notifications.display_names.clone(),
        Duration::from_millis(config.notifications.push_timeout_ms),
    ));

    let resolver = Arc::new(SourceResolver::new(config.resolver.clone())?);
    let supervisor = Arc::new(StreamSupervisor::new(
        &config,
        cameras,
        resolver,
        Arc::new(NullDetector),
        dispatcher,
    ));

    let state = AppState {
        supervisor: supervisor.clone(),
        notifications,
        tokens,
        db,
    };

    let api = RestApi::new(&config, state);
    let shutdown = {
        let supervisor = supervisor.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            supervisor.shutdown().await;
        }
    };

    api.start(shutdown).await?;
    info!("Shutdown complete");
    Ok(())
}
