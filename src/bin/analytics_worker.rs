use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use naglfar::config::{Config, DetectionConfig, RetentionConfig};
use naglfar::consumer::AnalyticsConsumer;
use naglfar::graph::{GraphStore, Neo4jStore, Window};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.rust_log.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting naglfar analytics worker"
    );

    let store: Arc<dyn GraphStore> = Arc::new(
        Neo4jStore::connect(&config.graph)
            .await
            .context("failed to connect to graph database")?,
    );
    store
        .ensure_schema()
        .await
        .context("failed to apply graph schema")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.detection.sweep_enabled {
        tokio::spawn(detection_sweep(
            store.clone(),
            config.detection.clone(),
            shutdown_rx.clone(),
        ));
    }
    if config.retention.sweep_enabled {
        tokio::spawn(retention_sweep(
            store.clone(),
            config.retention.clone(),
            shutdown_rx.clone(),
        ));
    }

    let consumer = AnalyticsConsumer::new(config.redis.clone(), config.consumer.clone(), store);
    let consumer_task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    consumer_task
        .await
        .context("consumer task panicked")?
        .context("consumer terminated with error")?;

    tracing::info!("Analytics worker stopped");
    Ok(())
}

/// Periodically runs the abuse detection queries and reports findings via
/// structured logs. Paging/alerting is left to the log pipeline.
async fn detection_sweep(
    store: Arc<dyn GraphStore>,
    config: DetectionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => run_detections(&store, &config).await,
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_detections(store: &Arc<dyn GraphStore>, config: &DetectionConfig) {
    let window = Window::last_minutes(config.window_minutes);

    match store
        .failed_validations_by_ip(window, config.failed_validation_threshold)
        .await
    {
        Ok(hits) => {
            for hit in hits {
                tracing::warn!(
                    ip = %hit.address,
                    failures = hit.count,
                    "Repeated validation failures from one address"
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "failed_validations_by_ip query failed"),
    }

    match store
        .request_volume_by_ip(window, config.request_flood_threshold)
        .await
    {
        Ok(hits) => {
            for hit in hits {
                tracing::warn!(
                    ip = %hit.address,
                    requests = hit.count,
                    "Request flood from one address"
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "request_volume_by_ip query failed"),
    }

    match store.sessions_with_multiple_users(window).await {
        Ok(sessions) => {
            for session in sessions {
                tracing::warn!(
                    session_id = %session.session_id,
                    users = session.user_count(),
                    "Session shared between users"
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "sessions_with_multiple_users query failed"),
    }

    match store.tokens_with_multiple_identities(window).await {
        Ok(tokens) => {
            for token in tokens {
                tracing::warn!(
                    token_id = %token.token_id,
                    users = token.user_count,
                    tenants = token.tenant_count,
                    "Token replayed across identities"
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "tokens_with_multiple_identities query failed"),
    }

    match store
        .ips_issuing_without_conversion(window, config.issuance_threshold)
        .await
    {
        Ok(hits) => {
            for hit in hits {
                tracing::warn!(
                    ip = %hit.address,
                    issued = hit.count,
                    "Token issuance with no successful validation"
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "ips_issuing_without_conversion query failed"),
    }
}

/// Periodically archives old events and purges expired ones, pruning
/// identity nodes left without relationships.
async fn retention_sweep(
    store: Arc<dyn GraphStore>,
    config: RetentionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let archive_cutoff = Utc::now() - chrono::Duration::days(config.archive_after_days);
                match store.archive_events(archive_cutoff).await {
                    Ok(archived) if archived > 0 => {
                        tracing::info!(archived, "Archived old events");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Archive sweep failed"),
                }

                let purge_cutoff = Utc::now() - chrono::Duration::days(config.purge_after_days);
                match store.purge_events(purge_cutoff).await {
                    Ok(purged) if purged > 0 => {
                        tracing::info!(purged, "Purged expired events");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Purge sweep failed"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
