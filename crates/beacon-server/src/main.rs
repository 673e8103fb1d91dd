use std::sync::Arc;

use tokio::sync::broadcast;

use beacon_core::BnResult;
use beacon_engine::channels::email::EmailProvider;
use beacon_engine::channels::memory::MemoryProvider;
use beacon_engine::channels::sms::{SmsGatewayConfig, SmsGatewayProvider};
use beacon_engine::channels::webhook_push::PushWebhookProvider;
use beacon_engine::channels::ChannelProvider;
use beacon_engine::circuit_breaker::ChannelBreakerBank;
use beacon_engine::config::EngineConfig;
use beacon_engine::delivery::DeliveryExecutor;
use beacon_engine::orchestrator::Orchestrator;
use beacon_engine::registry::{ChannelRegistry, RegisterOptions};
use beacon_engine::scheduler::Scheduler;
use beacon_engine::signals::DeliverySignals;
use beacon_engine::store::DeliveryStore;
use beacon_server::{router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config: EngineConfig = match std::env::var("BEACON_CONFIG") {
        Ok(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        Err(_) => EngineConfig::default(),
    };

    let db_path = std::env::var("BEACON_DB").unwrap_or_else(|_| "beacon.db".into());
    let store = Arc::new(DeliveryStore::open(&db_path)?);

    let registry = Arc::new(ChannelRegistry::new());
    register_providers(&registry).await?;

    let signals = Arc::new(DeliverySignals::new());
    let breakers = Arc::new(ChannelBreakerBank::new(config.breaker.clone()));
    let executor = DeliveryExecutor::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&signals),
        breakers,
        config.escalation.clone(),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&executor),
        config.routing.clone(),
        config.max_channel_attempts,
    ));

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        Arc::clone(&store),
        Arc::clone(&orchestrator) as Arc<dyn beacon_engine::scheduler::JobRunner>,
    ));

    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    // Re-drive any notifications that were pending when the process last
    // stopped; their in-memory jobs did not survive.
    let recovered = orchestrator.retry_pending().await?;
    if recovered > 0 {
        tracing::info!(recovered, "recovered pending notifications on startup");
    }

    let state = Arc::new(AppState {
        store,
        registry,
        executor,
        orchestrator,
        scheduler,
        signals,
    });

    let addr = std::env::var("BEACON_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "beacon server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = shutdown_tx.send(());
    scheduler_handle.await?;
    Ok(())
}

/// Register one provider per transport. Push/SMS gateways come from the
/// environment; email falls back to log-only mode without SMTP settings;
/// the in-memory provider backs local development when nothing is
/// configured.
async fn register_providers(registry: &ChannelRegistry) -> BnResult<()> {
    match std::env::var("BEACON_PUSH_GATEWAY_URL") {
        Ok(url) => {
            registry
                .register(
                    "push",
                    Arc::new(PushWebhookProvider::new(url)?) as Arc<dyn ChannelProvider>,
                    RegisterOptions { priority: 10, enabled: true },
                )
                .await?;
        }
        Err(_) => {
            tracing::warn!("BEACON_PUSH_GATEWAY_URL not set, using in-memory push provider");
            registry
                .register(
                    "push",
                    Arc::new(MemoryProvider::new(beacon_core::ChannelKind::Push))
                        as Arc<dyn ChannelProvider>,
                    RegisterOptions { priority: 10, enabled: true },
                )
                .await?;
        }
    }

    if let (Ok(base_url), Ok(api_key)) = (
        std::env::var("BEACON_SMS_GATEWAY_URL"),
        std::env::var("BEACON_SMS_API_KEY"),
    ) {
        registry
            .register(
                "sms",
                Arc::new(SmsGatewayProvider::new(SmsGatewayConfig {
                    base_url,
                    api_key,
                    sender_id: std::env::var("BEACON_SMS_SENDER").ok(),
                })?) as Arc<dyn ChannelProvider>,
                RegisterOptions { priority: 20, enabled: true },
            )
            .await?;
    }

    let from = std::env::var("BEACON_EMAIL_FROM").unwrap_or_else(|_| "beacon@localhost".into());
    registry
        .register(
            "email",
            Arc::new(EmailProvider::new(from)) as Arc<dyn ChannelProvider>,
            RegisterOptions { priority: 30, enabled: true },
        )
        .await?;

    Ok(())
}
