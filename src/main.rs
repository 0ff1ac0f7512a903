use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use capture_scheduler as app;
use app::services::{
    orders::{OrderDataService, SeaOrmOrderService},
    payments::{HttpPaymentGateway, PaymentGateway},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = app::config::load_config().context("failed to load configuration")?;
    app::config::init_tracing(cfg.log_level(), cfg.log_json);
    app::handlers::health::init_start_time();
    app::metrics::register_metrics();

    // Init DB
    let db_pool = app::db::establish_connection(&app::db::DbConfig::from(&cfg))
        .await
        .context("failed to connect to database")?;
    app::db::ensure_schema(&db_pool)
        .await
        .context("failed to create schema")?;
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_sender, event_rx) = app::events::EventSender::channel(1024);
    let event_sender = Arc::new(event_sender);
    tokio::spawn(app::events::process_events(event_rx));

    let orders: Arc<dyn OrderDataService> = Arc::new(SeaOrmOrderService::new(db_arc.clone()));

    // Capture worker: disabled, not fatal, when the queue or gateway is missing
    let runtime = match cfg.gateway_config() {
        Some(gateway_cfg) => {
            let gateway: Arc<dyn PaymentGateway> = Arc::new(
                HttpPaymentGateway::new(gateway_cfg).context("failed to build payment gateway")?,
            );
            app::capture::CaptureRuntime::load(
                &cfg,
                orders.clone(),
                gateway,
                Some(event_sender.clone()),
            )
            .await
            .context("failed to start capture runtime")?
        }
        None => {
            warn!("Payment gateway API key not configured; payment capture worker not started");
            None
        }
    };

    let app_state = app::AppState {
        db: db_arc.clone(),
        config: cfg.clone(),
        event_sender,
        orders,
        capture: runtime.as_ref().map(|runtime| runtime.handle()),
    };
    let router = app::app_router(app_state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid listen address")?;
    info!("capture-scheduler listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(runtime) = runtime {
        runtime.shutdown().await;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
