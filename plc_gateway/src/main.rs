use tracing::{error, info};

use plc_gateway::api;
use plc_gateway::config::settings::Settings;
use plc_gateway::logging;
use plc_gateway::loki::{self, LokiHandle};
use plc_gateway::metrics::MetricsServer;
use plc_gateway::opcua;
use plc_gateway::runtime::GatewayContext;

#[tokio::main]
async fn main() {
    logging::init();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "PLC gateway starting (poll_period={}s, mock_plc={})",
        settings.poll_period, settings.mock_plc
    );

    let loki = settings
        .loki_push_url
        .clone()
        .map(loki::spawn_pusher)
        .unwrap_or_else(LokiHandle::disabled);
    let ctx = GatewayContext::new(settings, loki);

    if ctx.store.is_empty() {
        info!("Tag store initialized empty; awaiting REST-driven tag creation");
    }

    if let Some(port) = ctx.settings.metrics_port {
        let server = MetricsServer::new(port);
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!("Metrics server error: {}", e);
            }
        });
        info!("Prometheus metrics server started on port {}", port);
    }

    // HTTP comes up first so orchestration can ingest tags while the OPC UA
    // runtime is still starting. A port collision is the one fatal error.
    let http_ctx = ctx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = api::rest::serve(http_ctx).await {
            eprintln!("FATAL: REST server failed: {e}");
            std::process::exit(1);
        }
    });

    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, initiating graceful shutdown");
            signal_ctx.shutdown.trigger();
        }
    });

    if let Err(e) = opcua::server::run_opcua_server(ctx.clone()).await {
        error!("Error while running OPC UA server: {}", e);
        ctx.shutdown.trigger();
    }

    let _ = http_task.await;
    info!("Gateway shut down");
}
