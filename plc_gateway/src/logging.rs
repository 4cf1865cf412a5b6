use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging. The default filter keeps the gateway at
/// info while silencing the OPC UA stack's startup chatter; override with
/// RUST_LOG as usual.
pub fn init() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plc_gateway=info,opcua=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
