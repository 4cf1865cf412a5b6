//! OPC UA runtime: server bootstrap, the node-command consumer and the
//! poll engine, plus the staged shutdown that tears all three down.

use std::sync::Arc;
use std::time::Duration;

use opcua::server::diagnostics::NamespaceMetadata;
use opcua::server::node_manager::memory::{simple_node_manager, SimpleNodeManager};
use opcua::server::ServerBuilder;
use opcua::types::NodeId;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::errors::{GatewayError, GatewayResult};
use crate::opcua::bridge::{NodeCommand, NodeSpec, OpcUaBridge};
use crate::plc::driver::{DriverFactory, PlcDriver};
use crate::plc::eip::{LogixDriverFactory, SlcDriverFactory};
use crate::plc::health::{COMPACTLOGIX, SLC500};
use crate::plc::mock::MockDriverFactory;
use crate::plc::poller::{LineTemplate, PollEngine};
use crate::runtime::{GatewayContext, ShutdownSignal};

pub const OPCUA_ENDPOINT: &str = "opc.tcp://0.0.0.0:4840/freeopcua/server/";
pub const OPCUA_NAMESPACE_URI: &str = "http://hmi.designer.flutter";
pub const OPCUA_FOLDER: &str = "HMI_Tags";

/// Run the OPC UA server, the node-command consumer and the poll engine
/// until shutdown is signalled, then tear them down within the configured
/// budget. PLC drivers are opened here so initial health reflects reality
/// before the first poll.
pub async fn run_opcua_server(ctx: GatewayContext) -> GatewayResult<()> {
    let (server, handle) = ServerBuilder::new_anonymous("PLC Gateway OPC UA Server")
        .host("0.0.0.0")
        .port(4840)
        .with_node_manager(simple_node_manager(
            NamespaceMetadata {
                namespace_uri: OPCUA_NAMESPACE_URI.to_string(),
                ..Default::default()
            },
            "gateway",
        ))
        .build()
        .map_err(|e| GatewayError::OpcUa(e.to_string()))?;

    let manager = handle
        .node_managers()
        .get_of_type::<SimpleNodeManager>()
        .ok_or_else(|| GatewayError::OpcUa("simple node manager unavailable".to_string()))?;
    let namespace = handle
        .get_namespace_index(OPCUA_NAMESPACE_URI)
        .ok_or_else(|| GatewayError::OpcUa("namespace not registered".to_string()))?;

    let folder_id = NodeId::new(namespace, OPCUA_FOLDER);
    {
        let space = manager.address_space();
        let mut space = space.write();
        let _ = space.add_folder(
            &folder_id,
            OPCUA_FOLDER,
            OPCUA_FOLDER,
            &NodeId::objects_folder_id(),
        );
    }

    let mut bridge = OpcUaBridge::new(
        namespace,
        folder_id,
        manager,
        handle,
        ctx.store.clone(),
    );
    // Expose tags that were ingested before the server came up.
    for tag in ctx.store.list_tags() {
        bridge.create_node(&NodeSpec::from(&tag));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    ctx.nodes.wire(tx);
    let bridge = Arc::new(Mutex::new(bridge));

    info!("Starting OPC UA Server on {}", OPCUA_ENDPOINT);

    let socket_timeout = Duration::from_secs_f64(ctx.settings.plc_socket_timeout);
    let (logix_factory, slc_factory): (Arc<dyn DriverFactory>, Arc<dyn DriverFactory>) =
        if ctx.settings.mock_plc {
            (
                Arc::new(MockDriverFactory::logix(ctx.store.clone())),
                Arc::new(MockDriverFactory::slc(ctx.store.clone())),
            )
        } else {
            (
                Arc::new(LogixDriverFactory {
                    endpoint: ctx.settings.compactlogix_ip.clone(),
                    socket_timeout,
                }),
                Arc::new(SlcDriverFactory {
                    endpoint: ctx.settings.slc500_ip.clone(),
                    socket_timeout,
                }),
            )
        };

    let mut lines = Vec::new();
    for (key, factory, batch_reads) in [
        (COMPACTLOGIX, logix_factory, true),
        (SLC500, slc_factory, false),
    ] {
        let driver = open_initial_driver(key, factory.clone()).await;
        ctx.health
            .set_initial_ok(key, driver.as_ref().map(|d| d.connected()).unwrap_or(false));
        lines.push((
            LineTemplate {
                key: key.to_string(),
                batch_reads,
                factory,
            },
            driver,
        ));
    }
    info!("Persistent PLC drivers opened");

    // Pre-populate one synthetic failure in mock mode so the health
    // endpoint shows backoff without blocking the first real poll.
    if ctx.settings.mock_plc && ctx.settings.mock_fail_reconnect {
        let delay = ctx
            .health
            .record_reconnect_failure(COMPACTLOGIX, "forced reconnect failure (test)");
        info!("(test) Prepopulated backoff for compactlogix: {}", delay);
    }

    let mut server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("OPC UA server error: {}", e);
        }
    });
    let mut consumer_task = tokio::spawn(consume_commands(
        rx,
        bridge.clone(),
        ctx.shutdown.clone(),
    ));
    let engine = PollEngine::new(
        ctx.store.clone(),
        ctx.health.clone(),
        ctx.settings.clone(),
        ctx.shutdown.clone(),
        ctx.readiness.clone(),
        ctx.last_update.clone(),
        lines,
    )
    .with_bridge(bridge.clone());
    let mut poll_task = tokio::spawn(engine.run());

    ctx.shutdown.triggered().await;

    // Staged shutdown: the signal is set, so the poller exits between
    // blocking calls and closes its drivers; cancel anything that lags
    // past the budget, then stop the server itself.
    let budget = Duration::from_secs_f64(ctx.settings.shutdown_timeout);
    if tokio::time::timeout(budget, &mut poll_task).await.is_err() {
        error!("Poll task did not stop within {:?}; cancelling", budget);
        poll_task.abort();
    }
    consumer_task.abort();
    server_task.abort();
    let _ = (&mut consumer_task).await;
    let _ = (&mut server_task).await;
    info!("OPC UA runtime stopped");
    Ok(())
}

async fn open_initial_driver(
    key: &'static str,
    factory: Arc<dyn DriverFactory>,
) -> Option<Box<dyn PlcDriver>> {
    let opened = tokio::task::spawn_blocking(move || match factory.create() {
        Ok(mut driver) => {
            if let Err(e) = driver.open() {
                warn!("Initial open of {} driver failed: {}", key, e);
            }
            Some(driver)
        }
        Err(e) => {
            warn!("Failed to create {} driver: {}", key, e);
            None
        }
    })
    .await;
    opened.unwrap_or(None)
}

/// Sole consumer of node commands; everything that touches the address
/// space funnels through here, on the OPC UA runtime.
async fn consume_commands(
    mut rx: UnboundedReceiver<NodeCommand>,
    bridge: Arc<Mutex<OpcUaBridge>>,
    shutdown: Arc<ShutdownSignal>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            NodeCommand::Create(spec) => bridge.lock().await.create_node(&spec),
            NodeCommand::UpdateValue { tag_id, value } => {
                bridge.lock().await.update_value(&tag_id, &value)
            }
            NodeCommand::Delete { tag_id } => bridge.lock().await.delete_node(&tag_id),
            NodeCommand::Shutdown { ack } => {
                shutdown.trigger();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }
}
