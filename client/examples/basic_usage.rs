//! Basic usage example for the compass client.
//!
//! Expects a control plane listening on localhost:12004. Run with
//! `cargo run --example basic_usage`.

use compass_client::{
    ClientConfig, CompassClient, ConfigInfo, ConfigListener, ExchangeMode, NodeInfo,
    ServiceListener,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Compass Client Example ===\n");

    // 1. Connect over the shared bidirectional stream
    println!("1. Connecting...");
    let config = ClientConfig::new("localhost:12004")
        .with_namespace("ns1")
        .with_exchange_mode(ExchangeMode::Stream)
        .with_heartbeat_interval(Duration::from_secs(5));
    let client = CompassClient::new(config)?;
    client.connect().await?;
    println!("   Connected: {:?}", client.session().connection_id());

    // 2. Register a node; heartbeats start automatically
    println!("\n2. Registering a node...");
    let outcome = client
        .registry()
        .register_node(NodeInfo::new("127.0.0.1", 8080).with_service("user-svc"))
        .await?;
    let node_id = outcome.node_id.unwrap_or_default();
    println!("   Node id: {}", node_id);

    // 3. Subscribe to service changes
    println!("\n3. Subscribing to user-svc changes...");
    let subscription = client
        .registry()
        .subscribe(
            "ns1",
            "",
            vec!["user-svc".to_string()],
            ServiceListener::new(|event| {
                println!("   -> {:?} on {}", event.event_type, event.service_name);
            }),
        )
        .await?;

    // 4. Save a config and watch it
    println!("\n4. Saving and watching a config...");
    let mut app_config = ConfigInfo::new("app.yaml", "server:\n  port: 8080");
    app_config.content_type = "yaml".to_string();
    let saved = client.configuration().save_config(app_config).await?;
    println!("   Saved version {} (md5 {})", saved.version, saved.content_md5);

    let watch = client
        .configuration()
        .watch_config(
            "ns1",
            "",
            vec!["app.yaml".to_string()],
            ConfigListener::new(|event| {
                println!("   -> {:?} on {}", event.event_type, event.data_id);
            }),
        )
        .await?;

    // 5. Discover the node we registered
    println!("\n5. Discovering nodes...");
    let nodes = client
        .registry()
        .discover_nodes("ns1", "", "user-svc", true)
        .await?;
    for node in &nodes.nodes {
        println!("   {} at {}:{}", node.node_id, node.ip, node.port);
    }

    // 6. Clean shutdown
    println!("\n6. Closing...");
    client.configuration().unwatch(&watch).await?;
    client.registry().unsubscribe(&subscription).await?;
    client.close().await;

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
