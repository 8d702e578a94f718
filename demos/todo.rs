//! Two-node walkthrough: create and update todos through a routing proxy,
//! fail the leader over, and read the state back from the new leader.
//!
//! Run with `RUST_LOG=todo_es=debug cargo run --example todo`.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use todo_es::{Command, Coordinator, Epoch, EventLog, FileLog, Leadership, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = std::env::temp_dir().join("todo-es-demo");
    let log = Arc::new(FileLog::open(&dir));
    let config = StoreConfig::default();
    let leadership = Leadership::new();

    let node_a = Coordinator::new("node-a", log.clone(), config.clone(), leadership.clone());
    let node_b = Coordinator::new("node-b", log.clone(), config, leadership.clone());
    let gateway = node_b.proxy();

    let epoch: Epoch = log.current_epoch().await?.next();
    node_a.on_promotion(epoch).await?;

    let create = Command::create("Buy milk", Some("semi-skimmed".into()));
    let id = create.id().to_owned();
    println!("{:?}", gateway.request(create).await?);
    println!(
        "{:?}",
        gateway.request(Command::Complete { id: id.clone() }).await?
    );

    node_a.on_demotion().await;
    node_b.on_promotion(epoch.next()).await?;

    let reply = gateway.request(Command::Get { id: id.clone() }).await?;
    println!("after failover: {reply:?}");

    println!("streams on disk: {:?}", log.layout().list_streams("todo")?);
    Ok(())
}

