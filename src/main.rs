//! Main entry point for the millrace node.
//!
//! Starts the executor and supervisor with configuration from environment
//! variables. The client-facing RPC layer mounts on [`ClusterProxy`]; a
//! single-node deployment serves every shard locally.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use millrace::{
    blobs::{BlobStore, InMemoryBlobStore, SqlBlobStore},
    cluster::{ClusterConfig, ClusterManager, ClusterProxy, FlowNodeClient, LocalFlowNode},
    config::Config,
    executor::Executor,
    journal::{EventJournal, InMemoryJournal, SqlJournal},
    supervisor::Supervisor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting millrace node");

    let config = Config::from_env()?;
    info!(?config, "loaded configuration");

    let (journal, blobs): (Arc<dyn EventJournal>, Arc<dyn BlobStore>) =
        match &config.database_url {
            Some(url) => {
                let pool = sqlx::PgPool::connect(url).await?;
                info!("connected to database");
                let journal = SqlJournal::new(pool.clone());
                journal.init_schema().await?;
                let blob_store = SqlBlobStore::new(pool);
                blob_store.init_schema().await?;
                (Arc::new(journal), Arc::new(blob_store))
            }
            None => {
                info!("no database configured, using in-memory persistence");
                (
                    Arc::new(InMemoryJournal::new()),
                    Arc::new(InMemoryBlobStore::new()),
                )
            }
        };

    let executor = Executor::start(config.executor_config(), Arc::clone(&blobs));
    let supervisor = Supervisor::start(
        Arc::clone(&journal),
        executor.handle(),
        config.actor_config(),
    );

    let node: Arc<dyn FlowNodeClient> = Arc::new(LocalFlowNode::new(supervisor.handle()));
    let manager = Arc::new(ClusterManager::new(ClusterConfig::default(), vec![node])?);
    let _proxy = ClusterProxy::new(manager);

    info!("millrace node started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    supervisor.shutdown().await;
    executor.shutdown().await;
    Ok(())
}
