//! Fleetmount Server - Clustered Device Mount Coordinator

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use fleetmount_core::cluster::ClusterSingletonProvider;
use fleetmount_core::datastore::DataStore;
use fleetmount_server::api;
use fleetmount_server::cluster::swarm::start_actor_swarm;
use fleetmount_server::cluster::{ActorDirectory, EtcdSingletonProvider, LocalSingletonService, SwarmRegistry};
use fleetmount_server::config::{DataStoreKind, ServerConfig};
use fleetmount_server::datastore::{EtcdDataStore, MemoryDataStore};
use fleetmount_server::device::SimulatedConnector;
use fleetmount_server::mount::MountPointService;
use fleetmount_server::observability::{self, RetryPolicy, TracingConfig};
use fleetmount_server::schema::{RepositorySchemaResolver, SchemaResourceManager};
use fleetmount_server::topology::{spawn_topology_manager, MemberServices};
use fleetmount_server::version::BuildInfo;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fleetmount-server")]
#[command(about = "Clustered device-mount coordination server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default)
    Run,
    /// Print build information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Version => {
            println!("{}", BuildInfo::current());
            Ok(())
        }
        Commands::Run => run().await,
    }
}

async fn run() -> anyhow::Result<()> {
    observability::init_tracing(TracingConfig::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let metrics_state = match observability::init_metrics() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            None
        }
    };

    let config = ServerConfig::from_env();
    info!(
        version = %BuildInfo::current().short(),
        member = %config.member_id,
        topology = %config.topology_id,
        datastore = %config.datastore,
        "Starting fleetmount server"
    );

    let (data_store, singleton, directory): (Arc<dyn DataStore>, Arc<dyn ClusterSingletonProvider>, ActorDirectory) =
        match config.datastore {
            DataStoreKind::Memory => {
                let data_store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new());
                let singleton: Arc<dyn ClusterSingletonProvider> =
                    LocalSingletonService::new().provider_for(config.member_id.clone());
                (data_store, singleton, ActorDirectory::new())
            }
            DataStoreKind::Etcd => {
                let store = EtcdDataStore::connect(&config)
                    .await
                    .context("failed to connect datastore")?;
                let singleton = EtcdSingletonProvider::new(
                    store.client(),
                    &config.etcd_namespace,
                    config.member_id.clone(),
                    Duration::from_secs(u64::try_from(config.election_lease_ttl).unwrap_or(1)),
                    config.reconnect_delay,
                );
                // Owners and slaves live in different processes.
                start_actor_swarm(&config).await?;
                let directory = ActorDirectory::with_registry(config.topology_id.clone(), Arc::new(SwarmRegistry));

                let data_store: Arc<dyn DataStore> = Arc::new(store);
                let singleton: Arc<dyn ClusterSingletonProvider> = Arc::new(singleton);
                (data_store, singleton, directory)
            }
        };

    let schema_resources = SchemaResourceManager::new(Arc::new(RepositorySchemaResolver::new()))
        .with_catalog(config.schema_catalog_dir.clone());

    let services = Arc::new(MemberServices {
        member: config.member_id.clone(),
        topology_id: config.topology_id.clone(),
        data_store: data_store.clone(),
        singleton,
        directory,
        connector: Arc::new(SimulatedConnector::new()),
        schema_resources: Arc::new(schema_resources),
        mount_points: MountPointService::new(),
        write_tx_idle_timeout: config.write_tx_idle_timeout,
        read_tx_idle_timeout: config.read_tx_idle_timeout,
        mount_retry: RetryPolicy::default(),
        registration_attempts: config.registration_attempts,
    });

    let topology = Arc::new(spawn_topology_manager(services.clone()));

    let state = api::AppState {
        member: services.member.clone(),
        data_store,
        mount_points: services.mount_points.clone(),
        topology: topology.clone(),
        metrics_state,
    };
    let app = api::create_router(state);

    info!(bind_addr = %config.bind_addr, "Starting API server");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down topology manager");
    topology.shutdown().await;
    observability::shutdown_tracing();
    served.context("API server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
