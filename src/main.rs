use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use finchdb::raft::{LocalNode, NodeEndpoint, NodeManager, ReplicatedEngine};
use finchdb::{create_router, AppState, BatchedIndexer, CollectionManager, Store};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "finchdb")]
#[command(about = "FinchDB - a typo-tolerant search engine over JSON collections", long_about = None)]
struct Args {
    /// Port the HTTP API listens on
    #[arg(long, default_value_t = 8108)]
    api_port: u16,

    /// Port used for peer-to-peer consensus traffic
    #[arg(long, default_value_t = 8107)]
    peering_port: u16,

    /// Data directory path
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Cluster membership: `host:peering_port:api_port,...`
    #[arg(long, default_value = "")]
    nodes: String,

    /// Number of batched-indexer worker threads
    #[arg(long, default_value_t = 4)]
    num_indexer_threads: usize,

    /// Documents replayed per batch while loading collections at boot
    #[arg(long, default_value_t = 1000)]
    load_batch_size: usize,

    /// Interval between vector index rebuilds, in seconds
    #[arg(long, default_value_t = 30)]
    vector_rebuild_interval: u64,
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "finchdb=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Explicit construction order: store, manager, indexer, state machine,
    // node manager. Everything is owned here and passed by reference.
    let state_dir = std::path::Path::new(&args.data_dir).join("state");
    let store = Arc::new(Store::new(&state_dir)?);
    let manager = Arc::new(CollectionManager::new(store.clone(), args.load_batch_size));
    let indexer = Arc::new(BatchedIndexer::new(
        manager.clone(),
        store.clone(),
        args.num_indexer_threads,
    ));
    let engine = Arc::new(ReplicatedEngine::new(
        store.clone(),
        manager.clone(),
        indexer.clone(),
    ));

    engine.boot()?;
    tracing::info!("Store and collections loaded from {:?}", state_dir);

    let self_endpoint = NodeEndpoint {
        ip: "127.0.0.1".to_string(),
        peering_port: args.peering_port,
        api_port: args.api_port,
    };
    let node_manager = Arc::new(NodeManager::new(engine.clone(), self_endpoint.clone(), false));
    let snapshot_dir = std::path::Path::new(&args.data_dir).join("snapshots");
    let local_node = Arc::new(LocalNode::new(engine.clone(), self_endpoint, snapshot_dir));
    node_manager.init_node(local_node, &args.nodes)?;
    node_manager
        .wait_until_ready(Duration::from_secs(60))
        .await?;

    // Background workers.
    let indexer_handles = indexer.clone().run();

    let quit = Arc::new(AtomicBool::new(false));
    let housekeeper = Arc::new(finchdb::housekeeper::Housekeeper::new(
        store.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(30),
    ));
    let hk = housekeeper.clone();
    let hk_quit = quit.clone();
    let housekeeper_handle = std::thread::spawn(move || {
        hk.run(Duration::from_secs(10), &hk_quit);
    });

    // Vector index rebuilds wake on a fixed cadence.
    let rebuild_manager = manager.clone();
    let rebuild_quit = quit.clone();
    let rebuild_interval = Duration::from_secs(args.vector_rebuild_interval.max(1));
    let rebuild_handle = std::thread::spawn(move || {
        while !rebuild_quit.load(Ordering::SeqCst) {
            std::thread::sleep(rebuild_interval);
            rebuild_manager.rebuild_vector_indexes();
        }
    });

    let app_state = AppState {
        manager: manager.clone(),
        indexer: indexer.clone(),
        node: node_manager.clone(),
        housekeeper,
        req_counter: Arc::new(AtomicU64::new(0)),
    };
    let app = create_router(app_state);

    let addr = format!("0.0.0.0:{}", args.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Ordered shutdown: stop loops, stop the node, close the store last.
    tracing::info!("Shutting down");
    quit.store(true, Ordering::SeqCst);
    indexer.stop();
    for handle in indexer_handles {
        let _ = handle.join();
    }
    let _ = housekeeper_handle.join();
    let _ = rebuild_handle.join();
    node_manager.shutdown();
    store.flush()?;
    store.close();
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
