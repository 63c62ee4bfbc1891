//! Worker daemon
//!
//! Wires the in-memory transports, the local scheduler and the worker
//! pool, then runs until the global queue drains. Embedders supply a real
//! module loader through the library API; the daemon on its own is the
//! queue and state plumbing of one node.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use cumulus::config::SystemConfig;
use cumulus::sandbox::UnconfiguredLoader;
use cumulus::scheduler::{InMemoryGlobalBus, InMemoryNodeBus, LocalScheduler};
use cumulus::state::InMemoryStateStore;
use cumulus::worker::{WorkerDeps, WorkerThreadPool};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Arc::new(SystemConfig::from_env());
    info!(
        "starting worker node {} with {} executor slots",
        config.node_id, config.thread_pool_size
    );

    let deps = WorkerDeps {
        config: Arc::clone(&config),
        scheduler: Arc::new(LocalScheduler::new()),
        state: Arc::new(InMemoryStateStore::new()),
        loader: Arc::new(UnconfiguredLoader),
    };

    let global_bus = Arc::new(InMemoryGlobalBus::new());
    let sharing_bus = Arc::new(InMemoryNodeBus::new());
    let mpi_bus = Arc::new(InMemoryNodeBus::new());

    let mut pool = match WorkerThreadPool::new(deps, global_bus, sharing_bus, mpi_bus) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("failed to start worker pool: {}", e);
            std::process::exit(1);
        }
    };

    pool.start_all();

    // The global listener exits when its queue drains; everything else
    // follows through shutdown.
    pool.wait_for_global_drain();
    pool.shutdown();
}
