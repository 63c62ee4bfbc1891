//! Worker thread pool
//!
//! Five background threads keep a node fed: listeners on the global
//! queue, the per-node sharing queue and the MPI bus, a state-server
//! poller (in-memory state mode only), and a spawner that turns pool
//! tokens into executor slots. Shutdown flips one flag, which every
//! listener observes within a poll cycle, then joins everything in a
//! defined order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info};

use crate::config::StateMode;
use crate::scheduler::{message_factory, GlobalMessageBus, NodeMessageBus};
use crate::state::server::StateServer;
use crate::state::StateResult;

use super::thread::{WorkerDeps, WorkerThread};
use super::tokens::TokenPool;

pub struct WorkerThreadPool {
    shutdown: Arc<AtomicBool>,
    tokens: Arc<TokenPool>,
    deps: WorkerDeps,
    global_bus: Arc<dyn GlobalMessageBus>,
    sharing_bus: Arc<dyn NodeMessageBus>,
    mpi_bus: Arc<dyn NodeMessageBus>,
    global_handle: Option<JoinHandle<()>>,
    sharing_handle: Option<JoinHandle<()>>,
    mpi_handle: Option<JoinHandle<()>>,
    state_handle: Option<JoinHandle<()>>,
    pool_handle: Option<JoinHandle<()>>,
}

impl WorkerThreadPool {
    /// Build a pool of `deps.config.thread_pool_size` executor slots.
    /// Fails if the state backend cannot be reached.
    pub fn new(
        deps: WorkerDeps,
        global_bus: Arc<dyn GlobalMessageBus>,
        sharing_bus: Arc<dyn NodeMessageBus>,
        mpi_bus: Arc<dyn NodeMessageBus>,
    ) -> StateResult<Self> {
        deps.state.ping()?;

        Ok(Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            tokens: Arc::new(TokenPool::new(deps.config.thread_pool_size)),
            deps,
            global_bus,
            sharing_bus,
            mpi_bus,
            global_handle: None,
            sharing_handle: None,
            mpi_handle: None,
            state_handle: None,
            pool_handle: None,
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Executor slots currently running
    pub fn thread_count(&self) -> usize {
        self.tokens.taken()
    }

    pub fn tokens(&self) -> &TokenPool {
        &self.tokens
    }

    pub fn reset(&self) {
        self.tokens.reset();
    }

    /// Listen on the global queue; a timeout with no message means the
    /// queue has drained and the listener exits gracefully.
    pub fn start_global_queue_listener(&mut self) {
        let conf = Arc::clone(&self.deps.config);
        info!("starting global queue listener on {}", conf.queue_name);

        let shutdown = Arc::clone(&self.shutdown);
        let bus = Arc::clone(&self.global_bus);
        let scheduler = Arc::clone(&self.deps.scheduler);

        let handle = std::thread::Builder::new()
            .name("global-listener".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    match bus.next_message(conf.global_message_timeout) {
                        Ok(msg) => {
                            debug!(
                                "got invocation for {}/{} on {}",
                                msg.user, msg.function, conf.queue_name
                            );
                            scheduler.call_function(msg);
                        }
                        Err(_) => {
                            info!(
                                "no message from global bus in {:?}, dropping out",
                                conf.global_message_timeout
                            );
                            return;
                        }
                    }
                }
            })
            .expect("spawning global listener");
        self.global_handle = Some(handle);
    }

    /// Listen on this node's sharing queue. A flush request drains local
    /// state and re-primes the python runtime; everything else goes to the
    /// scheduler. Timeouts just mean nothing was shared.
    pub fn start_sharing_listener(&mut self) {
        info!("starting work sharing listener");

        let conf = Arc::clone(&self.deps.config);
        let shutdown = Arc::clone(&self.shutdown);
        let bus = Arc::clone(&self.sharing_bus);
        let deps = self.deps.clone();

        let handle = std::thread::Builder::new()
            .name("sharing-listener".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    match bus.next_message_for_node(&conf.node_id, conf.global_message_timeout) {
                        Ok(msg) if msg.is_flush_request => {
                            flush_worker_host(&deps);
                            prepare_python_runtime(&deps);
                        }
                        Ok(msg) => {
                            debug!(
                                "{} received shared call {}/{} (scheduled for {})",
                                conf.node_id, msg.user, msg.function, msg.scheduled_node
                            );
                            deps.scheduler.call_function(msg);
                        }
                        Err(_) => continue,
                    }
                }
            })
            .expect("spawning sharing listener");
        self.sharing_handle = Some(handle);
    }

    /// Listen on the MPI bus for this node
    pub fn start_mpi_listener(&mut self) {
        info!("starting MPI queue listener");

        let conf = Arc::clone(&self.deps.config);
        let shutdown = Arc::clone(&self.shutdown);
        let bus = Arc::clone(&self.mpi_bus);
        let scheduler = Arc::clone(&self.deps.scheduler);

        let handle = std::thread::Builder::new()
            .name("mpi-listener".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    match bus.next_message_for_node(&conf.node_id, conf.global_message_timeout) {
                        Ok(msg) => scheduler.call_function(msg),
                        Err(_) => continue,
                    }
                }
            })
            .expect("spawning MPI listener");
        self.mpi_handle = Some(handle);
    }

    /// Poll the TCP state server, in-memory state mode only
    pub fn start_state_server(&mut self) {
        let conf = &self.deps.config;
        if conf.state_mode != StateMode::InMemory {
            info!("not starting state server in state mode {:?}", conf.state_mode);
            return;
        }
        info!("starting state server");

        let addr = conf.state_server_addr.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let store = Arc::clone(&self.deps.state);

        let handle = std::thread::Builder::new()
            .name("state-server".to_string())
            .spawn(move || {
                let server = match StateServer::bind(&addr, store) {
                    Ok(server) => server,
                    Err(e) => {
                        error!("state server failed to bind {}: {}", addr, e);
                        return;
                    }
                };
                while !shutdown.load(Ordering::Acquire) {
                    server.poll();
                }
                server.close();
            })
            .expect("spawning state server");
        self.state_handle = Some(handle);
    }

    /// Spawn executor threads until the token pool is exhausted, so the
    /// pool replenishes whenever a slot releases its token.
    pub fn start_thread_pool(&mut self) {
        info!("starting worker thread pool");

        let shutdown = Arc::clone(&self.shutdown);
        let tokens = Arc::clone(&self.tokens);
        let deps = self.deps.clone();

        let handle = std::thread::Builder::new()
            .name("pool-spawner".to_string())
            .spawn(move || {
                let mut executors: Vec<JoinHandle<()>> = Vec::new();

                while !shutdown.load(Ordering::Acquire) {
                    // Blocks while every slot is busy
                    let Some(token) = tokens.acquire() else {
                        break;
                    };

                    // The flag may have flipped while we were blocked
                    if shutdown.load(Ordering::Acquire) {
                        tokens.release(token);
                        break;
                    }

                    let shutdown = Arc::clone(&shutdown);
                    let tokens = Arc::clone(&tokens);
                    let deps = deps.clone();
                    let executor = std::thread::Builder::new()
                        .name(format!("executor-{}", token))
                        .spawn(move || {
                            let worker = WorkerThread::new(token, deps);
                            worker.run(&shutdown);
                            tokens.release(worker.slot);
                        })
                        .expect("spawning executor");
                    executors.push(executor);
                }

                info!("waiting for {} worker threads", executors.len());
                for executor in executors {
                    let _ = executor.join();
                }
            })
            .expect("spawning pool thread");
        self.pool_handle = Some(handle);

        // No-op unless preloading is configured
        prepare_python_runtime(&self.deps);
    }

    /// Start every background thread
    pub fn start_all(&mut self) {
        self.start_thread_pool();
        self.start_state_server();
        self.start_sharing_listener();
        self.start_mpi_listener();
        self.start_global_queue_listener();
    }

    /// Block until the global queue listener drains out
    pub fn wait_for_global_drain(&mut self) {
        if let Some(handle) = self.global_handle.take() {
            let _ = handle.join();
        }
    }

    /// Flip the shutdown flag and join every background thread
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.tokens.close();

        if let Some(handle) = self.global_handle.take() {
            info!("waiting for global queue thread to finish");
            let _ = handle.join();
        }
        if let Some(handle) = self.state_handle.take() {
            info!("waiting for state thread to finish");
            let _ = handle.join();
        }
        if let Some(handle) = self.sharing_handle.take() {
            info!("waiting for sharing queue thread to finish");
            let _ = handle.join();
        }
        if let Some(handle) = self.mpi_handle.take() {
            info!("waiting for MPI thread to finish");
            let _ = handle.join();
        }
        if let Some(handle) = self.pool_handle.take() {
            info!("waiting for pool to finish");
            let _ = handle.join();
        }

        info!("worker pool successfully shut down");
    }
}

/// Drain this node's local state after a flush request
fn flush_worker_host(deps: &WorkerDeps) {
    info!("flushing worker host");
    if let Err(e) = deps.state.clear() {
        error!("failed to drain local state: {}", e);
    }
}

/// Submit the python warm-up invocation, if configured
fn prepare_python_runtime(deps: &WorkerDeps) {
    if !deps.config.python_preload {
        info!("not preloading python runtime");
        return;
    }
    info!("preparing python runtime");

    let mut msg = message_factory("python", "noop");
    msg.is_async = true;
    deps.scheduler.call_function(msg);

    info!("python runtime prepared");
}
