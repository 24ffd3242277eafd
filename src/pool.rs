//! Worker thread pool.
//!
//! One accept loop feeds N worker threads, each running a single-threaded
//! runtime so every connection stays on one thread for its whole life.
//! Assignment picks the least-loaded worker by running count. Each worker
//! runs an idle sweep that terminates connections whose activity clock has
//! gone stale.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::ProxySpec;
use crate::proxy::{self, conn::handle_connection, ProxyCore};

struct Job {
    spec: ProxySpec,
    stream: std::net::TcpStream,
    peer: SocketAddr,
}

struct ConnEntry {
    atime: Arc<AtomicU64>,
    abort: AbortHandle,
}

struct Worker {
    load: Arc<AtomicU64>,
    tx: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Handle to the running pool; dropping the senders shuts the workers down.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `n` worker threads.
    pub fn start(core: Arc<ProxyCore>, n: usize) -> WorkerPool {
        let mut workers = Vec::with_capacity(n);
        for id in 0..n {
            let load = Arc::new(AtomicU64::new(0));
            let (tx, rx) = mpsc::unbounded_channel();
            let core = core.clone();
            let worker_load = load.clone();
            let thread = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_main(id, core, rx, worker_load))
                .expect("failed to spawn worker thread");
            workers.push(Worker {
                load,
                tx: Some(tx),
                thread: Some(thread),
            });
        }
        WorkerPool { workers }
    }

    pub fn total_load(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.load.load(Ordering::Relaxed))
            .sum()
    }

    /// Hand one accepted connection to the least-loaded worker. Returns
    /// false when no worker could take it.
    pub fn dispatch(
        &self,
        spec: ProxySpec,
        stream: std::net::TcpStream,
        peer: SocketAddr,
    ) -> bool {
        let Some(worker) = self
            .workers
            .iter()
            .min_by_key(|w| w.load.load(Ordering::Relaxed))
        else {
            return false;
        };
        match &worker.tx {
            Some(tx) => tx.send(Job { spec, stream, peer }).is_ok(),
            None => false,
        }
    }

    /// Stop accepting work and join the worker threads; outstanding
    /// connections are torn down in order.
    pub fn shutdown(mut self) {
        for worker in &mut self.workers {
            // Closing the channel ends the worker's recv loop.
            worker.tx = None;
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn worker_main(
    id: usize,
    core: Arc<ProxyCore>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    load: Arc<AtomicU64>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!("worker {id} failed to start runtime: {e}");
            return;
        }
    };

    rt.block_on(async move {
        let registry: Arc<Mutex<HashMap<u64, ConnEntry>>> = Arc::new(Mutex::new(HashMap::new()));

        let sweep_registry = registry.clone();
        let sweep_core = core.clone();
        let sweeper = tokio::spawn(async move {
            idle_sweep(sweep_core, sweep_registry).await;
        });

        while let Some(job) = rx.recv().await {
            let stream = match prepare_stream(job.stream) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("worker {id} could not adopt socket: {e}");
                    core.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            load.fetch_add(1, Ordering::Relaxed);
            let conn_key = proxy::next_conn_id();
            let atime = Arc::new(AtomicU64::new(proxy::now_micros()));

            let task = tokio::spawn(handle_connection(
                core.clone(),
                job.spec,
                stream,
                job.peer,
                atime.clone(),
            ));
            registry.lock().unwrap_or_else(|p| p.into_inner()).insert(
                conn_key,
                ConnEntry {
                    atime,
                    abort: task.abort_handle(),
                },
            );

            // Detach the bookkeeping from the connection itself.
            let load = load.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                let _ = task.await;
                load.fetch_sub(1, Ordering::Relaxed);
                registry
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&conn_key);
            });
        }

        debug!("worker {id} draining");
        sweeper.abort();
        for (_, entry) in registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
        {
            entry.abort.abort();
        }
    });
}

fn prepare_stream(stream: std::net::TcpStream) -> std::io::Result<TcpStream> {
    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}

/// Terminate connections whose activity clock is older than the idle
/// timeout. Runs on every worker with the configured period.
async fn idle_sweep(core: Arc<ProxyCore>, registry: Arc<Mutex<HashMap<u64, ConnEntry>>>) {
    let mut ticker = tokio::time::interval(core.config.expired_conn_check_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let timeout_us = core.config.conn_idle_timeout.as_micros() as u64;
    loop {
        ticker.tick().await;
        let now = proxy::now_micros();
        let mut expired = 0u64;
        registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|id, entry| {
                let idle = now.saturating_sub(entry.atime.load(Ordering::Relaxed));
                if idle > timeout_us {
                    debug!(conn = id, "idle timeout, terminating");
                    entry.abort.abort();
                    expired += 1;
                    return false;
                }
                true
            });
        if expired > 0 {
            core.stats.expired.fetch_add(expired, Ordering::Relaxed);
        }
    }
}

/// Bind one listening socket with address reuse, so restarts do not trip
/// over sockets in TIME_WAIT.
fn bind_listener(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    tokio::net::TcpListener::from_std(socket.into())
}

/// Bind the configured listeners and accept until interrupted. Accepts are
/// refused outright when file-descriptor headroom runs out.
pub async fn serve(core: Arc<ProxyCore>, pool: Arc<WorkerPool>) -> std::io::Result<()> {
    let mut accept_tasks = Vec::new();
    for spec in core.config.specs.clone() {
        let listener = bind_listener(spec.listen)?;
        info!(listen = %spec.listen, proto = %spec.proto, divert = spec.divert, "listening");
        let core = core.clone();
        let pool = pool.clone();
        accept_tasks.push(tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                if !proxy::fd_headroom_ok(pool.total_load()) {
                    warn!("fd limit reached, refusing connection from {peer}");
                    core.stats.refused.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let std_stream = match stream.into_std() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("failed to detach socket: {e}");
                        continue;
                    }
                };
                if !pool.dispatch(spec.clone(), std_stream, peer) {
                    warn!("no worker available for {peer}");
                    core.stats.refused.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    for task in accept_tasks {
        task.abort();
    }
    Ok(())
}

/// Number of worker threads: one per core, capped by configuration.
pub fn worker_count(max: Option<usize>) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    match max {
        Some(max) if max > 0 => cores.min(max),
        _ => cores,
    }
}
