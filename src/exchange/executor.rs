// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::connection::BoxFuture;
use crate::service::{RequestHandlerPool, Shutdown};
use crate::{AppError, AppResult};

/// Executor every action falls back to.
pub const GENERIC: &str = "generic";

pub type Task = BoxFuture<'static, ()>;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub channel_capacity: usize,
    pub num_workers: usize,
    pub monitor_interval: Duration,
    pub worker_check_timeout: Duration,
}

impl From<&RequestHandlerPool> for WorkerPoolConfig {
    fn from(config: &RequestHandlerPool) -> Self {
        let num_workers = if config.num_workers == 0 {
            num_cpus::get()
        } else {
            config.num_workers
        };
        WorkerPoolConfig {
            channel_capacity: config.channel_capacity,
            num_workers,
            monitor_interval: Duration::from_millis(config.monitor_interval_ms),
            worker_check_timeout: Duration::from_millis(config.worker_check_timeout_ms),
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

/// A bounded task queue drained by a fixed set of workers.
///
/// A monitor task restarts workers that died, a panicking task only takes its own
/// worker down.
#[derive(Debug)]
struct WorkerPool {
    sender: async_channel::Sender<Task>,
}

impl WorkerPool {
    fn new(name: &str, config: WorkerPoolConfig, notify_shutdown: &broadcast::Sender<()>) -> Self {
        let (sender, receiver) = async_channel::bounded(config.channel_capacity);
        let name: Arc<str> = Arc::from(name);
        let workers = (0..config.num_workers)
            .map(|id| Self::spawn_worker(name.clone(), id, receiver.clone(), notify_shutdown))
            .collect();
        Self::spawn_monitor(name, workers, receiver, notify_shutdown.clone(), config);
        WorkerPool { sender }
    }

    /// Queues `task` without waiting, a full queue rejects it.
    fn execute(&self, name: &str, task: Task) -> AppResult<()> {
        self.sender.try_send(task).map_err(|e| {
            let reason = if e.is_full() { "queue full" } else { "shut down" };
            debug!(executor = name, reason, "rejected task");
            AppError::RejectedExecution(name.to_string())
        })
    }

    fn spawn_worker(
        pool: Arc<str>,
        id: usize,
        receiver: async_channel::Receiver<Task>,
        notify_shutdown: &broadcast::Sender<()>,
    ) -> Worker {
        let mut shutdown = Shutdown::subscribe(notify_shutdown);

        let handle = tokio::spawn(async move {
            trace!(%pool, "worker {id} started");
            loop {
                tokio::select! {
                    task = receiver.recv() => match task {
                        Ok(task) => task.await,
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => {
                        debug!(%pool, "worker {id} shutting down");
                        break;
                    }
                }
            }
        });

        Worker { id, handle }
    }

    fn spawn_monitor(
        pool: Arc<str>,
        mut workers: Vec<Worker>,
        receiver: async_channel::Receiver<Task>,
        notify_shutdown: broadcast::Sender<()>,
        config: WorkerPoolConfig,
    ) {
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);
            let mut shutdown = Shutdown::subscribe(&notify_shutdown);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(%pool, "worker monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(config.worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    match join_result {
                                        Ok(()) => warn!(%pool, "worker {} completed unexpectedly", worker.id),
                                        Err(err) if err.is_panic() => log_worker_panic(&pool, worker.id, err),
                                        Err(_) => error!(%pool, "worker {} was cancelled", worker.id),
                                    }
                                    if receiver.is_closed() {
                                        continue;
                                    }
                                    warn!(%pool, "worker {} failed, restarting", worker.id);
                                    *worker = Self::spawn_worker(
                                        pool.clone(),
                                        worker.id,
                                        receiver.clone(),
                                        &notify_shutdown,
                                    );
                                }
                                Err(_) => trace!(%pool, "worker {} is running", worker.id),
                            }
                        }
                    }
                }
            }
            debug!(%pool, "worker monitor exiting");
        });
    }
}

fn log_worker_panic(pool: &str, worker_id: usize, err: tokio::task::JoinError) {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!(pool, "worker {worker_id} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!(pool, "worker {worker_id} panicked with message: {message}");
    } else {
        error!(
            pool,
            "worker {worker_id} panicked with an unknown type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

/// Named worker pools request handlers are dispatched to.
///
/// Always holds [`GENERIC`] plus the configured extra names. Must be created inside
/// a tokio runtime.
#[derive(Debug)]
pub struct ExecutorService {
    pools: HashMap<String, WorkerPool>,
    notify_shutdown: broadcast::Sender<()>,
}

impl ExecutorService {
    pub fn new(config: &RequestHandlerPool) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        let pool_config = WorkerPoolConfig::from(config);
        let mut pools = HashMap::new();
        for name in std::iter::once(GENERIC).chain(config.names.iter().map(String::as_str)) {
            if pools.contains_key(name) {
                continue;
            }
            pools.insert(
                name.to_string(),
                WorkerPool::new(name, pool_config.clone(), &notify_shutdown),
            );
        }
        info!(
            executors = pools.len(),
            workers = pool_config.num_workers,
            "executor service started"
        );
        ExecutorService {
            pools,
            notify_shutdown,
        }
    }

    pub fn has_executor(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queues `task` on the named executor, never waits.
    pub fn execute(&self, executor: &str, task: Task) -> AppResult<()> {
        let pool = self.pools.get(executor).ok_or_else(|| {
            AppError::IllegalStateError(format!("no executor named [{}]", executor))
        })?;
        pool.execute(executor, task)
    }

    /// Stops every worker, queued tasks are dropped.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
        for pool in self.pools.values() {
            pool.sender.close();
        }
    }
}
