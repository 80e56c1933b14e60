//! Exec worker pool.
//!
//! Starting a process inside a running container is queued to a fixed set
//! of workers so RPC handlers never run the exec sequence themselves. Every
//! queued task is answered exactly once through its [`ExecHandle`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use ctrd_shim::{Event, EventKind, ExecOptions};

use crate::collector::Collector;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::shim::Shim;

const SIGKILL: u32 = 9;

/// A request to start a process in a container.
pub struct ExecTask {
    pub id: String,
    pub opts: ExecOptions,
    pub shim: Arc<dyn Shim>,
    responder: oneshot::Sender<Result<u32>>,
}

/// Resolves to the pid of the started process, or the reason it could not
/// be started.
pub struct ExecHandle {
    rx: oneshot::Receiver<Result<u32>>,
}

impl Future for ExecHandle {
    type Output = Result<u32>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(Error::Internal("exec task dropped by worker".into())))
        })
    }
}

pub struct ExecPool {
    tx: mpsc::Sender<ExecTask>,
}

impl ExecPool {
    pub fn new(
        workers: usize,
        queue_depth: usize,
        collector: Collector,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            tokio::spawn(worker_loop(
                worker,
                rx.clone(),
                collector.clone(),
                metrics.clone(),
            ));
        }

        Self { tx }
    }

    /// Queue a task, waiting for room if the queue is full.
    pub async fn submit(
        &self,
        id: &str,
        opts: ExecOptions,
        shim: Arc<dyn Shim>,
    ) -> Result<ExecHandle> {
        let (responder, rx) = oneshot::channel();
        let task = ExecTask {
            id: id.to_string(),
            opts,
            shim,
            responder,
        };
        self.tx.send(task).await.map_err(|_| Error::Shutdown)?;
        Ok(ExecHandle { rx })
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<ExecTask>>>,
    collector: Collector,
    metrics: Arc<Metrics>,
) {
    loop {
        let task = queue.lock().await.recv().await;
        let Some(task) = task else {
            break;
        };
        run_task(task, &collector, &metrics).await;
    }
    debug!(worker, "exec worker stopped");
}

async fn run_task(task: ExecTask, collector: &Collector, metrics: &Metrics) {
    let start = Instant::now();
    let ExecTask {
        id,
        opts,
        shim,
        responder,
    } = task;
    let process_id = opts.process_id.clone();

    let pid = match shim.exec(opts).await {
        Ok(pid) => pid,
        Err(e) => {
            warn!(id = %id, process = %process_id, error = %e, "exec failed");
            let _ = responder.send(Err(e));
            return;
        }
    };

    if let Err((e, tracked)) = monitor(shim.as_ref(), &process_id, pid).await {
        warn!(
            id = %id,
            process = %process_id,
            pid,
            tracked,
            error = %e,
            "failed to monitor exec'd process"
        );
        if let Err(e) = shim.kill(tracked, SIGKILL, false).await {
            debug!(id = %id, pid = tracked, error = %e, "failed to kill unmonitored process");
        }
        if let Err(e) = shim.delete(tracked).await {
            debug!(id = %id, pid = tracked, error = %e, "failed to remove unmonitored process");
        }
        let _ = responder.send(Err(e));
        return;
    }

    metrics.exec_process.update_since(start);
    info!(id = %id, process = %process_id, pid, "process started");

    if responder.send(Ok(pid)).is_err() {
        debug!(id = %id, pid, "exec caller went away");
    }

    let event = Event::new(id.as_str(), pid, EventKind::StartProcess);
    if let Err(e) = collector.publish(event).await {
        debug!(id = %id, pid, error = %e, "start-process event not published");
    }
}

/// Confirm the shim tracks the new process under the pid it returned, so
/// its exit will be reported. On failure the error comes with the pid to
/// clean up: the one the shim tracks the process under, if any.
async fn monitor(
    shim: &dyn Shim,
    process_id: &str,
    pid: u32,
) -> std::result::Result<(), (Error, u32)> {
    let state = shim.state().await.map_err(|e| (e, pid))?;
    match state.processes.iter().find(|p| p.id == process_id) {
        Some(p) if p.pid == pid => Ok(()),
        Some(p) => Err((
            Error::Internal(format!(
                "process {process_id} is tracked as pid {}, expected {pid}",
                p.pid
            )),
            p.pid,
        )),
        None => Err((
            Error::Internal(format!(
                "process {process_id} ({pid}) is not tracked by the shim"
            )),
            pid,
        )),
    }
}
