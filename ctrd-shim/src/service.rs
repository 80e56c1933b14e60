//! Container state machine for a single container.
//!
//! The service owns the container's record, serializes lifecycle
//! operations, spawns an exit monitor for every process it starts and
//! broadcasts lifecycle events. It is used directly for in-process shims
//! and behind [`crate::grpc::ShimGrpc`] in the `ctrd-shim` binary.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_stream::Stream;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::process::{
    CreateOptions, DeleteResult, ExecOptions, ProcessState, State, Status, check_id,
    check_process_id,
};
use crate::runtime::Runtime;

const EVENT_BUFFER: usize = 256;
const SIGKILL: u32 = 9;

struct Process {
    pid: u32,
    status: Status,
    exit_status: u32,
}

struct Container {
    id: String,
    bundle: PathBuf,
    status: Status,
    pid: u32,
    exit_status: u32,
    processes: HashMap<String, Process>,
}

impl Container {
    fn is_init(&self, pid: u32) -> bool {
        pid == 0 || pid == self.pid
    }

    fn snapshot(&self) -> State {
        let mut processes: Vec<ProcessState> = self
            .processes
            .iter()
            .map(|(id, p)| ProcessState {
                id: id.clone(),
                pid: p.pid,
                status: p.status,
                exit_status: p.exit_status,
            })
            .collect();
        processes.sort_by(|a, b| a.id.cmp(&b.id));

        State {
            id: self.id.clone(),
            bundle: self.bundle.clone(),
            status: self.status,
            pid: self.pid,
            exit_status: self.exit_status,
            processes,
        }
    }
}

pub struct ShimService {
    runtime: Arc<dyn Runtime>,
    container: Mutex<Option<Container>>,
    /// Serializes lifecycle operations; never taken by exit handling.
    ops: tokio::sync::Mutex<()>,
    events: broadcast::Sender<Event>,
    shutdown: watch::Sender<bool>,
}

impl ShimService {
    pub fn new(runtime: Arc<dyn Runtime>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            runtime,
            container: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
            events,
            shutdown,
        })
    }

    fn container(&self) -> MutexGuard<'_, Option<Container>> {
        self.container.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the container record, failing if none was created.
    fn with_container<T>(&self, f: impl FnOnce(&mut Container) -> Result<T>) -> Result<T> {
        let mut guard = self.container();
        let container = guard
            .as_mut()
            .ok_or_else(|| Error::FailedPrecondition("container not created".into()))?;
        f(container)
    }

    fn emit(&self, event: Event) {
        debug!("Emitting {} event for {} (pid {})", event.kind, event.id, event.pid);
        // No receivers is fine; nobody is watching yet
        let _ = self.events.send(event);
    }

    pub async fn create(self: &Arc<Self>, opts: CreateOptions) -> Result<u32> {
        let _op = self.ops.lock().await;

        check_id("container", &opts.id).map_err(Error::InvalidArgument)?;
        if opts.bundle.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("bundle path is required".into()));
        }
        if let Some(existing) = self.container().as_ref() {
            return Err(Error::AlreadyExists(format!("container {}", existing.id)));
        }

        info!("Creating container {} from {}", opts.id, opts.bundle.display());
        let pid = self
            .runtime
            .create(&opts.id, &opts.bundle, &opts.stdio)
            .await?;

        *self.container() = Some(Container {
            id: opts.id.clone(),
            bundle: opts.bundle,
            status: Status::Created,
            pid,
            exit_status: 0,
            processes: HashMap::new(),
        });
        self.monitor(pid);

        info!("Container {} created with init pid {pid}", opts.id);
        self.emit(Event::new(opts.id, pid, EventKind::Create));
        Ok(pid)
    }

    pub async fn start(&self) -> Result<()> {
        let _op = self.ops.lock().await;

        let (id, pid) = self.with_container(|c| match c.status {
            Status::Created => Ok((c.id.clone(), c.pid)),
            status => Err(Error::FailedPrecondition(format!(
                "container {} is {status}, expected created",
                c.id
            ))),
        })?;

        self.runtime.start(&id).await?;

        self.with_container(|c| {
            // The init process may already have exited
            if c.status == Status::Created {
                c.status = Status::Running;
            }
            Ok(())
        })?;

        info!("Container {id} started");
        self.emit(Event::new(id, pid, EventKind::StartContainer));
        Ok(())
    }

    pub async fn exec(self: &Arc<Self>, opts: ExecOptions) -> Result<u32> {
        let _op = self.ops.lock().await;

        check_process_id(&opts.process_id).map_err(Error::InvalidArgument)?;
        if opts.spec.args.is_empty() {
            return Err(Error::InvalidArgument("process args are required".into()));
        }

        let id = self.with_container(|c| {
            if c.status != Status::Running {
                return Err(Error::FailedPrecondition(format!(
                    "container {} is {}, expected running",
                    c.id, c.status
                )));
            }
            if c.processes.contains_key(&opts.process_id) {
                return Err(Error::AlreadyExists(format!("process {}", opts.process_id)));
            }
            Ok(c.id.clone())
        })?;

        let pid = self
            .runtime
            .exec(&id, &opts.process_id, &opts.spec, &opts.stdio)
            .await?;

        self.with_container(|c| {
            c.processes.insert(
                opts.process_id.clone(),
                Process {
                    pid,
                    status: Status::Running,
                    exit_status: 0,
                },
            );
            Ok(())
        })?;
        self.monitor(pid);

        info!("Process {} started in {id} with pid {pid}", opts.process_id);
        Ok(pid)
    }

    pub async fn kill(&self, pid: u32, signal: u32, all: bool) -> Result<()> {
        enum Target {
            Init(String),
            Process(u32),
        }

        let target = self.with_container(|c| {
            if c.is_init(pid) {
                return Ok(Target::Init(c.id.clone()));
            }
            match c.processes.values().find(|p| p.pid == pid) {
                Some(p) if p.status != Status::Stopped => Ok(Target::Process(pid)),
                _ => Err(Error::NotFound(format!("process {pid}"))),
            }
        })?;

        match target {
            Target::Init(id) => self.runtime.kill(&id, signal, all).await,
            Target::Process(pid) => self.runtime.signal(pid, signal).await,
        }
    }

    pub async fn delete(&self, pid: u32) -> Result<DeleteResult> {
        let _op = self.ops.lock().await;

        let init = self.with_container(|c| Ok(c.is_init(pid)))?;
        if init {
            self.delete_container().await
        } else {
            self.delete_process(pid).await
        }
    }

    async fn delete_container(&self) -> Result<DeleteResult> {
        let id = self.with_container(|c| match c.status {
            Status::Created | Status::Stopped => Ok(c.id.clone()),
            status => Err(Error::FailedPrecondition(format!(
                "container {} is {status}",
                c.id
            ))),
        })?;

        self.runtime.delete(&id).await?;

        let container = self
            .container()
            .take()
            .ok_or_else(|| Error::FailedPrecondition("container not created".into()))?;

        info!("Container {id} deleted");
        let event = Event::new(id, container.pid, EventKind::Delete);
        self.emit(event.with_exit_status(container.exit_status));
        Ok(DeleteResult {
            pid: container.pid,
            exit_status: container.exit_status,
            container: true,
        })
    }

    async fn delete_process(&self, pid: u32) -> Result<DeleteResult> {
        let (process_id, running) = self.with_container(|c| {
            c.processes
                .iter()
                .find(|(_, p)| p.pid == pid)
                .map(|(id, p)| (id.clone(), p.status != Status::Stopped))
                .ok_or_else(|| Error::NotFound(format!("process {pid}")))
        })?;

        if running && let Err(e) = self.runtime.signal(pid, SIGKILL).await {
            warn!("Failed to kill process {process_id} ({pid}): {e}");
        }

        let exit_status = self.with_container(|c| {
            Ok(c.processes
                .remove(&process_id)
                .map(|p| p.exit_status)
                .unwrap_or_default())
        })?;

        info!("Process {process_id} ({pid}) deleted");
        Ok(DeleteResult {
            pid,
            exit_status,
            container: false,
        })
    }

    pub async fn pause(&self) -> Result<()> {
        self.transition(Status::Running, Status::Paused, EventKind::Pause)
            .await
    }

    pub async fn resume(&self) -> Result<()> {
        self.transition(Status::Paused, Status::Running, EventKind::Resume)
            .await
    }

    async fn transition(&self, from: Status, to: Status, kind: EventKind) -> Result<()> {
        let _op = self.ops.lock().await;

        let (id, pid) = self.with_container(|c| {
            if c.status != from {
                return Err(Error::FailedPrecondition(format!(
                    "container {} is {}, expected {from}",
                    c.id, c.status
                )));
            }
            Ok((c.id.clone(), c.pid))
        })?;

        match kind {
            EventKind::Pause => self.runtime.pause(&id).await?,
            _ => self.runtime.resume(&id).await?,
        }

        self.with_container(|c| {
            if c.status == from {
                c.status = to;
            }
            Ok(())
        })?;

        info!("Container {id} is {to}");
        self.emit(Event::new(id, pid, kind));
        Ok(())
    }

    pub fn state(&self) -> Result<State> {
        self.with_container(|c| Ok(c.snapshot()))
    }

    /// Stream of lifecycle events from now until the shim shuts down.
    /// Events broadcast before the shutdown are delivered first.
    pub fn events(&self) -> impl Stream<Item = Event> + Send + 'static {
        let mut rx = self.events.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        async_stream::stream! {
            loop {
                let event = tokio::select! {
                    biased;
                    event = rx.recv() => event,
                    _ = shutdown.wait_for(|stop| *stop) => break,
                };
                match event {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Event subscriber lagged, {n} events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Ask the shim to stop. Refused while a container exists unless `now`.
    pub fn shutdown(&self, now: bool) -> Result<()> {
        if !now && let Some(c) = self.container().as_ref() {
            return Err(Error::FailedPrecondition(format!(
                "container {} has not been deleted",
                c.id
            )));
        }
        info!("Shutdown requested");
        self.shutdown.send_replace(true);
        Ok(())
    }

    /// Resolves once [`ShimService::shutdown`] succeeded.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    fn monitor(self: &Arc<Self>, pid: u32) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let exit_status = service.runtime.wait(pid).await;
            service.process_exited(pid, exit_status);
        });
    }

    fn process_exited(&self, pid: u32, exit_status: u32) {
        let id = {
            let mut guard = self.container();
            let Some(c) = guard.as_mut() else {
                debug!("Exit of pid {pid} after container was deleted");
                return;
            };

            if c.pid == pid {
                c.status = Status::Stopped;
                c.exit_status = exit_status;
            } else if let Some(p) = c.processes.values_mut().find(|p| p.pid == pid) {
                p.status = Status::Stopped;
                p.exit_status = exit_status;
            } else {
                debug!("Exit of untracked pid {pid}");
                return;
            }
            c.id.clone()
        };

        info!("Process {pid} in {id} exited with status {exit_status}");
        self.emit(Event::new(id, pid, EventKind::Exit).with_exit_status(exit_status));
    }
}
