//! Scriptable shim and launcher for supervisor tests.

use async_trait::async_trait;
use ctrd_shim::{
    CreateOptions, DeleteResult, Event, EventKind, ExecOptions, ProcessState, State, Status,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, broadcast};

use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::shim::{EventStream, Shim, ShimLauncher};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MockState {
    id: String,
    bundle: PathBuf,
    status: Status,
    pid: u32,
    processes: Vec<ProcessState>,
}

pub struct MockShim {
    state: Mutex<Option<MockState>>,
    events: Mutex<Option<broadcast::Sender<Event>>>,
    next_pid: AtomicU32,
    unreachable: AtomicBool,
    fail_create: AtomicBool,
    fail_exec: AtomicBool,
    untrack_exec: AtomicBool,
    skew_exec: AtomicBool,
    block_shutdown: AtomicBool,
    shutdown_entered: Notify,
    shutdown_released: Notify,
    shut_down: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockShim {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(None),
            events: Mutex::new(Some(events)),
            next_pid: AtomicU32::new(100),
            unreachable: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_exec: AtomicBool::new(false),
            untrack_exec: AtomicBool::new(false),
            skew_exec: AtomicBool::new(false),
            block_shutdown: AtomicBool::new(false),
            shutdown_entered: Notify::new(),
            shutdown_released: Notify::new(),
            shut_down: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A shim whose container already runs, as found by recovery.
    pub fn running(id: &str) -> Arc<Self> {
        let shim = Self::new();
        *lock(&shim.state) = Some(MockState {
            id: id.to_string(),
            bundle: PathBuf::from("/recovered").join(id),
            status: Status::Running,
            pid: shim.next_pid.fetch_add(1, Ordering::SeqCst),
            processes: Vec::new(),
        });
        shim
    }

    fn check(&self, call: String) -> Result<()> {
        lock(&self.calls).push(call);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Shim(ctrd_shim::Error::Unavailable(
                "connection refused".into(),
            )));
        }
        Ok(())
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// End every event stream handed out so far.
    pub fn close_events(&self) {
        lock(&self.events).take();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_exec(&self) {
        self.fail_exec.store(true, Ordering::SeqCst);
    }

    /// Next exec succeeds but the process does not show up in the state.
    pub fn untrack_next_exec(&self) {
        self.untrack_exec.store(true, Ordering::SeqCst);
    }

    /// Next exec tracks the process under its real pid but reports a
    /// different one to the caller.
    pub fn skew_next_exec(&self) {
        self.skew_exec.store(true, Ordering::SeqCst);
    }

    /// Hold the next shutdown until [`MockShim::release_shutdown`].
    pub fn block_shutdown(&self) {
        self.block_shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait until a blocked shutdown has been called.
    pub async fn shutdown_entered(&self) {
        self.shutdown_entered.notified().await;
    }

    pub fn release_shutdown(&self) {
        self.shutdown_released.notify_one();
    }

    /// Processes the shim currently tracks, without recording a call.
    pub fn processes(&self) -> Vec<ProcessState> {
        lock(&self.state)
            .as_ref()
            .map(|s| s.processes.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn init_pid(&self) -> Option<u32> {
        lock(&self.state).as_ref().map(|s| s.pid)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> Result<T>) -> Result<T> {
        let mut guard = lock(&self.state);
        let state = guard.as_mut().ok_or_else(|| {
            Error::Shim(ctrd_shim::Error::FailedPrecondition("container not created".into()))
        })?;
        f(state)
    }
}

#[async_trait]
impl Shim for MockShim {
    async fn create(&self, opts: CreateOptions) -> Result<u32> {
        self.check(format!("create {}", opts.id))?;
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(Error::Shim(ctrd_shim::Error::Runtime("create failed".into())));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state) = Some(MockState {
            id: opts.id.clone(),
            bundle: opts.bundle,
            status: Status::Created,
            pid,
            processes: Vec::new(),
        });
        self.emit(Event::new(opts.id, pid, EventKind::Create));
        Ok(pid)
    }

    async fn start(&self) -> Result<()> {
        self.check("start".into())?;
        let (id, pid) = self.with_state(|s| {
            s.status = Status::Running;
            Ok((s.id.clone(), s.pid))
        })?;
        self.emit(Event::new(id, pid, EventKind::StartContainer));
        Ok(())
    }

    async fn exec(&self, opts: ExecOptions) -> Result<u32> {
        self.check(format!("exec {}", opts.process_id))?;
        if self.fail_exec.swap(false, Ordering::SeqCst) {
            return Err(Error::Shim(ctrd_shim::Error::Runtime("exec failed".into())));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let tracked = !self.untrack_exec.swap(false, Ordering::SeqCst);
        let reported = if self.skew_exec.swap(false, Ordering::SeqCst) {
            pid + 1000
        } else {
            pid
        };
        self.with_state(|s| {
            if tracked {
                s.processes.push(ProcessState {
                    id: opts.process_id,
                    pid,
                    status: Status::Running,
                    exit_status: 0,
                });
            }
            Ok(())
        })?;
        Ok(reported)
    }

    async fn kill(&self, pid: u32, signal: u32, all: bool) -> Result<()> {
        self.check(format!("kill {pid} {signal} {all}"))?;
        self.with_state(|s| {
            if pid == 0 || pid == s.pid || s.processes.iter().any(|p| p.pid == pid) {
                Ok(())
            } else {
                Err(Error::Shim(ctrd_shim::Error::NotFound(format!("process {pid}"))))
            }
        })
    }

    async fn delete(&self, pid: u32) -> Result<DeleteResult> {
        self.check(format!("delete {pid}"))?;
        let mut guard = lock(&self.state);
        let Some(state) = guard.as_mut() else {
            return Err(Error::Shim(ctrd_shim::Error::FailedPrecondition(
                "container not created".into(),
            )));
        };

        if pid == 0 || pid == state.pid {
            let pid = state.pid;
            *guard = None;
            return Ok(DeleteResult {
                pid,
                exit_status: 0,
                container: true,
            });
        }

        let before = state.processes.len();
        state.processes.retain(|p| p.pid != pid);
        if state.processes.len() == before {
            return Err(Error::Shim(ctrd_shim::Error::NotFound(format!("process {pid}"))));
        }
        Ok(DeleteResult {
            pid,
            exit_status: 0,
            container: false,
        })
    }

    async fn pause(&self) -> Result<()> {
        self.check("pause".into())
    }

    async fn resume(&self) -> Result<()> {
        self.check("resume".into())
    }

    async fn state(&self) -> Result<State> {
        self.check("state".into())?;
        self.with_state(|s| {
            Ok(State {
                id: s.id.clone(),
                bundle: s.bundle.clone(),
                status: s.status,
                pid: s.pid,
                exit_status: 0,
                processes: s.processes.clone(),
            })
        })
    }

    async fn events(&self) -> Result<EventStream> {
        self.check("events".into())?;
        let rx = lock(&self.events).as_ref().map(|tx| tx.subscribe());

        let stream = async_stream::stream! {
            if let Some(mut rx) = rx {
                while let Ok(event) = rx.recv().await {
                    yield Ok(event);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn shutdown(&self) -> Result<()> {
        self.check("shutdown".into())?;
        if self.block_shutdown.swap(false, Ordering::SeqCst) {
            self.shutdown_entered.notify_one();
            self.shutdown_released.notified().await;
        }
        self.shut_down.store(true, Ordering::SeqCst);
        self.close_events();
        Ok(())
    }
}

/// Launcher handing out [`MockShim`]s. `connect` succeeds for work
/// directories that contain a `shim.sock` file.
#[derive(Default)]
pub struct MockLauncher {
    shims: Mutex<HashMap<String, Arc<MockShim>>>,
    fail_launch: AtomicBool,
    fail_create: AtomicBool,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn shim(&self, id: &str) -> Option<Arc<MockShim>> {
        lock(&self.shims).get(id).cloned()
    }

    /// Pre-register the shim `connect` hands out for `id`.
    pub fn insert(&self, id: &str, shim: Arc<MockShim>) {
        lock(&self.shims).insert(id.to_string(), shim);
    }

    pub fn fail_next_launch(&self) {
        self.fail_launch.store(true, Ordering::SeqCst);
    }

    /// The next launched shim fails its create call.
    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShimLauncher for MockLauncher {
    async fn launch(&self, bundle: &Bundle) -> Result<Arc<dyn Shim>> {
        let id = bundle.id.as_str();
        if self.fail_launch.swap(false, Ordering::SeqCst) {
            return Err(Error::Internal(format!("failed to spawn shim for {id}")));
        }
        let shim = MockShim::new();
        if self.fail_create.swap(false, Ordering::SeqCst) {
            shim.fail_next_create();
        }
        lock(&self.shims).insert(id.to_string(), shim.clone());
        Ok(shim)
    }

    async fn connect(&self, bundle: &Bundle) -> Result<Arc<dyn Shim>> {
        let id = bundle.id.as_str();
        if !bundle.socket_path().exists() {
            return Err(Error::NotFound(format!("{id} (no shim socket)")));
        }
        let shim = lock(&self.shims)
            .entry(id.to_string())
            .or_insert_with(|| MockShim::running(id))
            .clone();
        Ok(shim)
    }
}
