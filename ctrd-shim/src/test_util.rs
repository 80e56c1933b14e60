//! Test utilities: a scriptable in-memory [`Runtime`].
//!
//! `FakeRuntime` hands out increasing pids and never touches the host.
//! Process exits are triggered explicitly with [`FakeRuntime::exit`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::process::{ProcessSpec, Stdio};
use crate::runtime::Runtime;

#[derive(Default)]
struct Calls {
    exits: HashMap<u32, oneshot::Sender<u32>>,
    waiters: HashMap<u32, oneshot::Receiver<u32>>,
    signals: Vec<(u32, u32)>,
    kills: Vec<(String, u32, bool)>,
    deleted: Vec<String>,
}

pub struct FakeRuntime {
    next_pid: AtomicU32,
    fail_create: AtomicBool,
    fail_exec: AtomicBool,
    calls: Mutex<Calls>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            fail_create: AtomicBool::new(false),
            fail_exec: AtomicBool::new(false),
            calls: Mutex::new(Calls::default()),
        }
    }

    fn calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_process(&self) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let mut calls = self.calls();
        calls.exits.insert(pid, tx);
        calls.waiters.insert(pid, rx);
        pid
    }

    /// Make `pid` exit with `status`.
    pub fn exit(&self, pid: u32, status: u32) {
        if let Some(tx) = self.calls().exits.remove(&pid) {
            let _ = tx.send(status);
        }
    }

    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_exec(&self) {
        self.fail_exec.store(true, Ordering::SeqCst);
    }

    /// Signals sent to individual pids.
    pub fn signals(&self) -> Vec<(u32, u32)> {
        self.calls().signals.clone()
    }

    /// Container-level kills as `(id, signal, all)`.
    pub fn kills(&self) -> Vec<(String, u32, bool)> {
        self.calls().kills.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.calls().deleted.clone()
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create(&self, id: &str, _bundle: &Path, _stdio: &Stdio) -> Result<u32> {
        if self.fail_create.swap(false, Ordering::SeqCst) {
            return Err(Error::Runtime(format!("create {id} failed")));
        }
        Ok(self.spawn_process())
    }

    async fn start(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        process_id: &str,
        _spec: &ProcessSpec,
        _stdio: &Stdio,
    ) -> Result<u32> {
        if self.fail_exec.swap(false, Ordering::SeqCst) {
            return Err(Error::Runtime(format!("exec {process_id} in {id} failed")));
        }
        Ok(self.spawn_process())
    }

    async fn kill(&self, id: &str, signal: u32, all: bool) -> Result<()> {
        self.calls().kills.push((id.to_string(), signal, all));
        Ok(())
    }

    async fn signal(&self, pid: u32, signal: u32) -> Result<()> {
        self.calls().signals.push((pid, signal));
        Ok(())
    }

    async fn pause(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn resume(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.calls().deleted.push(id.to_string());
        Ok(())
    }

    async fn wait(&self, pid: u32) -> u32 {
        let waiter = self.calls().waiters.remove(&pid);
        match waiter {
            Some(rx) => rx.await.unwrap_or(255),
            None => std::future::pending().await,
        }
    }
}
