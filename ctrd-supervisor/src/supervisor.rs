//! Container registry and lifecycle orchestration.
//!
//! The supervisor maps container IDs to shim clients. The registry lock is
//! only ever held for map access; every shim call happens outside it.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ctrd_shim::{CreateOptions, DeleteResult, ExecOptions, ProcessState, State, Status};

use crate::Config;
use crate::bundle::Bundle;
use crate::collector::{Collector, Subscription};
use crate::error::{Error, Result};
use crate::exec::{ExecHandle, ExecPool};
use crate::metrics::Metrics;
use crate::shim::{Shim, ShimLauncher};

/// A container as reported by its shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub bundle: PathBuf,
    pub status: Status,
    pub pid: u32,
    pub processes: Vec<ProcessState>,
}

impl ContainerSummary {
    fn from_state(id: &str, state: State) -> Self {
        Self {
            id: id.to_string(),
            bundle: state.bundle,
            status: state.status,
            pid: state.pid,
            processes: state.processes,
        }
    }
}

#[derive(Clone)]
struct Container {
    bundle: Bundle,
    shim: Arc<dyn Shim>,
}

enum Slot {
    /// Reserved by an in-flight create; invisible to lookups.
    Creating,
    Ready(Container),
    /// Shim shutdown and work directory removal in progress. The ID stays
    /// taken but the container is invisible to lookups.
    Deleting,
}

/// Releases a `Deleting` slot once cleanup finishes or is abandoned.
struct DeletingSlot<'a> {
    supervisor: &'a Supervisor,
    id: &'a str,
}

impl Drop for DeletingSlot<'_> {
    fn drop(&mut self) {
        let mut containers = self.supervisor.containers();
        if matches!(containers.get(self.id), Some(Slot::Deleting)) {
            containers.remove(self.id);
        }
    }
}

pub struct Supervisor {
    root: PathBuf,
    launcher: Arc<dyn ShimLauncher>,
    containers: Mutex<HashMap<String, Slot>>,
    collector: Collector,
    exec: ExecPool,
    metrics: Arc<Metrics>,
}

/// Container IDs name directories under the root, so they must be a single
/// plain path component.
pub fn validate_id(id: &str) -> Result<()> {
    ctrd_shim::check_id("container", id).map_err(Error::InvalidArgument)
}

impl Supervisor {
    /// Create the supervisor and reattach to shims left behind under
    /// `config.root` by a previous run. Event collection stops when `token`
    /// is cancelled.
    pub async fn new(
        config: Config,
        launcher: Arc<dyn ShimLauncher>,
        token: CancellationToken,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root).await?;

        let collector = Collector::new(token);
        let metrics = Arc::new(Metrics::default());
        let exec = ExecPool::new(
            config.exec_workers,
            config.exec_queue_depth,
            collector.clone(),
            metrics.clone(),
        );

        let supervisor = Self {
            root: config.root,
            launcher,
            containers: Mutex::new(HashMap::new()),
            collector,
            exec,
            metrics,
        };
        supervisor.load_shims().await?;

        Ok(supervisor)
    }

    fn containers(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: &str) -> Result<Container> {
        match self.containers().get(id) {
            Some(Slot::Ready(container)) => Ok(container.clone()),
            _ => Err(Error::NotFound(id.to_string())),
        }
    }

    /// IDs of all fully created containers, sorted.
    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .containers()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create(&self, opts: CreateOptions) -> Result<u32> {
        validate_id(&opts.id)?;
        if opts.bundle.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("bundle path is required".into()));
        }

        {
            let mut containers = self.containers();
            if containers.contains_key(&opts.id) {
                return Err(Error::AlreadyExists(opts.id));
            }
            containers.insert(opts.id.clone(), Slot::Creating);
        }

        let id = opts.id.clone();
        match self.bootstrap(opts).await {
            Ok(pid) => {
                info!(id = %id, pid, "container created");
                Ok(pid)
            }
            Err(e) => {
                self.containers().remove(&id);
                warn!(id = %id, error = %e, "container create failed");
                Err(e)
            }
        }
    }

    async fn bootstrap(&self, opts: CreateOptions) -> Result<u32> {
        let id = opts.id.clone();
        let bundle = Bundle::load(&id, &opts.bundle, self.root.join(&id));

        bundle.create_work_dir().await.map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(id.clone()),
            _ => Error::Io(e),
        })?;

        let shim = match self.launcher.launch(&bundle).await {
            Ok(shim) => shim,
            Err(e) => {
                self.discard(&bundle, None).await;
                return Err(e);
            }
        };

        let result = async {
            // Subscribe before the shim creates anything so no event is lost
            let events = shim.events().await?;
            self.collector.collect(&id, events)?;

            self.containers().insert(
                id.clone(),
                Slot::Ready(Container {
                    bundle: bundle.clone(),
                    shim: shim.clone(),
                }),
            );

            shim.create(opts).await
        }
        .await;

        if result.is_err() {
            self.discard(&bundle, Some(shim.as_ref())).await;
        }
        result
    }

    /// Best-effort teardown of a container that never became usable.
    async fn discard(&self, bundle: &Bundle, shim: Option<&dyn Shim>) {
        if let Some(shim) = shim
            && let Err(e) = shim.shutdown().await
        {
            debug!(id = %bundle.id, error = %e, "failed to shut down shim");
        }
        if let Err(e) = bundle.remove_work_dir().await {
            warn!(id = %bundle.id, error = %e, "failed to remove work dir");
        }
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let container = self.lookup(id)?;
        container.shim.start().await?;
        info!(id, "container started");
        Ok(())
    }

    /// Delete an exec'd process, or the container itself when `pid` is 0
    /// or the init pid. Deleting the container removes it from the
    /// registry, stops its shim and removes its work directory.
    pub async fn delete(&self, id: &str, pid: u32) -> Result<DeleteResult> {
        let container = self.lookup(id)?;
        let result = container.shim.delete(pid).await?;

        if result.container {
            let _slot = {
                let mut containers = self.containers();
                let ours = matches!(
                    containers.get(id),
                    Some(Slot::Ready(c)) if Arc::ptr_eq(&c.shim, &container.shim)
                );
                if ours {
                    containers.insert(id.to_string(), Slot::Deleting);
                }
                ours.then_some(DeletingSlot { supervisor: self, id })
            };
            if let Err(e) = container.shim.shutdown().await {
                warn!(id, error = %e, "failed to shut down shim");
            }
            if let Err(e) = container.bundle.remove_work_dir().await {
                warn!(id, error = %e, "failed to remove work dir");
            }
            info!(id, exit_status = result.exit_status, "container deleted");
        } else {
            info!(id, pid, "process deleted");
        }

        Ok(result)
    }

    /// Summaries of all containers, sorted by ID. The first shim that
    /// cannot be queried fails the whole call.
    pub async fn list(&self, owner: &[String]) -> Result<Vec<ContainerSummary>> {
        if !owner.is_empty() {
            return Err(Error::Unimplemented("filtering containers by owner".into()));
        }

        let snapshot: Vec<(String, Arc<dyn Shim>)> = self
            .containers()
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Ready(c) => Some((id.clone(), c.shim.clone())),
                Slot::Creating | Slot::Deleting => None,
            })
            .collect();

        let mut summaries = Vec::with_capacity(snapshot.len());
        for (id, shim) in snapshot {
            let state = shim.state().await?;
            summaries.push(ContainerSummary::from_state(&id, state));
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    pub async fn get(&self, id: &str) -> Result<ContainerSummary> {
        let container = self.lookup(id)?;
        let state = container.shim.state().await?;
        Ok(ContainerSummary::from_state(id, state))
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.lookup(id)?.shim.pause().await?;
        info!(id, "container paused");
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.lookup(id)?.shim.resume().await?;
        info!(id, "container resumed");
        Ok(())
    }

    pub async fn kill(&self, id: &str, pid: u32, signal: u32, all: bool) -> Result<()> {
        self.lookup(id)?.shim.kill(pid, signal, all).await?;
        debug!(id, pid, signal, all, "signal delivered");
        Ok(())
    }

    /// Queue a process start. The returned handle resolves once a worker
    /// has started and registered the process.
    pub async fn exec(&self, id: &str, opts: ExecOptions) -> Result<ExecHandle> {
        ctrd_shim::check_process_id(&opts.process_id).map_err(Error::InvalidArgument)?;
        let container = self.lookup(id)?;
        self.exec.submit(id, opts, container.shim).await
    }

    pub async fn update(&self, id: &str) -> Result<()> {
        Err(Error::Unimplemented(format!("updating container {id}")))
    }

    /// Subscribe to the events of all containers.
    pub fn events(&self) -> Result<Subscription> {
        self.collector.subscribe()
    }

    async fn load_shims(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let work_dir = entry.path();
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %work_dir.display(), "skipping non UTF-8 directory");
                continue;
            };
            if let Err(e) = validate_id(&id) {
                warn!(path = %work_dir.display(), error = %e, "skipping unexpected directory");
                continue;
            }

            // The bundle path is only known once the shim reports it
            let bundle = Bundle::load(&id, PathBuf::new(), work_dir);
            match self.reattach(bundle.clone()).await {
                Ok(container) => {
                    info!(
                        id = %id,
                        bundle = %container.bundle.path.display(),
                        "recovered container"
                    );
                    self.containers().insert(id, Slot::Ready(container));
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "shim not reachable, cleaning up");
                    if let Err(e) = bundle.remove_work_dir().await {
                        warn!(id = %id, error = %e, "failed to remove stale work dir");
                    }
                }
            }
        }

        Ok(())
    }

    async fn reattach(&self, mut bundle: Bundle) -> Result<Container> {
        let shim = self.launcher.connect(&bundle).await?;

        let result = async {
            let state = shim.state().await?;
            let events = shim.events().await?;
            self.collector.collect(&bundle.id, events)?;
            Ok::<_, Error>(state)
        }
        .await;

        match result {
            Ok(state) => {
                bundle.path = state.bundle;
                Ok(Container { bundle, shim })
            }
            Err(e) => {
                if let Err(e) = shim.shutdown().await {
                    debug!(id = %bundle.id, error = %e, "failed to shut down unusable shim");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockLauncher;
    use ctrd_shim::{Event, EventKind, ProcessSpec, Stdio};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<MockLauncher>, Supervisor) {
        let tmp = TempDir::new().unwrap();
        let launcher = MockLauncher::new();
        let supervisor = setup_with(&tmp, launcher.clone()).await;
        (tmp, launcher, supervisor)
    }

    async fn setup_with(tmp: &TempDir, launcher: Arc<MockLauncher>) -> Supervisor {
        let config = Config {
            root: tmp.path().join("root"),
            ..Default::default()
        };
        Supervisor::new(config, launcher, CancellationToken::new())
            .await
            .unwrap()
    }

    fn create_opts(id: &str, bundle: &str) -> CreateOptions {
        CreateOptions {
            id: id.to_string(),
            bundle: PathBuf::from(bundle),
            stdio: Stdio::default(),
        }
    }

    fn exec_opts(process_id: &str) -> ExecOptions {
        ExecOptions {
            process_id: process_id.to_string(),
            spec: ProcessSpec {
                args: vec!["sh".into()],
                ..Default::default()
            },
            stdio: Stdio::default(),
        }
    }

    async fn next_event(sub: &mut Subscription) -> Event {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (_tmp, _launcher, supervisor) = setup().await;

        supervisor.create(create_opts("c2", "/bundles/c2")).await.unwrap();
        supervisor.create(create_opts("c1", "/bundles/c1")).await.unwrap();

        let list = supervisor.list(&[]).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "c1");
        assert_eq!(list[1].id, "c2");
        assert_eq!(list[0].status, Status::Created);
        assert!(supervisor.root().join("c1").is_dir());
    }

    #[tokio::test]
    async fn test_duplicate_create_keeps_original() {
        let (_tmp, _launcher, supervisor) = setup().await;

        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();
        let err = supervisor
            .create(create_opts("c1", "/other"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let list = supervisor.list(&[]).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "c1");
        assert_eq!(list[0].bundle, PathBuf::from("/bundle"));
    }

    #[tokio::test]
    async fn test_concurrent_create_same_id() {
        let (_tmp, _launcher, supervisor) = setup().await;

        let (a, b) = tokio::join!(
            supervisor.create(create_opts("c1", "/a")),
            supervisor.create(create_opts("c1", "/b")),
        );
        assert!(a.is_ok() != b.is_ok());
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(supervisor.container_ids(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let (_tmp, _launcher, supervisor) = setup().await;
        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();

        assert!(matches!(supervisor.delete("missing", 0).await, Err(Error::NotFound(_))));
        assert!(matches!(supervisor.start("missing").await, Err(Error::NotFound(_))));
        assert!(matches!(supervisor.get("missing").await, Err(Error::NotFound(_))));
        assert!(matches!(supervisor.pause("missing").await, Err(Error::NotFound(_))));
        assert!(matches!(supervisor.resume("missing").await, Err(Error::NotFound(_))));
        assert!(matches!(
            supervisor.kill("missing", 0, 15, false).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            supervisor.exec("missing", exec_opts("p1")).await,
            Err(Error::NotFound(_))
        ));

        assert_eq!(supervisor.container_ids(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let (_tmp, _launcher, supervisor) = setup().await;

        let long = "x".repeat(ctrd_shim::process::MAX_ID_LEN + 1);
        for id in ["", ".", "..", "a/b", long.as_str()] {
            let err = supervisor.create(create_opts(id, "/bundle")).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "id {id:?}");
        }

        let err = supervisor.create(create_opts("c1", "")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(supervisor.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_container() {
        let (_tmp, launcher, supervisor) = setup().await;
        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();
        let shim = launcher.shim("c1").unwrap();

        let result = supervisor.delete("c1", 0).await.unwrap();
        assert!(result.container);
        assert!(supervisor.container_ids().is_empty());
        assert!(shim.is_shut_down());
        assert!(!supervisor.root().join("c1").exists());
        assert!(matches!(supervisor.get("c1").await, Err(Error::NotFound(_))));

        // The ID can be reused
        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();
    }

    #[tokio::test]
    async fn test_id_stays_taken_until_delete_cleanup_finishes() {
        let (_tmp, launcher, supervisor) = setup().await;
        let supervisor = Arc::new(supervisor);
        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();
        let shim = launcher.shim("c1").unwrap();
        shim.block_shutdown();

        let deleting = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.delete("c1", 0).await })
        };
        tokio::time::timeout(Duration::from_secs(5), shim.shutdown_entered())
            .await
            .unwrap();

        // Gone for lookups, but the ID and work dir are still held
        assert!(matches!(supervisor.get("c1").await, Err(Error::NotFound(_))));
        assert!(supervisor.container_ids().is_empty());
        assert!(supervisor.list(&[]).await.unwrap().is_empty());
        let err = supervisor.create(create_opts("c1", "/other")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(supervisor.root().join("c1").is_dir());

        shim.release_shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), deleting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.container);
        assert!(!supervisor.root().join("c1").exists());

        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();
        assert_eq!(supervisor.container_ids(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_exec_process_keeps_container() {
        let (_tmp, _launcher, supervisor) = setup().await;
        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();
        supervisor.start("c1").await.unwrap();

        let pid = supervisor.exec("c1", exec_opts("p1")).await.unwrap().await.unwrap();
        let summary = supervisor.get("c1").await.unwrap();
        assert_eq!(summary.processes.len(), 1);
        assert_eq!(summary.processes[0].pid, pid);

        let result = supervisor.delete("c1", pid).await.unwrap();
        assert!(!result.container);
        assert_eq!(supervisor.container_ids(), vec!["c1".to_string()]);
        assert!(supervisor.get("c1").await.unwrap().processes.is_empty());
    }

    #[tokio::test]
    async fn test_exec_requires_valid_process_id() {
        let (_tmp, launcher, supervisor) = setup().await;
        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();

        for process_id in ["", "init", "../../escaped", "a/b"] {
            let err = supervisor.exec("c1", exec_opts(process_id)).await.err().unwrap();
            assert!(matches!(err, Error::InvalidArgument(_)), "{process_id:?}");
        }
        let shim = launcher.shim("c1").unwrap();
        assert!(!shim.calls().iter().any(|c| c.starts_with("exec ")));
    }

    #[tokio::test]
    async fn test_shim_create_failure_rolls_back() {
        let (_tmp, launcher, supervisor) = setup().await;
        launcher.fail_next_create();

        let err = supervisor.create(create_opts("c1", "/bundle")).await.unwrap_err();
        assert!(matches!(err, Error::Shim(_)));
        assert!(supervisor.container_ids().is_empty());
        assert!(!supervisor.root().join("c1").exists());
        assert!(launcher.shim("c1").unwrap().is_shut_down());

        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_failure_rolls_back() {
        let (_tmp, launcher, supervisor) = setup().await;
        launcher.fail_next_launch();

        let err = supervisor.create(create_opts("c1", "/bundle")).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(supervisor.container_ids().is_empty());
        assert!(!supervisor.root().join("c1").exists());
    }

    #[tokio::test]
    async fn test_list_fails_fast() {
        let (_tmp, launcher, supervisor) = setup().await;
        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();
        supervisor.create(create_opts("c2", "/bundle")).await.unwrap();

        launcher.shim("c2").unwrap().set_unreachable(true);
        let err = supervisor.list(&[]).await.unwrap_err();
        assert!(matches!(err, Error::Shim(ctrd_shim::Error::Unavailable(_))));

        // Still reachable individually
        supervisor.get("c1").await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let (_tmp, _launcher, supervisor) = setup().await;
        supervisor.create(create_opts("c1", "/bundle")).await.unwrap();

        let err = supervisor.list(&["alice".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Unimplemented(_)));
        let err = supervisor.update("c1").await.unwrap_err();
        assert!(matches!(err, Error::Unimplemented(_)));
    }

    #[tokio::test]
    async fn test_events_seen_from_create() {
        let (_tmp, _launcher, supervisor) = setup().await;
        let mut sub = supervisor.events().unwrap();

        let pid = supervisor.create(create_opts("c1", "/bundle")).await.unwrap();
        let event = next_event(&mut sub).await;
        assert_eq!(event.kind, EventKind::Create);
        assert_eq!(event.id, "c1");
        assert_eq!(event.pid, pid);

        supervisor.start("c1").await.unwrap();
        assert_eq!(next_event(&mut sub).await.kind, EventKind::StartContainer);
    }

    #[tokio::test]
    async fn test_recovery_reattaches_live_shims() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");

        // One live shim and one stale directory
        std::fs::create_dir_all(root.join("c1")).unwrap();
        std::fs::write(root.join("c1").join("shim.sock"), b"").unwrap();
        std::fs::create_dir_all(root.join("stale")).unwrap();

        let launcher = MockLauncher::new();
        let supervisor = setup_with(&tmp, launcher.clone()).await;

        assert_eq!(supervisor.container_ids(), vec!["c1".to_string()]);
        assert!(!root.join("stale").exists());

        let summary = supervisor.get("c1").await.unwrap();
        assert_eq!(summary.bundle, PathBuf::from("/recovered/c1"));
        assert_eq!(summary.status, Status::Running);

        // Events of the recovered shim are collected
        let mut sub = supervisor.events().unwrap();
        let shim = launcher.shim("c1").unwrap();
        let pid = shim.init_pid().unwrap();
        shim.emit(Event::new("c1", pid, EventKind::Exit).with_exit_status(1));

        let event = next_event(&mut sub).await;
        assert_eq!(event.kind, EventKind::Exit);
        assert_eq!(event.pid, pid);
    }

    #[tokio::test]
    async fn test_recovery_cleans_unusable_shim() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("c1")).unwrap();
        std::fs::write(root.join("c1").join("shim.sock"), b"").unwrap();

        let launcher = MockLauncher::new();
        let shim = crate::test_util::MockShim::running("c1");
        shim.set_unreachable(true);
        launcher.insert("c1", shim);

        let supervisor = setup_with(&tmp, launcher).await;
        assert!(supervisor.container_ids().is_empty());
        assert!(!root.join("c1").exists());
    }

    #[tokio::test]
    async fn test_unreadable_root_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::write(&root, b"not a directory").unwrap();

        let config = Config {
            root,
            ..Default::default()
        };
        let result = Supervisor::new(config, MockLauncher::new(), CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
