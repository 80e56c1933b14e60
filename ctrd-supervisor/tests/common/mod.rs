//! Shared test utilities for ctrd-supervisor integration tests.

use ctrd_shim::Runtime;
use ctrd_shim::test_util::FakeRuntime;
use ctrd_supervisor::proto::execution_service_client::ExecutionServiceClient;
use ctrd_supervisor::shim::{LocalLauncher, unix_channel};
use ctrd_supervisor::{Config, Supervisor, grpc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

/// Runtimes handed to the in-process shims, by container ID.
pub type Runtimes = Arc<Mutex<HashMap<String, Arc<FakeRuntime>>>>;

/// Test server wrapper: a supervisor with in-process shims on fake
/// runtimes, served over a unix socket in a temp directory.
pub struct TestServer {
    pub client: ExecutionServiceClient<Channel>,
    pub supervisor: Arc<Supervisor>,
    pub root: PathBuf,
    runtimes: Runtimes,
    fail_create: Arc<AtomicBool>,
    token: CancellationToken,
    _tmp: TempDir,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let tmp = TempDir::new().expect("Failed to create temp dir");
        let root = tmp.path().join("root");
        let socket = tmp.path().join("ctrd.sock");

        let runtimes: Runtimes = Arc::new(Mutex::new(HashMap::new()));
        let fail_create = Arc::new(AtomicBool::new(false));
        let launcher = {
            let runtimes = runtimes.clone();
            let fail_create = fail_create.clone();
            LocalLauncher::new(Arc::new(move |id: &str, _work_dir: &Path| {
                let runtime = Arc::new(FakeRuntime::new());
                if fail_create.swap(false, Ordering::SeqCst) {
                    runtime.fail_next_create();
                }
                runtimes
                    .lock()
                    .unwrap()
                    .insert(id.to_string(), runtime.clone());
                runtime as Arc<dyn Runtime>
            }))
        };

        let config = Config {
            root: root.clone(),
            exec_workers: 2,
            exec_queue_depth: 16,
        };
        let token = CancellationToken::new();
        let supervisor = Arc::new(
            Supervisor::new(config, Arc::new(launcher), token.clone())
                .await
                .expect("Failed to create supervisor"),
        );

        let listener = UnixListener::bind(&socket).expect("Failed to bind");
        {
            let supervisor = supervisor.clone();
            let token = token.clone();
            tokio::spawn(async move {
                grpc::serve(supervisor, listener, token.cancelled_owned())
                    .await
                    .expect("Server failed");
            });
        }

        let channel = unix_channel(&socket).await.expect("Failed to connect");
        Self {
            client: ExecutionServiceClient::new(channel),
            supervisor,
            root,
            runtimes,
            fail_create,
            token,
            _tmp: tmp,
        }
    }

    /// Fake runtime backing container `id`.
    pub fn runtime(&self, id: &str) -> Arc<FakeRuntime> {
        self.runtimes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .expect("No runtime for container")
    }
}

impl TestServer {
    /// Make the runtime of the next launched shim fail its create.
    pub fn fail_next_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
