use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::proto::execution_service_server::{ExecutionService, ExecutionServiceServer};
use crate::proto::*;
use crate::supervisor::{ContainerSummary, Supervisor};

pub struct ExecutionServiceImpl {
    supervisor: Arc<Supervisor>,
}

impl ExecutionServiceImpl {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

/// Serve the execution API on `listener` until `shutdown` resolves.
pub async fn serve(
    supervisor: Arc<Supervisor>,
    listener: UnixListener,
    shutdown: impl Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    Server::builder()
        .trace_fn(|_| tracing::info_span!("grpc", module = "execution"))
        .add_service(ExecutionServiceServer::new(ExecutionServiceImpl::new(
            supervisor,
        )))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await
}

fn status_to_proto(status: ctrd_shim::Status) -> ContainerStatus {
    match status {
        ctrd_shim::Status::Created => ContainerStatus::Created,
        ctrd_shim::Status::Running => ContainerStatus::Running,
        ctrd_shim::Status::Paused => ContainerStatus::Paused,
        ctrd_shim::Status::Stopped => ContainerStatus::Stopped,
    }
}

fn kind_to_proto(kind: ctrd_shim::EventKind) -> EventType {
    use ctrd_shim::EventKind;
    match kind {
        EventKind::Create => EventType::Create,
        EventKind::StartContainer => EventType::StartContainer,
        EventKind::StartProcess => EventType::StartProcess,
        EventKind::Exit => EventType::Exit,
        EventKind::Pause => EventType::Pause,
        EventKind::Resume => EventType::Resume,
        EventKind::Delete => EventType::Delete,
    }
}

fn process_to_proto(p: ctrd_shim::ProcessState) -> Process {
    Process {
        id: p.id,
        pid: p.pid,
        status: status_to_proto(p.status) as i32,
        exit_status: p.exit_status,
    }
}

fn container_to_proto(c: ContainerSummary) -> Container {
    Container {
        id: c.id,
        bundle_path: c.bundle.to_string_lossy().into_owned(),
        status: status_to_proto(c.status) as i32,
        pid: c.pid,
        processes: c.processes.into_iter().map(process_to_proto).collect(),
    }
}

fn event_to_proto(e: ctrd_shim::Event) -> Event {
    Event {
        id: e.id,
        pid: e.pid,
        r#type: kind_to_proto(e.kind) as i32,
        exit_status: e.exit_status,
        timestamp_ns: e.timestamp.timestamp_nanos_opt().unwrap_or_default(),
    }
}

fn stdio(stdin: String, stdout: String, stderr: String, terminal: bool) -> ctrd_shim::Stdio {
    ctrd_shim::Stdio {
        stdin,
        stdout,
        stderr,
        terminal,
    }
}

#[tonic::async_trait]
impl ExecutionService for ExecutionServiceImpl {
    async fn create(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();
        info!(id = %req.id, bundle = %req.bundle_path, "create container");

        let opts = ctrd_shim::CreateOptions {
            id: req.id.clone(),
            bundle: PathBuf::from(&req.bundle_path),
            stdio: stdio(req.stdin, req.stdout, req.stderr, req.console),
        };
        let pid = self.supervisor.create(opts).await?;

        Ok(Response::new(CreateContainerResponse {
            container: Some(Container {
                id: req.id,
                bundle_path: req.bundle_path,
                status: ContainerStatus::Created as i32,
                pid,
                processes: Vec::new(),
            }),
            init_process: Some(Process {
                id: ctrd_shim::INIT_PROCESS_ID.to_string(),
                pid,
                status: ContainerStatus::Created as i32,
                exit_status: 0,
            }),
        }))
    }

    async fn start(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(id = %req.id, "start container");
        self.supervisor.start(&req.id).await?;
        Ok(Response::new(Empty {}))
    }

    async fn exec(
        &self,
        request: Request<ExecProcessRequest>,
    ) -> Result<Response<ExecProcessResponse>, Status> {
        let req = request.into_inner();
        let spec = req
            .spec
            .ok_or_else(|| Status::invalid_argument("process spec is required"))?;
        info!(id = %req.id, process = %req.process_id, "exec process");

        let opts = ctrd_shim::ExecOptions {
            process_id: req.process_id.clone(),
            spec: ctrd_shim::ProcessSpec {
                args: spec.args,
                env: spec.env,
                cwd: spec.cwd,
                uid: spec.uid,
                gid: spec.gid,
            },
            stdio: stdio(req.stdin, req.stdout, req.stderr, req.terminal),
        };

        let pid = self.supervisor.exec(&req.id, opts).await?.await?;

        Ok(Response::new(ExecProcessResponse {
            process: Some(Process {
                id: req.process_id,
                pid,
                status: ContainerStatus::Running as i32,
                exit_status: 0,
            }),
        }))
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(id = %req.id, pid = req.pid, signal = req.signal, all = req.all, "kill");
        self.supervisor
            .kill(&req.id, req.pid, req.signal, req.all)
            .await?;
        Ok(Response::new(Empty {}))
    }

    async fn delete(
        &self,
        request: Request<DeleteContainerRequest>,
    ) -> Result<Response<DeleteContainerResponse>, Status> {
        let req = request.into_inner();
        info!(id = %req.id, pid = req.pid, "delete");

        let result = self.supervisor.delete(&req.id, req.pid).await?;
        Ok(Response::new(DeleteContainerResponse {
            pid: result.pid,
            exit_status: result.exit_status,
        }))
    }

    async fn list(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();
        let containers = self.supervisor.list(&req.owner).await?;
        Ok(Response::new(ListContainersResponse {
            containers: containers.into_iter().map(container_to_proto).collect(),
        }))
    }

    async fn get(
        &self,
        request: Request<GetContainerRequest>,
    ) -> Result<Response<GetContainerResponse>, Status> {
        let req = request.into_inner();
        let container = self.supervisor.get(&req.id).await?;
        Ok(Response::new(GetContainerResponse {
            container: Some(container_to_proto(container)),
        }))
    }

    async fn update(
        &self,
        request: Request<UpdateContainerRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.supervisor.update(&request.into_inner().id).await?;
        Ok(Response::new(Empty {}))
    }

    async fn pause(
        &self,
        request: Request<PauseContainerRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(id = %req.id, "pause container");
        self.supervisor.pause(&req.id).await?;
        Ok(Response::new(Empty {}))
    }

    async fn resume(
        &self,
        request: Request<ResumeContainerRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        info!(id = %req.id, "resume container");
        self.supervisor.resume(&req.id).await?;
        Ok(Response::new(Empty {}))
    }

    type EventsStream = Pin<Box<dyn Stream<Item = Result<Event, Status>> + Send>>;

    async fn events(
        &self,
        _request: Request<EventsRequest>,
    ) -> Result<Response<Self::EventsStream>, Status> {
        let subscription = self.supervisor.events()?;
        info!("event subscriber connected");

        let stream = subscription
            .into_stream()
            .map(|item| item.map(event_to_proto).map_err(Status::from));
        Ok(Response::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctrd_shim::{EventKind, ProcessState};

    #[test]
    fn test_container_to_proto() {
        let summary = ContainerSummary {
            id: "c1".into(),
            bundle: PathBuf::from("/bundles/c1"),
            status: ctrd_shim::Status::Paused,
            pid: 42,
            processes: vec![ProcessState {
                id: "p1".into(),
                pid: 43,
                status: ctrd_shim::Status::Stopped,
                exit_status: 3,
            }],
        };

        let proto = container_to_proto(summary);
        assert_eq!(proto.bundle_path, "/bundles/c1");
        assert_eq!(proto.status, ContainerStatus::Paused as i32);
        assert_eq!(proto.processes[0].status, ContainerStatus::Stopped as i32);
        assert_eq!(proto.processes[0].exit_status, 3);
    }

    #[test]
    fn test_event_to_proto() {
        let event = ctrd_shim::Event::new("c1", 7, EventKind::Exit).with_exit_status(137);
        let ts = event.timestamp.timestamp_nanos_opt().unwrap();

        let proto = event_to_proto(event);
        assert_eq!(proto.r#type, EventType::Exit as i32);
        assert_eq!(proto.exit_status, 137);
        assert_eq!(proto.timestamp_ns, ts);
    }
}
