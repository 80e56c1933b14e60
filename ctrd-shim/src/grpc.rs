use log::info;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use crate::process::ExecOptions;
use crate::proto::shim_server::Shim;
use crate::proto::*;
use crate::service::ShimService;

/// gRPC front end for a [`ShimService`].
pub struct ShimGrpc {
    service: Arc<ShimService>,
}

impl ShimGrpc {
    pub fn new(service: Arc<ShimService>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl Shim for ShimGrpc {
    async fn create(
        &self,
        request: Request<CreateRequest>,
    ) -> Result<Response<CreateResponse>, Status> {
        let req = request.into_inner();
        info!("gRPC: create {} (bundle {})", req.id, req.bundle);

        let pid = self.service.create(req.into()).await?;
        Ok(Response::new(CreateResponse { pid }))
    }

    async fn start(&self, _request: Request<StartRequest>) -> Result<Response<Empty>, Status> {
        self.service.start().await?;
        Ok(Response::new(Empty {}))
    }

    async fn exec(&self, request: Request<ExecRequest>) -> Result<Response<ExecResponse>, Status> {
        let opts = ExecOptions::try_from(request.into_inner())?;
        info!("gRPC: exec {}", opts.process_id);

        let pid = self.service.exec(opts).await?;
        Ok(Response::new(ExecResponse { pid }))
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.service.kill(req.pid, req.signal, req.all).await?;
        Ok(Response::new(Empty {}))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let result = self.service.delete(request.into_inner().pid).await?;
        Ok(Response::new(result.into()))
    }

    async fn pause(&self, _request: Request<PauseRequest>) -> Result<Response<Empty>, Status> {
        self.service.pause().await?;
        Ok(Response::new(Empty {}))
    }

    async fn resume(&self, _request: Request<ResumeRequest>) -> Result<Response<Empty>, Status> {
        self.service.resume().await?;
        Ok(Response::new(Empty {}))
    }

    async fn state(
        &self,
        _request: Request<StateRequest>,
    ) -> Result<Response<StateResponse>, Status> {
        let state = self.service.state()?;
        Ok(Response::new(state.into()))
    }

    type EventsStream = Pin<Box<dyn Stream<Item = Result<Event, Status>> + Send>>;

    async fn events(
        &self,
        _request: Request<EventsRequest>,
    ) -> Result<Response<Self::EventsStream>, Status> {
        info!("gRPC: events subscriber connected");
        let stream = self.service.events().map(|event| Ok(Event::from(event)));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn shutdown(
        &self,
        request: Request<ShutdownRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.service.shutdown(request.into_inner().now)?;
        Ok(Response::new(Empty {}))
    }
}
