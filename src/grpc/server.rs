use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::error::Result;
use crate::grpc::machine_service::MachineServiceImpl;
use crate::machine::Machine;
use crate::proto::machine_service_server::MachineServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    machine: Arc<RwLock<Machine>>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, machine: Arc<RwLock<Machine>>) -> Self {
        Self { addr, machine }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        Self::serve(listener, self.machine, shutdown).await
    }

    /// Serve the machine admin service on an already bound listener.
    pub async fn serve(
        listener: TcpListener,
        machine: Arc<RwLock<Machine>>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let machine_service = MachineServiceImpl::new(machine);

        tracing::info!(addr = ?listener.local_addr().ok(), "Starting machine admin gRPC server");

        Server::builder()
            .add_service(MachineServiceServer::new(machine_service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await?;
        Ok(())
    }
}
