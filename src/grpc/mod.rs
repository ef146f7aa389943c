pub mod job_store_client;
pub mod machine_service;
pub mod server;

pub use job_store_client::GrpcJobStore;
pub use machine_service::MachineServiceImpl;
pub use server::GrpcServer;
