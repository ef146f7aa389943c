pub mod config;
pub mod dashboard;
pub mod error;
pub mod grpc;
pub mod machine;
pub mod node;
pub mod shutdown;
pub mod store;
pub mod sync;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("codeimport");
}
