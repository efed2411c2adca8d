pub mod clients;
pub mod grpc;
