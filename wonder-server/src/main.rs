use std::sync::Arc;

use tonic::transport::{Channel, Server};
use tracing_subscriber::EnvFilter;

use wonder_core::definitions::DefinitionCache;
use wonder_server::clients::{GrpcEventSinkClient, GrpcExecutorClient, GrpcResourcesClient};
use wonder_server::grpc::proto::run_controller_server::RunControllerServer;
use wonder_server::grpc::{MemoryStoreFactory, RunControllerService, RunRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = ServerConfig::from_env();

    let resources_channel = Channel::from_shared(config.resources_url.clone())?.connect().await?;
    let executor_channel = Channel::from_shared(config.executor_url.clone())?.connect().await?;
    let event_sink_channel = Channel::from_shared(config.event_sink_url.clone())?.connect().await?;

    let definitions = Arc::new(DefinitionCache::new(Arc::new(GrpcResourcesClient::new(resources_channel))));
    let executor = Arc::new(GrpcExecutorClient::new(executor_channel));
    let event_sink = Arc::new(GrpcEventSinkClient::new(event_sink_channel));

    let registry = Arc::new(RunRegistry::new(definitions, executor, event_sink, Arc::new(MemoryStoreFactory)));

    tracing::info!("wonder-server gRPC listening on {}", config.bind_addr);

    Server::builder()
        .add_service(RunControllerServer::new(RunControllerService { registry }))
        .serve(config.bind_addr.parse()?)
        .await?;

    Ok(())
}

/// Bind address and outbound collaborator endpoints, read from `std::env`
/// with defaults — following the teacher's `main.rs` preference for plain
/// environment configuration over a config-file crate.
struct ServerConfig {
    bind_addr: String,
    resources_url: String,
    executor_url: String,
    event_sink_url: String,
}

impl ServerConfig {
    fn from_env() -> ServerConfig {
        ServerConfig {
            bind_addr: std::env::var("WONDER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:50061".to_string()),
            resources_url: std::env::var("WONDER_RESOURCES_URL").unwrap_or_else(|_| "http://127.0.0.1:50062".to_string()),
            executor_url: std::env::var("WONDER_EXECUTOR_URL").unwrap_or_else(|_| "http://127.0.0.1:50063".to_string()),
            event_sink_url: std::env::var("WONDER_EVENT_SINK_URL").unwrap_or_else(|_| "http://127.0.0.1:50064".to_string()),
        }
    }
}
