//! Minimal service joining the mesh.
//!
//! Run with:
//!
//! ```bash
//! cargo run --example hello_mesh_service
//! ```
//!
//! Environment variables:
//!
//! - `MESH_SERVICE_NAME` service name (default: hello-mesh)
//! - `MESH_SERVICE_PORT` HTTP port (default: 9090)
//! - `MESH_DISCOVERY_ADDRESS` discovery gRPC address (default: localhost:8080)
//! - `RUST_LOG` log filter (default: info)

use serde_json::json as json_value;
use toska_mesh::prelude::*;
use toska_mesh::toska_config::load_dotenv;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = load_dotenv() {
        eprintln!("Ignoring .env file: {e}");
    }

    if let Err(e) = LogConfig::new().format(LogFormat::Compact).init() {
        eprintln!("Logging unavailable: {e}");
    }

    let process = ProcessConfig::from_env(&EnvLoader::default());
    info!(
        service = %process.service_name,
        port = process.port,
        discovery = %process.discovery_address,
        "Starting hello mesh service"
    );

    if let Err(e) = run(process).await {
        error!(error = %e, "Service error");
        std::process::exit(1);
    }
}

async fn run(process: ProcessConfig) -> Result<()> {
    let mut service = MeshService::new([
        MeshOption::service_name(process.service_name.clone()),
        MeshOption::port(process.port),
        MeshOption::discovery_address(process.discovery_address),
        MeshOption::routing_strategy(LoadBalancingStrategy::RoundRobin),
        MeshOption::metadata("version", "1.0.0"),
    ])?;

    let name = process.service_name;
    service.get("/hello", move |_req: Request| {
        let name = name.clone();
        async move {
            json(
                StatusCode::OK,
                &json_value!({
                    "message": "Hello from Rust mesh service!",
                    "service": name,
                }),
            )
        }
    });

    service.get("/echo/{msg}", |req: Request| async move {
        let msg = req.param("msg").unwrap_or_default().to_string();
        json(StatusCode::OK, &json_value!({ "echo": msg }))
    });

    service.run(CancellationToken::new()).await
}
