use clap::Parser;
use fhirpath_lab_server::server::{config::ServerConfig, start_server};
use std::net::IpAddr;

/// FHIRPath evaluation server for the fhirpath-lab UI
#[derive(Parser, Debug)]
#[command(name = "fhirpath-lab-server", version, about)]
struct Cli {
    /// Host IP address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Restrict CORS to the local dev origin instead of allowing all
    #[arg(long)]
    no_cors_all: bool,

    /// Maximum request body size in MB
    #[arg(long, default_value_t = 60)]
    max_body_size: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        cors_all: !cli.no_cors_all,
        max_body_size_mb: cli.max_body_size,
    };

    start_server(config).await
}
