//! Server configuration

use std::net::IpAddr;

/// Configuration for the fhirpath-lab API server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind the server to
    pub port: u16,
    /// Host IP address to bind to
    pub host: IpAddr,
    /// Enable CORS for all origins (the lab UI runs on another origin)
    pub cors_all: bool,
    /// Maximum request body size in MB
    pub max_body_size_mb: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: [127, 0, 0, 1].into(),
            cors_all: true,
            max_body_size_mb: 60,
        }
    }
}

impl ServerConfig {
    /// Maximum payload size in bytes
    pub fn max_payload_size(&self) -> usize {
        (self.max_body_size_mb as usize) * 1024 * 1024
    }
}
