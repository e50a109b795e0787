use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the node agent
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Name of the node the program is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Unix socket the CNI plugin shim connects to
    #[arg(
        long,
        env = "CNI_SERVER_SOCKET_PATH",
        default_value = "/var/run/cni-node/cni-server.sock"
    )]
    pub cni_socket_path: PathBuf,

    /// Seconds a CNI request may spend in the handler
    #[arg(long, env = "CNI_REQUEST_TIMEOUT", default_value_t = 120, value_parser = parse_secs)]
    pub cni_request_timeout: u64,

    /// Metrics and readiness listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Address the load balancer health check ports are bound on
    #[arg(long, env = "HEALTH_CHECK_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub health_check_bind_address: IpAddr,

    /// Seconds to wait for the initial list of each watched resource
    #[arg(long, default_value_t = 60)]
    pub store_timeout: u64,
}

impl AgentArgs {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.cni_request_timeout)
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        (self.store_timeout > 0).then(|| Duration::from_secs(self.store_timeout))
    }
}

fn parse_secs(value: &str) -> Result<u64, String> {
    match value.parse::<u64>() {
        Ok(0) => Err("timeout must be at least one second".into()),
        Ok(secs) => Ok(secs),
        Err(e) => Err(e.to_string()),
    }
}
