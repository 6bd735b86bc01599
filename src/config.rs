use std::net::SocketAddr;
use std::sync::LazyLock;

use clap::Parser;
use tracing::warn;

use crate::membership::{GossiperOptions, MemberAddress, Service};

pub static ENV: LazyLock<Environment> = LazyLock::new(Environment::parse);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Environment {
    #[arg(long, env = "MESHGUARD_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Gossip bind port; 0 picks a free port.
    #[arg(short, long, env = "MESHGUARD_PORT", default_value_t = 2920)]
    pub port: u16,

    /// Identifier byte advertised for the co-located service.
    #[arg(long, env = "MESHGUARD_SERVICE_ID", default_value_t = 1)]
    pub service_id: u8,

    /// Port the co-located service listens on.
    #[arg(long, env = "MESHGUARD_SERVICE_PORT", default_value_t = 8080)]
    pub service_port: u16,

    /// Cluster members to ping at startup, as ip:port.
    #[arg(long, env = "MESHGUARD_SEED_NODES")]
    pub seed_nodes: Vec<String>,

    #[arg(long, env = "MESHGUARD_PROTOCOL_PERIOD_MS", default_value_t = 1000)]
    pub protocol_period_ms: u64,

    #[arg(long, env = "MESHGUARD_PING_TIMEOUT_MS", default_value_t = 200)]
    pub ping_timeout_ms: u64,

    #[arg(long, env = "MESHGUARD_INDIRECT_PING_TIMEOUT_MS", default_value_t = 400)]
    pub indirect_ping_timeout_ms: u64,

    #[arg(long, env = "MESHGUARD_DEATH_TIMEOUT_MS", default_value_t = 60_000)]
    pub death_timeout_ms: u64,

    #[arg(long, env = "MESHGUARD_FANOUT_FACTOR", default_value_t = 3)]
    pub fanout_factor: usize,

    #[arg(long, env = "MESHGUARD_INDIRECT_ENDPOINTS", default_value_t = 3)]
    pub indirect_endpoints: usize,

    #[arg(long, env = "MESHGUARD_SHUTDOWN_GRACE_MS", default_value_t = 1000)]
    pub shutdown_grace_ms: u64,
}

impl Environment {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn service(&self) -> Service {
        Service {
            id: self.service_id,
            port: self.service_port,
        }
    }

    pub fn gossiper_options(&self) -> GossiperOptions {
        GossiperOptions {
            protocol_period_ms: self.protocol_period_ms,
            ping_timeout_ms: self.ping_timeout_ms,
            indirect_ping_timeout_ms: self.indirect_ping_timeout_ms,
            death_timeout_ms: self.death_timeout_ms,
            fanout_factor: self.fanout_factor,
            indirect_endpoints: self.indirect_endpoints,
        }
    }

    /// Parsed seed addresses; entries that don't parse are logged and skipped
    /// rather than blocking startup.
    pub fn seeds(&self) -> Vec<MemberAddress> {
        self.seed_nodes
            .iter()
            .filter_map(|raw| match raw.parse::<SocketAddr>() {
                Ok(addr) => match MemberAddress::from_socket_addr(addr) {
                    Some(addr) => Some(addr),
                    None => {
                        warn!(seed = raw, "seed is not an IPv4 address, skipping");
                        None
                    }
                },
                Err(err) => {
                    warn!(seed = raw, %err, "unparseable seed address, skipping");
                    None
                }
            })
            .collect()
    }
}
