mod config;
mod ip;
mod node;
mod raw;

use anyhow::Context;
use tracing::info;

use crate::config::NodeConfig;
use crate::node::Node;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rawtp_node=debug,rawtp_core=info".into()),
        )
        .init();

    let config = NodeConfig::from_env()?;

    let socket = raw::open_socket(config.bind_addr, config.protocol, config.poll_interval)
        .context("opening raw IPv4 socket (needs CAP_NET_RAW)")?;
    info!(
        "rawtp node listening on {} for IP protocol {}",
        config.bind_addr, config.protocol
    );
    info!(
        "Retransmission timeout: {:?} initial, {:?} ceiling",
        config.timer.initial_timeout, config.timer.max_timeout
    );

    Node::new(config, socket).run()?;
    Ok(())
}
