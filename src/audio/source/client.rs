use std::{net::IpAddr, time::Duration};

use crate::common::errors::NodeError;

/// Connect budget, kept separate so a slow handshake cannot eat the whole
/// request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for media fetches, optionally bound to one egress address.
///
/// No overall request timeout: a body stream lives as long as the track.
pub fn create_client(local_address: Option<IpAddr>) -> Result<reqwest::Client, NodeError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("tidelink/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_nodelay(true)
        .tcp_keepalive(Duration::from_secs(25))
        .pool_idle_timeout(Duration::from_secs(70));

    if let Some(ip) = local_address {
        builder = builder.local_address(ip);
    }

    builder
        .build()
        .map_err(|e| NodeError::Transport(format!("failed to build http client: {}", e)))
}
