//! Actor Swarm Startup
//!
//! Bootstraps the kameo actor swarm (QUIC transport, mDNS and Kademlia
//! discovery) so device actors registered by one server are reachable from
//! every other.

use crate::config::ServerConfig;
use anyhow::{anyhow, Context, Result};
use kameo::remote::ActorSwarm;
use libp2p::Multiaddr;
use tracing::{info, warn};

pub fn listen_addr(port: u16) -> Result<Multiaddr> {
    format!("/ip4/0.0.0.0/udp/{port}/quic-v1")
        .parse()
        .with_context(|| format!("invalid P2P listen port {port}"))
}

/// Parses configured peers, skipping entries that are not multiaddrs.
pub fn peer_addrs(peers: &[String]) -> Vec<Multiaddr> {
    peers
        .iter()
        .filter_map(|peer| match peer.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Ignoring invalid P2P peer address");
                None
            }
        })
        .collect()
}

pub async fn start_actor_swarm(config: &ServerConfig) -> Result<&'static ActorSwarm> {
    let swarm = ActorSwarm::bootstrap().map_err(|e| anyhow!("failed to bootstrap actor swarm: {e}"))?;
    info!(peer_id = %swarm.local_peer_id(), member = %config.member_id, "Actor swarm bootstrapped");

    let addr = listen_addr(config.p2p_port)?;
    swarm
        .listen_on(addr.clone())
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!(address = %addr, "P2P network listening");

    for peer in peer_addrs(&config.p2p_peers) {
        match swarm.dial(peer.clone()).await {
            Ok(()) => info!(peer = %peer, "Dialled P2P peer"),
            // mDNS or a later dial from the peer may still connect us.
            Err(e) => warn!(peer = %peer, error = %e, "Failed to dial P2P peer"),
        }
    }
    Ok(swarm)
}
