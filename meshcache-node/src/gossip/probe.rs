use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use meshcache_rpc::Status;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::engine::Event;
use super::messages::GossipMessage;
use crate::rpc::client::GossipClient;
use crate::rpc::network::RpcNetwork;

/// A single probe of a peer.
pub(crate) struct Probe {
    pub target_id: String,
    pub target_addr: SocketAddr,
    /// The incarnation of the target when the probe started.
    pub incarnation: u64,
    pub ping: GossipMessage,
    pub ping_req: GossipMessage,
    /// The members asked to probe the target if the direct ping fails.
    pub helpers: Vec<SocketAddr>,
    pub direct_timeout: Duration,
    pub total_timeout: Duration,
    pub network: RpcNetwork,
    pub events: flume::Sender<Event>,
}

/// Probes the target and reports the outcome back to the engine.
pub(crate) async fn run_probe(probe: Probe) {
    let start = Instant::now();

    let acked = match probe_target(&probe).await {
        Some(ack) => {
            let _ = probe.events.send_async(Event::Reply(ack)).await;
            true
        },
        None => false,
    };

    trace!(
        target_node_id = %probe.target_id,
        acked = acked,
        elapsed = ?start.elapsed(),
        "Probe completed."
    );

    let _ = probe
        .events
        .send_async(Event::ProbeCompleted {
            node_id: probe.target_id,
            incarnation: probe.incarnation,
            acked,
        })
        .await;
}

async fn probe_target(probe: &Probe) -> Option<GossipMessage> {
    let deadline = Instant::now() + probe.total_timeout;

    let client = GossipClient::new(
        probe.network.get_or_connect(probe.target_addr),
        probe.direct_timeout,
    );
    match client.send(&probe.ping).await {
        Ok(ack) => return Some(ack),
        Err(status) => debug!(
            target_node_id = %probe.target_id,
            target_addr = %probe.target_addr,
            error = %status,
            "Direct probe failed, falling back to indirect probes."
        ),
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    if probe.helpers.is_empty() || remaining.is_zero() {
        return None;
    }

    let mut requests = probe
        .helpers
        .iter()
        .map(|addr| {
            let client = GossipClient::new(probe.network.get_or_connect(*addr), remaining);
            let msg = &probe.ping_req;
            async move { client.send(msg).await }
        })
        .collect::<FuturesUnordered<_>>();

    while let Some(result) = requests.next().await {
        match result {
            Ok(ack) => return Some(ack),
            Err(status) => trace!(
                target_node_id = %probe.target_id,
                error = %status,
                "Indirect probe failed."
            ),
        }
    }

    None
}

/// Pings a member on behalf of a peer and relays the acknowledgement.
///
/// Any failure to reach the member is reported to the peer as a timeout.
pub(crate) async fn relay_ping(
    target_addr: SocketAddr,
    ping: GossipMessage,
    timeout: Duration,
    network: RpcNetwork,
    events: flume::Sender<Event>,
    reply: oneshot::Sender<Result<GossipMessage, Status>>,
) {
    let client = GossipClient::new(network.get_or_connect(target_addr), timeout);
    let result = match client.send(&ping).await {
        Ok(ack) => {
            let _ = events.send_async(Event::Reply(ack.clone())).await;
            Ok(ack)
        },
        Err(status) => {
            trace!(
                target_addr = %target_addr,
                error = %status,
                "Relayed ping failed."
            );
            Err(Status::timeout())
        },
    };

    let _ = reply.send(result);
}

/// Contacts a seed node, forwarding its view of the cluster to the engine.
pub(crate) async fn join_seed(
    seed: String,
    own_addr: SocketAddr,
    msg: GossipMessage,
    timeout: Duration,
    network: RpcNetwork,
    events: flume::Sender<Event>,
) {
    let addrs = match tokio::net::lookup_host(seed.as_str()).await {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(e) => {
            warn!(seed = %seed, error = ?e, "Failed to resolve seed node.");
            return;
        },
    };

    for addr in addrs {
        if addr == own_addr {
            continue;
        }

        let client = GossipClient::new(network.get_or_connect(addr), timeout);
        match client.send(&msg).await {
            Ok(ack) => {
                debug!(
                    seed = %seed,
                    num_members = ack.payload.len(),
                    "Seed node accepted join."
                );
                let _ = events.send_async(Event::Reply(ack)).await;
                return;
            },
            Err(status) => debug!(
                seed = %seed,
                seed_addr = %addr,
                error = %status,
                "Seed node is unreachable."
            ),
        }
    }
}
