use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use meshcache_rpc::Channel;
use parking_lot::RwLock;

#[derive(Clone, Default)]
/// A collection of RPC client connections which can be reused and multiplexed.
pub struct RpcNetwork {
    clients: Arc<RwLock<HashMap<SocketAddr, Channel>>>,
}

impl RpcNetwork {
    /// Attempts to get an already existing connection or creates a new connection.
    pub fn get_or_connect(&self, addr: SocketAddr) -> Channel {
        {
            let guard = self.clients.read();
            if let Some(channel) = guard.get(&addr) {
                return channel.clone();
            }
        }

        trace!(addr = %addr, "Connect client to network.");
        let mut guard = self.clients.write();
        guard
            .entry(addr)
            .or_insert_with(|| Channel::connect(addr))
            .clone()
    }

    /// Removes a client from the network.
    pub fn disconnect(&self, addr: SocketAddr) {
        let mut guard = self.clients.write();
        guard.remove(&addr);
    }

    /// The number of cached connections.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }
}
