use meshcache_rpc::{Handler, Request, RpcService, ServiceRegistry, Status};
use tokio::sync::oneshot;

use crate::gossip::{Event, GossipMessage};

/// Forwards inbound gossip messages to the gossip engine.
///
/// The engine is the only writer of the membership table so every message
/// is handed over rather than handled here.
pub struct GossipService {
    events: flume::Sender<Event>,
}

impl GossipService {
    pub fn new(events: flume::Sender<Event>) -> Self {
        Self { events }
    }
}

impl RpcService for GossipService {
    fn service_name() -> &'static str {
        "meshcache.gossip"
    }

    fn register_handlers(registry: &mut ServiceRegistry<Self>) {
        registry.add_handler::<GossipMessage>();
    }
}

#[meshcache_rpc::async_trait]
impl Handler<GossipMessage> for GossipService {
    type Reply = GossipMessage;

    fn path() -> &'static str {
        "gossip"
    }

    async fn on_message(
        &self,
        request: Request<GossipMessage>,
    ) -> Result<Self::Reply, Status> {
        let msg = request.to_owned()?;

        let (tx, rx) = oneshot::channel();
        self.events
            .send_async(Event::Inbound { msg, reply: tx })
            .await
            .map_err(|_| Status::unavailable("Gossip engine is not running."))?;

        rx.await
            .map_err(|_| Status::unavailable("Gossip engine stopped."))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::MessageKind;
    use crate::membership::{NodeRecord, NodeState};

    fn message() -> GossipMessage {
        let sender = NodeRecord {
            node_id: "node-2".to_string(),
            addr: "127.0.0.1:80".to_string(),
            state: NodeState::Alive,
            incarnation: 0,
        };
        GossipMessage::new(sender, MessageKind::Ping, Vec::new())
    }

    #[tokio::test]
    async fn test_gossip_service_forwards_messages() {
        let (tx, rx) = flume::bounded(10);
        let service = GossipService::new(tx);
        let addr = "127.0.0.1:80".parse().unwrap();

        let engine = tokio::spawn(async move {
            match rx.recv_async().await {
                Ok(Event::Inbound { msg, reply }) => {
                    let mut ack = msg.clone();
                    ack.kind = MessageKind::PingAck;
                    let _ = reply.send(Ok(ack));
                    msg
                },
                _ => panic!("Expected inbound message"),
            }
        });

        let reply = service
            .on_message(Request::using_owned(addr, &message()).unwrap())
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::PingAck);
        assert_eq!(engine.await.unwrap(), message());
    }

    #[tokio::test]
    async fn test_stopped_engine_is_unavailable() {
        let (tx, rx) = flume::bounded(10);
        drop(rx);
        let service = GossipService::new(tx);
        let addr = "127.0.0.1:80".parse().unwrap();

        let res = service
            .on_message(Request::using_owned(addr, &message()).unwrap())
            .await;
        assert!(res.is_err());
    }
}
