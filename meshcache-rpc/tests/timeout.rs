use std::time::Duration;

use meshcache_rpc::{
    Channel,
    ErrorCode,
    Handler,
    Request,
    RpcClient,
    RpcService,
    Server,
    ServiceRegistry,
    Status,
};
use rkyv::{Archive, Deserialize, Serialize};

#[derive(Serialize, Deserialize, Archive, Debug)]
#[archive(check_bytes)]
pub struct Sleep {
    millis: u64,
}

pub struct SlowService;

impl RpcService for SlowService {
    fn register_handlers(registry: &mut ServiceRegistry<Self>) {
        registry.add_handler::<Sleep>();
    }
}

#[meshcache_rpc::async_trait]
impl Handler<Sleep> for SlowService {
    type Reply = u64;

    async fn on_message(&self, msg: Request<Sleep>) -> Result<Self::Reply, Status> {
        let msg = msg.to_owned()?;
        tokio::time::sleep(Duration::from_millis(msg.millis)).await;
        Ok(msg.millis)
    }
}

#[tokio::test]
async fn test_deadline_exceeded() -> anyhow::Result<()> {
    test_helper::init_logging();
    let addr = test_helper::get_unused_addr();

    let server = Server::listen(addr).await?;
    server.add_service(SlowService);

    let rpc_client = RpcClient::<SlowService>::new(Channel::connect(addr))
        .with_timeout(Duration::from_millis(200));

    let reply = rpc_client.send(&Sleep { millis: 10 }).await?;
    assert_eq!(reply, 10);

    let resp = rpc_client.send(&Sleep { millis: 1_000 }).await;
    assert!(
        matches!(resp, Err(Status { code: ErrorCode::Timeout, .. })),
        "Slow reply should exceed the deadline, got {resp:?}"
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_peer() -> anyhow::Result<()> {
    test_helper::init_logging();
    let addr = test_helper::get_unused_addr();

    let rpc_client = RpcClient::<SlowService>::new(Channel::connect(addr))
        .with_timeout(Duration::from_millis(500));

    let resp = rpc_client.send(&Sleep { millis: 0 }).await;
    assert!(resp.is_err(), "Nothing is listening on the address.");
    Ok(())
}
