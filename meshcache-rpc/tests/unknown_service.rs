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
pub struct MyMessage {
    name: String,
}

pub struct MyService;

impl RpcService for MyService {
    fn service_name() -> &'static str {
        "my-service"
    }

    fn register_handlers(registry: &mut ServiceRegistry<Self>) {
        registry.add_handler::<MyMessage>();
    }
}

#[meshcache_rpc::async_trait]
impl Handler<MyMessage> for MyService {
    type Reply = String;

    async fn on_message(&self, msg: Request<MyMessage>) -> Result<Self::Reply, Status> {
        Ok(msg.to_owned()?.name)
    }
}

#[tokio::test]
async fn test_unknown_service() -> anyhow::Result<()> {
    test_helper::init_logging();
    let addr = test_helper::get_unused_addr();

    let server = Server::listen(addr).await?;

    let rpc_client = RpcClient::<MyService>::new(Channel::connect(addr));
    let msg = MyMessage {
        name: "Bobby".to_string(),
    };

    let resp = rpc_client.send(&msg).await;
    assert!(
        matches!(resp, Err(Status { code: ErrorCode::ServiceUnavailable, .. })),
        "Server should reject unknown services, got {resp:?}"
    );

    server.add_service(MyService);
    let resp = rpc_client.send(&msg).await?;
    assert_eq!(resp, "Bobby");

    server.remove_service(MyService::service_name());
    let resp = rpc_client.send(&msg).await;
    assert!(
        matches!(resp, Err(Status { code: ErrorCode::ServiceUnavailable, .. })),
        "Removed service should no longer be reachable, got {resp:?}"
    );

    server.shutdown().await;
    Ok(())
}
