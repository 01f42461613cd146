use meshcache_rpc::{
    Channel,
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
    age: u32,
}

pub struct MyService;

impl RpcService for MyService {
    fn register_handlers(registry: &mut ServiceRegistry<Self>) {
        registry.add_handler::<MyMessage>();
    }
}

#[meshcache_rpc::async_trait]
impl Handler<MyMessage> for MyService {
    type Reply = String;

    async fn on_message(&self, _msg: Request<MyMessage>) -> Result<Self::Reply, Status> {
        Err(Status::internal("Oops! Something went wrong!"))
    }
}

#[tokio::test]
async fn test_service_error() -> anyhow::Result<()> {
    test_helper::init_logging();
    let addr = test_helper::get_unused_addr();

    let server = Server::listen(addr).await?;
    server.add_service(MyService);

    let rpc_client = RpcClient::<MyService>::new(Channel::connect(addr));

    let msg1 = MyMessage {
        name: "Bobby".to_string(),
        age: 12,
    };

    let resp = rpc_client.send(&msg1).await;
    assert_eq!(
        resp,
        Err(Status::internal("Oops! Something went wrong!")),
        "Results should match."
    );

    server.shutdown().await;
    Ok(())
}
