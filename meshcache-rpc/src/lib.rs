//! # meshcache RPC
//! A small, typed request/response RPC layer used for all node to node traffic.
//!
//! Messages are encoded with [rkyv] and validated on receipt, exchanged over
//! HTTP/2 connections which are multiplexed and reused between calls.
//!
//! ```ignore
//! use meshcache_rpc::{Channel, Handler, Request, RpcClient, RpcService, Server, ServiceRegistry, Status};
//! use rkyv::{Archive, Deserialize, Serialize};
//!
//! #[derive(Archive, Serialize, Deserialize, Debug)]
//! #[archive(check_bytes)]
//! pub struct Echo(pub String);
//!
//! pub struct EchoService;
//!
//! impl RpcService for EchoService {
//!     fn register_handlers(registry: &mut ServiceRegistry<Self>) {
//!         registry.add_handler::<Echo>();
//!     }
//! }
//!
//! #[meshcache_rpc::async_trait]
//! impl Handler<Echo> for EchoService {
//!     type Reply = String;
//!
//!     async fn on_message(&self, msg: Request<Echo>) -> Result<Self::Reply, Status> {
//!         Ok(msg.to_owned()?.0)
//!     }
//! }
//!
//! let server = Server::listen("127.0.0.1:7000".parse()?).await?;
//! server.add_service(EchoService);
//!
//! let client = RpcClient::<EchoService>::new(Channel::connect("127.0.0.1:7000".parse()?));
//! let reply = client.send(&Echo("hello".to_string())).await?;
//! assert_eq!(reply, "hello");
//! ```

#[macro_use]
extern crate tracing;

mod client;
mod handler;
mod message;
mod net;
mod request;
mod server;
mod status;

/// The scratch space used when serializing messages.
pub const SCRATCH_SPACE: usize = 4096;

pub use async_trait::async_trait;
pub use client::RpcClient;
pub use handler::{Handler, RpcService, ServiceRegistry};
pub use message::Message;
pub use net::Channel;
pub use request::Request;
pub use server::Server;
pub use status::{ArchivedErrorCode, ArchivedStatus, ErrorCode, Status};

/// Produces the stable routing hash of a service or handler name.
///
/// This must agree between every node of the cluster, so it is a plain crc32
/// rather than the std hasher which is randomized between builds.
pub(crate) fn hash(v: &str) -> u32 {
    crc32fast::hash(v.as_bytes())
}

pub(crate) fn to_uri_path(service: &str, path: &str) -> String {
    format!("/{}/{}", hash(service), hash(path))
}
