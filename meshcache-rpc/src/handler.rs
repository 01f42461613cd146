use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rkyv::AlignedVec;

use crate::request::Request;
use crate::{Message, Status};

/// A specific handler key.
///
/// This is in the format of (service_name, handler_path) hashes.
pub(crate) type HandlerKey = (u32, u32);

pub(crate) type HandlerMap = BTreeMap<HandlerKey, Arc<dyn OpaqueMessageHandler>>;

/// A registry system used for linking a service's message handlers
/// with the RPC system at runtime.
///
/// Since the RPC system cannot determine what message payload matches
/// with which handler at compile time, it must dynamically link them
/// at runtime.
///
/// Not registering a handler will cause the handler to not be triggered
/// even if a valid message comes through.
pub struct ServiceRegistry<Svc> {
    handlers: HandlerMap,
    service: Arc<Svc>,
}

impl<Svc> ServiceRegistry<Svc>
where
    Svc: RpcService,
{
    pub(crate) fn new(service: Svc) -> Self {
        Self {
            handlers: BTreeMap::new(),
            service: Arc::new(service),
        }
    }

    /// Consumes the registry into the produced handlers.
    pub(crate) fn into_handlers(self) -> HandlerMap {
        self.handlers
    }

    /// Adds a new handler to the registry.
    ///
    /// This is done in the form of specifying what message types are handled
    /// by the service via the generic.
    pub fn add_handler<Msg>(&mut self)
    where
        Msg: Message,
        Svc: Handler<Msg>,
    {
        let phantom = PhantomHandler {
            handler: self.service.clone(),
            _msg: PhantomData::<fn() -> Msg>,
        };

        self.handlers.insert(
            (
                crate::hash(Svc::service_name()),
                crate::hash(<Svc as Handler<Msg>>::path()),
            ),
            Arc::new(phantom),
        );
    }
}

/// A standard RPC server that handles messages.
pub trait RpcService: Sized + Send + Sync + 'static {
    /// An optional name of the service.
    ///
    /// This can be used to prevent overlaps or clashes
    /// in handlers as two services may handle the same
    /// message but behave differently, to distinguish between
    /// these services, the message paths also use the service name
    /// to create a unique key.
    fn service_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Register all message handlers for this server with the registry.
    ///
    /// See [ServiceRegistry] for more information.
    fn register_handlers(registry: &mut ServiceRegistry<Self>);
}

#[async_trait]
/// A generic RPC message handler.
pub trait Handler<Msg>: RpcService
where
    Msg: Message,
{
    type Reply: Message;

    fn path() -> &'static str {
        std::any::type_name::<Msg>()
    }

    /// Process a message.
    async fn on_message(&self, msg: Request<Msg>) -> Result<Self::Reply, Status>;
}

#[async_trait]
pub(crate) trait OpaqueMessageHandler: Send + Sync {
    /// Handles the raw message buffer.
    ///
    /// `Ok` contains the encoded reply, `Err` the encoded [Status].
    async fn try_handle(
        &self,
        remote_addr: SocketAddr,
        data: AlignedVec,
    ) -> Result<AlignedVec, AlignedVec>;
}

struct PhantomHandler<H, Msg> {
    handler: Arc<H>,
    _msg: PhantomData<fn() -> Msg>,
}

#[async_trait]
impl<H, Msg> OpaqueMessageHandler for PhantomHandler<H, Msg>
where
    Msg: Message,
    H: Handler<Msg>,
{
    async fn try_handle(
        &self,
        remote_addr: SocketAddr,
        data: AlignedVec,
    ) -> Result<AlignedVec, AlignedVec> {
        let msg = Request::<Msg>::new(remote_addr, data);

        let reply = self
            .handler
            .on_message(msg)
            .await
            .and_then(|reply| reply.encode());

        match reply {
            Ok(buffer) => Ok(buffer),
            Err(status) => Err(status.to_buffer()),
        }
    }
}
