use std::marker::PhantomData;
use std::time::Duration;

use crate::handler::{Handler, RpcService};
use crate::net::Channel;
use crate::{Message, Status};

/// A RPC client handle for a given service.
///
/// Clients are cheap to create and clone, all clients created from the
/// same [Channel] share the underlying connection.
pub struct RpcClient<Svc>
where
    Svc: RpcService,
{
    channel: Channel,
    timeout: Option<Duration>,
    _p: PhantomData<Svc>,
}

impl<Svc> Clone for RpcClient<Svc>
where
    Svc: RpcService,
{
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            timeout: self.timeout,
            _p: PhantomData,
        }
    }
}

impl<Svc> RpcClient<Svc>
where
    Svc: RpcService,
{
    /// Creates a new RPC client which can handle a new service type.
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            timeout: None,
            _p: PhantomData,
        }
    }

    /// Sets the deadline applied to every message sent by this client.
    ///
    /// Messages which exceed the deadline fail with [Status::timeout].
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Returns the client with the given message deadline set.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    /// Sends a message to the server and wait for a reply.
    pub async fn send<Msg>(
        &self,
        msg: &Msg,
    ) -> Result<<Svc as Handler<Msg>>::Reply, Status>
    where
        Msg: Message,
        Svc: Handler<Msg>,
    {
        let path =
            crate::to_uri_path(Svc::service_name(), <Svc as Handler<Msg>>::path());
        let buffer = msg.encode()?;

        let fut = self.channel.send_raw(&path, buffer);
        let (ok, body) = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| Status::timeout())??,
            None => fut.await?,
        };

        if ok {
            <Svc as Handler<Msg>>::Reply::decode(&body)
        } else {
            Err(Status::decode(&body)?)
        }
    }
}
