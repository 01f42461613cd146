use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::net::SocketAddr;

use rkyv::AlignedVec;

use crate::{Message, Status};

/// An inbound message along with any additional metadata provided
/// by the RPC system.
///
/// The request holds the original, still encoded, request buffer; the
/// message is only validated and deserialized once the handler asks for it.
pub struct Request<Msg> {
    pub(crate) remote_addr: SocketAddr,
    pub(crate) buffer: AlignedVec,
    _msg: PhantomData<fn() -> Msg>,
}

impl<Msg> Debug for Request<Msg> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("remote_addr", &self.remote_addr)
            .field("len", &self.buffer.len())
            .finish()
    }
}

impl<Msg> Request<Msg>
where
    Msg: Message,
{
    pub(crate) fn new(remote_addr: SocketAddr, buffer: AlignedVec) -> Self {
        Self {
            remote_addr,
            buffer,
            _msg: PhantomData,
        }
    }

    /// A utility for creating a request from an owned message.
    ///
    /// This is mostly useful for calling handlers directly in tests.
    pub fn using_owned(remote_addr: SocketAddr, msg: &Msg) -> Result<Self, Status> {
        Ok(Self::new(remote_addr, msg.encode()?))
    }

    /// The remote address of the incoming message.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Validates and deserializes the message.
    ///
    /// A payload which fails validation produces [Status::invalid].
    pub fn to_owned(&self) -> Result<Msg, Status> {
        Msg::decode(&self.buffer)
    }
}
