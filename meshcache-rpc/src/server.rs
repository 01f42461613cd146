use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::handler::{HandlerMap, OpaqueMessageHandler, RpcService, ServiceRegistry};

/// How long open connections get to finish once the server shuts down.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// A RPC server instance.
///
/// This allows for dynamic adding and removal of services.
pub struct Server {
    state: ServerState,
    local_addr: SocketAddr,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Binds to the given address and spawns the RPC server task.
    ///
    /// Fails if the address cannot be bound.
    pub async fn listen(addr: SocketAddr) -> io::Result<Self> {
        let state = ServerState::default();
        let (tx, rx) = oneshot::channel();
        let (local_addr, handle) =
            crate::net::start_rpc_server(addr, state.clone(), rx)?;

        debug!(listen_addr = %local_addr, "RPC server started.");

        Ok(Self {
            state,
            local_addr,
            shutdown: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    #[inline]
    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Adds a new service to the live RPC server.
    pub fn add_service<Svc>(&self, service: Svc)
    where
        Svc: RpcService,
    {
        let mut registry = ServiceRegistry::new(service);
        Svc::register_handlers(&mut registry);
        let handlers = registry.into_handlers();
        self.state.add_handlers(handlers);
    }

    /// Removes all handlers linked with the given service name.
    pub fn remove_service(&self, service_name: &str) {
        self.state.remove_handlers(service_name);
    }

    /// Shuts the server down.
    ///
    /// New messages are rejected straight away and open connections get a
    /// short grace period to finish before the server task is aborted.
    /// Once this returns the listening socket is closed and the address
    /// can be bound again.
    pub async fn shutdown(&self) {
        self.signal_shutdown();

        let handle = self.handle.lock().take();
        let mut handle = match handle {
            Some(handle) => handle,
            None => return,
        };

        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut handle)
            .await
            .is_err()
        {
            warn!(
                listen_addr = %self.local_addr,
                "Open connections did not close in time, aborting server."
            );
            handle.abort();
            let _ = handle.await;
        }

        debug!(listen_addr = %self.local_addr, "RPC server stopped.");
    }

    fn signal_shutdown(&self) {
        self.state.closed.store(true, Ordering::Relaxed);
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

#[derive(Clone, Default)]
/// Represents the shared state of the RPC server.
pub(crate) struct ServerState {
    handlers: Arc<RwLock<HandlerMap>>,
    closed: Arc<AtomicBool>,
}

impl ServerState {
    /// Adds a new set of handlers to the server state.
    ///
    /// Handlers newly added will then be able to handle messages received by
    /// the already running RPC system.
    pub(crate) fn add_handlers(&self, handlers: HandlerMap) {
        let mut lock = self.handlers.write();
        lock.extend(handlers);
    }

    /// Removes a new set of handlers from the server state.
    pub(crate) fn remove_handlers(&self, service: &str) {
        let service = crate::hash(service);

        let mut lock = self.handlers.write();
        lock.retain(|key, _| key.0 != service);
    }

    /// Attempts to get the message handler for a given request path.
    ///
    /// The path is in the form of `/{service_hash}/{handler_hash}`.
    pub(crate) fn get_handler(
        &self,
        uri_path: &str,
    ) -> Option<Arc<dyn OpaqueMessageHandler>> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }

        let (service, path) = uri_path.trim_start_matches('/').split_once('/')?;
        let key = (service.parse::<u32>().ok()?, path.parse::<u32>().ok()?);

        let lock = self.handlers.read();
        lock.get(&key).cloned()
    }
}
