use std::convert::Infallible;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client};
use rkyv::AlignedVec;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::server::ServerState;
use crate::Status;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// The most a request body is allowed to reserve up front, larger bodies
/// grow the buffer as their data arrives.
const MAX_PREALLOCATED_BODY: u64 = 64 << 10;

/// Binds the listener and starts the RPC server.
///
/// The bind happens before this returns so callers see address errors
/// immediately rather than from within the server task.
pub(crate) fn start_rpc_server(
    bind_addr: SocketAddr,
    state: ServerState,
    shutdown: oneshot::Receiver<()>,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let make_service = make_service_fn(move |socket: &AddrStream| {
        let remote_addr = socket.remote_addr();
        let state = state.clone();

        async move {
            let service = move |req| handle_connection(req, state.clone(), remote_addr);
            Ok::<_, Infallible>(service_fn(service))
        }
    });

    let server = hyper::Server::from_tcp(listener)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .tcp_nodelay(true)
        .http2_only(true)
        .http2_adaptive_window(true)
        .serve(make_service)
        .with_graceful_shutdown(async move {
            let _ = shutdown.await;
        });

    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!(error = ?e, "Server failed to handle requests.");
        }
    });

    Ok((local_addr, handle))
}

/// A single request handler.
///
/// Hyper spawns a task per stream so these run concurrently with one another.
async fn handle_connection(
    req: Request<Body>,
    state: ServerState,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    match handle_message(req, state, remote_addr).await {
        Ok(r) => Ok(r),
        Err(e) => {
            let status = Status::connection(e);
            Ok(into_response(StatusCode::BAD_REQUEST, status.to_buffer()))
        },
    }
}

async fn handle_message(
    req: Request<Body>,
    state: ServerState,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, hyper::Error> {
    let (req, mut body) = req.into_parts();
    let uri = req.uri.path();

    let handler = match state.get_handler(uri) {
        None => {
            let status = Status::unavailable(format!("Unknown service {uri}"));
            return Ok(into_response(StatusCode::BAD_REQUEST, status.to_buffer()));
        },
        Some(handler) => handler,
    };

    let size = body
        .size_hint()
        .upper()
        .unwrap_or(1024)
        .min(MAX_PREALLOCATED_BODY);
    let mut data = AlignedVec::with_capacity(size as usize);
    while let Some(chunk) = body.data().await {
        data.extend_from_slice(&chunk?);
    }

    let response = match handler.try_handle(remote_addr, data).await {
        Ok(buffer) => into_response(StatusCode::OK, buffer),
        Err(buffer) => into_response(StatusCode::BAD_REQUEST, buffer),
    };

    Ok(response)
}

fn into_response(code: StatusCode, buffer: AlignedVec) -> Response<Body> {
    let mut response = Response::new(Body::from(buffer.into_vec()));
    (*response.status_mut()) = code;
    response
}

#[derive(Clone)]
/// A lazily connected, multiplexed HTTP/2 channel to a remote RPC server.
///
/// Cloning the channel is cheap and clones share the same connection.
pub struct Channel {
    client: Client<HttpConnector>,
    remote_addr: SocketAddr,
}

impl Channel {
    /// Creates a new channel to the given remote server.
    ///
    /// No connection is made until the first message is sent.
    pub fn connect(remote_addr: SocketAddr) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));

        let client = Client::builder()
            .http2_only(true)
            .http2_adaptive_window(true)
            .build(http);

        Self {
            client,
            remote_addr,
        }
    }

    #[inline]
    /// The address of the remote server.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Sends the raw message buffer to the given handler path.
    ///
    /// Returns whether the server produced a reply along with the response body.
    pub(crate) async fn send_raw(
        &self,
        path: &str,
        msg: AlignedVec,
    ) -> Result<(bool, AlignedVec), Status> {
        let uri = format!("http://{}{}", self.remote_addr, path);
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::from(msg.into_vec()))
            .map_err(Status::internal)?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(Status::connection)?;

        let (parts, body) = response.into_parts();
        let body: Bytes = hyper::body::to_bytes(body)
            .await
            .map_err(Status::connection)?;

        let mut buffer = AlignedVec::with_capacity(body.len());
        buffer.extend_from_slice(&body);

        Ok((parts.status == StatusCode::OK, buffer))
    }
}
