//! Request/response plumbing shared by the three roles.
//!
//! Every link is a TCP connection carrying bincode envelopes in
//! length-delimited frames. A link is owned by its dialing side; calls on
//! one link are serialised, so a response always belongs to the last
//! request and consecutive calls arrive in order. That per-link ordering is
//! what keeps a worker's deltas sequential without any extra bookkeeping.
//!
//! Reverse calls (broker to controller, broker to worker) use dial-back:
//! the connecting party advertises the address it listens on and the broker
//! opens a dedicated link to it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::prelude::*;

/// Handler side of a link. One implementation per role; unsupported
/// requests are answered with a refusal.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        // halo exchange is latency-bound
        stream.set_nodelay(true)?;

        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        })
    }

    async fn call(&mut self, request: &Request) -> Result<Response, WireError> {
        let frame = to_frame(request)?;
        self.framed.send(Bytes::from(frame)).await?;

        match self.framed.next().await {
            Some(frame) => from_frame::<Response>(&frame?),
            None => Err(WireError::Disconnected),
        }
    }
}

/// Cheap-to-clone handle to an outbound link.
#[derive(Clone)]
pub struct Client {
    inner: Arc<tokio::sync::Mutex<Connection>>,
    peer: String,
}

impl Client {
    pub async fn connect(addr: &str) -> Result<Self, WireError> {
        debug!(addr, "dialing peer");
        let connection = Connection::open(addr).await?;

        Ok(Self {
            inner: Arc::new(tokio::sync::Mutex::new(connection)),
            peer: addr.to_string(),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn call(&self, request: Request) -> Result<Response, WireError> {
        let mut connection = self.inner.lock().await;
        connection.call(&request).await
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener, ServeError> {
    TcpListener::bind(addr).await.map_err(ServeError::BindError)
}

/// Accept loop: one task per inbound link, dispatching frames to the
/// service until the peer hangs up or shutdown is requested.
pub async fn serve<S, C>(listener: TcpListener, service: Arc<S>, cancel: C) -> Result<(), ServeError>
where
    S: Service,
    C: CancelToken,
{
    let tasks = TaskTracker::new();

    tokio::select! {
        res = accept_connections(listener, service, &tasks, cancel.clone()) => {
            res?;
        },
        _ = cancel.cancelled() => {
            warn!("exit requested");
        }
    }

    // without the explicit close the wait below would block forever
    debug!("closing task tracker");
    tasks.close();

    debug!("waiting for links to drain");
    tasks.wait().await;

    info!("graceful shutdown finished");

    Ok(())
}

async fn accept_connections<S, C>(
    listener: TcpListener,
    service: Arc<S>,
    tasks: &TaskTracker,
    cancel: C,
) -> Result<(), ServeError>
where
    S: Service,
    C: CancelToken,
{
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| ServeError::Internal(e.into()))?;

        debug!(%peer, "accepting incoming link");

        tasks.spawn(handle_session(stream, service.clone(), cancel.clone()));
    }
}

async fn handle_session<S, C>(stream: TcpStream, service: Arc<S>, cancel: C)
where
    S: Service,
    C: CancelToken,
{
    if let Err(error) = stream.set_nodelay(true) {
        warn!(%error, "could not configure link");
        return;
    }

    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = cancel.cancelled() => break,
        };

        let Some(frame) = frame else {
            debug!("peer hung up");
            break;
        };

        let request = match frame.map_err(WireError::from).and_then(|f| from_frame(&f)) {
            Ok(request) => request,
            Err(error) => {
                warn!(%error, "dropping undecodable frame");
                break;
            }
        };

        let response = service.handle(request).await;

        // the reply goes out before shutdown is honoured, so a Shutdown
        // call still gets its ack
        let reply = to_frame(&response).map(Bytes::from);
        let sent = match reply {
            Ok(frame) => framed.send(frame).await.map_err(WireError::from),
            Err(error) => Err(error),
        };

        if let Err(error) = sent {
            warn!(%error, "could not reply, closing link");
            break;
        }
    }
}
