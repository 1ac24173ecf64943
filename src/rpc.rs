//! # RPC Layer
//!
//! The generic remote-call plumbing consumed by the directory components:
//! call a named operation on a remote endpoint and get back a structured
//! envelope or an error. Frames are length-prefixed bincode over TCP; the
//! directory protocol itself neither knows nor cares.
//!
//! ## Architecture
//!
//! The client side uses the actor pattern:
//! - [`RpcClient`]: public handle (cheap to clone) implementing [`RemoteCall`]
//! - `RpcClientActor`: internal actor owning the connection cache
//!
//! Connections are cached per endpoint in a bounded LRU and reused across
//! calls; concurrent calls to one endpoint serialize on that connection.
//! A call that fails or is cancelled mid-exchange leaves the connection
//! marked dirty, so a concurrent call holding the same cached connection
//! can never read the earlier call's late response as its own; dirty
//! connections are invalidated and the next call redials.
//!
//! The server side is an accept loop that decodes one [`DirectoryRequest`]
//! per frame and dispatches it to a [`DirectoryHandler`].

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::ident::Uri;
use crate::messages::{self, DirectoryRequest, Envelope, Payload, MAX_FRAME_SIZE};
use crate::protocols::{DirectoryHandler, RemoteCall};

/// Timeout for one complete remote call (connect + send + receive).
/// An unreachable endpoint is equivalent to an error response.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of cached outbound connections.
const MAX_CACHED_CONNECTIONS: usize = 256;

/// Idle time after which a cached connection is dropped rather than reused.
const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval for evicting stale cached connections.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Command channel capacity for the client actor.
const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

// ============================================================================
// Framing
// ============================================================================

/// Write one length-prefixed frame. Shared with the peer-connection
/// listener, which frames handshake headers and payloads the same way.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_FRAME_SIZE {
        bail!("outgoing frame of {} bytes exceeds limit", bytes.len());
    }
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, enforcing the size limit before
/// allocating.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        bail!("incoming frame of {} bytes exceeds limit", len);
    }
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(buffer)
}

// ============================================================================
// Client actor
// ============================================================================

enum RpcCommand {
    /// Get a cached connection or establish a new one.
    GetOrConnect {
        authority: String,
        reply: oneshot::Sender<Result<Arc<Mutex<PooledStream>>>>,
    },
    /// Drop a connection after a call on it failed.
    Invalidate { authority: String },
    Quit,
}

/// A pooled connection plus its exchange state. `dirty` is set under the
/// lock before any bytes move and cleared only after a complete
/// request/response round trip, so a call that failed or was cancelled
/// mid-exchange leaves the stream unusable: whatever arrives next belongs
/// to the dead request, and no later call may read it.
struct PooledStream {
    stream: TcpStream,
    dirty: bool,
}

struct CachedConnection {
    stream: Arc<Mutex<PooledStream>>,
    last_used: Instant,
}

struct RpcClientActor {
    connections: LruCache<String, CachedConnection>,
}

impl RpcClientActor {
    fn new() -> Self {
        let capacity =
            NonZeroUsize::new(MAX_CACHED_CONNECTIONS).expect("cache capacity must be non-zero");
        RpcClientActor { connections: LruCache::new(capacity) }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        let mut cleanup_interval = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup_interval.tick().await; // Skip initial tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RpcCommand::GetOrConnect { authority, reply }) => {
                            let result = self.get_or_connect(&authority).await;
                            let _ = reply.send(result);
                        }
                        Some(RpcCommand::Invalidate { authority }) => {
                            if self.connections.pop(&authority).is_some() {
                                debug!(endpoint = %authority, "invalidated cached connection after failure");
                            }
                        }
                        Some(RpcCommand::Quit) | None => {
                            debug!("RpcClient actor shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_stale_connections();
                }
            }
        }
    }

    async fn get_or_connect(&mut self, authority: &str) -> Result<Arc<Mutex<PooledStream>>> {
        if let Some(cached) = self.connections.get_mut(authority) {
            if cached.last_used.elapsed() < CONNECTION_STALE_TIMEOUT {
                cached.last_used = Instant::now();
                return Ok(cached.stream.clone());
            }
            trace!(endpoint = %authority, "cached connection is stale, redialing");
            self.connections.pop(authority);
        }

        let stream = TcpStream::connect(authority)
            .await
            .with_context(|| format!("failed to connect to {}", authority))?;
        stream.set_nodelay(true).ok();
        let stream = Arc::new(Mutex::new(PooledStream { stream, dirty: false }));
        self.connections.put(
            authority.to_string(),
            CachedConnection { stream: stream.clone(), last_used: Instant::now() },
        );
        Ok(stream)
    }

    fn cleanup_stale_connections(&mut self) {
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, cached)| cached.last_used.elapsed() > CONNECTION_STALE_TIMEOUT)
            .map(|(authority, _)| authority.clone())
            .collect();
        for authority in stale {
            self.connections.pop(&authority);
            trace!(endpoint = %authority, "cleaned up stale connection");
        }
    }
}

// ============================================================================
// Client handle
// ============================================================================

/// Handle for making remote calls. Cheap to clone; all clones share one
/// connection cache.
#[derive(Clone)]
pub struct RpcClient {
    cmd_tx: mpsc::Sender<RpcCommand>,
}

impl RpcClient {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        tokio::spawn(RpcClientActor::new().run(cmd_rx));
        RpcClient { cmd_tx }
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(RpcCommand::Quit);
    }

    async fn connection(&self, authority: &str) -> Result<Arc<Mutex<PooledStream>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::GetOrConnect { authority: authority.to_string(), reply: reply_tx })
            .await
            .context("rpc client actor is gone")?;
        reply_rx.await.context("rpc client actor dropped the request")?
    }

    fn invalidate(&self, authority: &str) {
        let _ = self.cmd_tx.try_send(RpcCommand::Invalidate { authority: authority.to_string() });
    }

    async fn call_inner(&self, authority: &str, request: &DirectoryRequest) -> Result<Envelope> {
        let connection = self.connection(authority).await?;
        let mut pooled = connection.lock().await;
        if pooled.dirty {
            bail!("cached connection is mid-exchange from an earlier failed call");
        }
        // Set under the lock before any bytes move; cleared only after the
        // full round trip. Cancellation or an I/O error anywhere in between
        // leaves the flag set.
        pooled.dirty = true;
        let frame = messages::serialize(request).context("failed to serialize request")?;
        write_frame(&mut pooled.stream, &frame).await?;
        let response = read_frame(&mut pooled.stream).await?;
        let envelope: Envelope =
            messages::deserialize_bounded(&response).context("malformed response envelope")?;
        pooled.dirty = false;
        Ok(envelope)
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteCall for RpcClient {
    async fn call(&self, endpoint: &Uri, request: DirectoryRequest) -> Result<Envelope> {
        let authority = endpoint.authority().to_string();
        let method = request.method();
        let result = tokio::time::timeout(CALL_TIMEOUT, self.call_inner(&authority, &request))
            .await
            .map_err(|_| anyhow::anyhow!("{} to {} timed out", method, endpoint));
        match result {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(error)) | Err(error) => {
                // The connection may be left mid-frame; never reuse it.
                self.invalidate(&authority);
                Err(error.context(format!("{} to {} failed", method, endpoint)))
            }
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// A bound RPC server endpoint dispatching to a [`DirectoryHandler`].
pub struct RpcServer {
    local_uri: Uri,
    accept_task: JoinHandle<()>,
}

impl RpcServer {
    /// Bind `addr` and start serving.
    pub async fn bind(addr: &str, handler: Arc<dyn DirectoryHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind rpc server on {}", addr))?;
        let local_addr = listener.local_addr().context("no local address")?;
        let local_uri = Uri::new(format!("http://{}", local_addr));

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        trace!(%peer, "accepted rpc connection");
                        let handler = handler.clone();
                        tokio::spawn(serve_connection(stream, handler));
                    }
                    Err(error) => {
                        warn!(error = %error, "rpc accept failed");
                    }
                }
            }
        });

        Ok(RpcServer { local_uri, accept_task })
    }

    /// The URI peers should use to reach this endpoint.
    pub fn local_uri(&self) -> &Uri {
        &self.local_uri
    }

    /// Stop accepting connections. Established connections close when their
    /// peers hang up.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// One request/response exchange per frame until the peer disconnects.
async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn DirectoryHandler>) {
    stream.set_nodelay(true).ok();
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => break, // Disconnect or oversized frame; either way we are done.
        };
        let envelope = match messages::deserialize_bounded::<DirectoryRequest>(&frame) {
            Ok(request) => {
                trace!(method = request.method(), caller = %request.caller_id(), "rpc dispatch");
                handler.handle(request).await
            }
            Err(error) => {
                debug!(error = %error, "undecodable rpc request");
                Envelope {
                    code: crate::response::StatusCode::Failure.to_int(),
                    message: format!("undecodable request: {}", error),
                    value: Payload::None,
                }
            }
        };
        let bytes = match messages::serialize(&envelope) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(error = %error, "failed to serialize response envelope");
                break;
            }
        };
        if write_frame(&mut stream, &bytes).await.is_err() {
            break;
        }
    }
}
