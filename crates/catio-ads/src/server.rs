//! Simulated I/O server: TCP listener, per-connection tasks and the
//! shared state they serve.

use crate::broadcast::{spawn_broadcaster, NotificationHub};
use crate::codec::{encode_frame, read_frame, ReadOutcome};
use crate::command::AdsState;
use crate::dispatch::Dispatcher;
use crate::topology::Topology;
use catio_common::config::ServerConfig;
use catio_common::error::{AdsError, AdsResult};
use catio_common::net_id::NetId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Everything a request can read or change.
#[derive(Debug)]
pub struct ServerState {
    /// NetId of the I/O server.
    pub net_id: NetId,
    /// Name reported by ReadDeviceInfo.
    pub device_name: String,
    /// ADS state reported by ReadState.
    pub ads_state: AdsState,
    /// Device state reported by ReadState.
    pub device_state: u16,
    /// Served devices, process image, symbols and CoE objects.
    pub topology: Topology,
}

impl ServerState {
    /// Running server state over `topology`.
    #[must_use]
    pub fn new(config: &ServerConfig, topology: Topology) -> Self {
        Self {
            net_id: config.net_id,
            device_name: config.device_name.clone(),
            ads_state: AdsState::Run,
            device_state: 0,
            topology,
        }
    }
}

/// State shared by connections, the broadcaster and the embedding program.
///
/// Guards are never held across an await point.
pub type SharedState = Arc<RwLock<ServerState>>;

struct ConnectionSettings {
    idle_timeout: Duration,
    frame_timeout: Duration,
    outbound_capacity: usize,
}

/// ADS server, not yet listening.
#[derive(Debug)]
pub struct AdsServer {
    config: ServerConfig,
    state: SharedState,
}

impl AdsServer {
    /// Create a server for `topology`.
    #[must_use]
    pub fn new(config: ServerConfig, topology: Topology) -> Self {
        let state = Arc::new(RwLock::new(ServerState::new(&config, topology)));
        Self { config, state }
    }

    /// Shared state handle.
    #[must_use]
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Bind the listener and start accepting connections and broadcasting.
    pub async fn spawn(self) -> AdsResult<RunningServer> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| {
                AdsError::Transport(format!("bind {} failed: {e}", self.config.bind_addr))
            })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, net_id = %self.config.net_id, "ADS server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub = Arc::new(NotificationHub::new());
        let broadcaster = spawn_broadcaster(
            Arc::clone(&hub),
            Arc::clone(&self.state),
            self.config.sample_interval,
            self.config.flush_period,
            shutdown_rx.clone(),
        );
        let settings = Arc::new(ConnectionSettings {
            idle_timeout: self.config.idle_timeout,
            frame_timeout: self.config.frame_timeout,
            outbound_capacity: self.config.outbound_capacity.max(1),
        });
        let acceptor = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.state),
            Arc::clone(&hub),
            settings,
            shutdown_rx,
        ));

        Ok(RunningServer {
            local_addr,
            state: self.state,
            hub,
            shutdown: shutdown_tx,
            acceptor,
            broadcaster,
        })
    }
}

/// Handle to a listening server.
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    state: SharedState,
    hub: Arc<NotificationHub>,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
    broadcaster: JoinHandle<()>,
}

impl RunningServer {
    /// Address actually bound.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared state handle.
    #[must_use]
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.hub.connection_count()
    }

    /// Number of live notification handles.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.hub.subscription_count()
    }

    /// Stop accepting, close every connection and stop the broadcaster.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.acceptor.await;
        let _ = self.broadcaster.await;
        info!(addr = %self.local_addr, "ADS server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: SharedState,
    hub: Arc<NotificationHub>,
    settings: Arc<ConnectionSettings>,
    mut shutdown: watch::Receiver<bool>,
) {
    let next_id = AtomicU64::new(1);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    info!(connection = id, %peer, "ADS client connected");
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        id,
                        Arc::clone(&state),
                        Arc::clone(&hub),
                        Arc::clone(&settings),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Acceptor stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    state: SharedState,
    hub: Arc<NotificationHub>,
    settings: Arc<ConnectionSettings>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(connection = id, error = %e, "TCP_NODELAY not set");
    }
    let (mut reader, writer) = stream.into_split();
    let (outbound, queue) = mpsc::channel(settings.outbound_capacity);
    let writer_task = tokio::spawn(write_loop(writer, queue));

    hub.register(id, outbound.clone());
    let mut dispatcher = Dispatcher::new(id, state, Arc::clone(&hub));

    loop {
        tokio::select! {
            outcome = read_frame(&mut reader, settings.idle_timeout, settings.frame_timeout) => {
                match outcome {
                    Ok(ReadOutcome::Frame(frame)) => {
                        let Some((header, payload)) = dispatcher.handle(&frame) else {
                            continue;
                        };
                        if outbound.send(encode_frame(&header, &payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(ReadOutcome::Idle) => {
                        // Subscribers may stay silent while their streams run.
                        trace!(connection = id, "No request within idle timeout");
                    }
                    Ok(ReadOutcome::Closed) => break,
                    Err(e) => {
                        warn!(connection = id, error = %e, "Closing connection");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    let dropped = hub.unregister(id);
    drop(outbound);
    drop(dispatcher);
    let _ = writer_task.await;
    info!(connection = id, %peer, notifications = dropped, "ADS client disconnected");
}

/// Drain queued frames to the socket; write errors end the task quietly.
async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = queue.recv().await {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
