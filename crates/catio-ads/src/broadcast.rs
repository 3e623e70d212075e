//! Server-side notification handles and the broadcaster task.
//!
//! The hub owns every connection's subscriptions. The broadcaster samples
//! them at the sample interval and, once per flush period, pushes one
//! DeviceNotification frame per connection holding one stamp per handle.

use crate::codec::{encode_frame, AmsHeader};
use crate::command::{AddNotificationRequest, CommandId, Payload, TransmissionMode};
use crate::dispatch::{read_index, Endpoint};
use crate::notification::{NotificationSample, NotificationStamp, NotificationStream};
use crate::server::{SharedState, ServerState};
use catio_common::error::{AdsError, AdsErrorCode, AdsResult};
use catio_common::net_id::AmsAddr;
use catio_common::time::FileTime;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Samples kept per handle between flushes; older ones are dropped.
pub const MAX_BUFFERED_SAMPLES: usize = 1024;

/// Shortest sample or flush period the broadcaster runs at.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// One notification handle owned by a connection.
#[derive(Debug)]
struct Subscription {
    endpoint: Endpoint,
    request: AddNotificationRequest,
    buffered: Vec<(FileTime, Vec<u8>)>,
    last_value: Option<Vec<u8>>,
    last_sampled: Option<Instant>,
}

impl Subscription {
    fn due(&self, now: Instant) -> bool {
        self.last_sampled
            .map_or(true, |at| now.duration_since(at) >= self.request.cycle_time)
    }

    fn on_change(&self) -> bool {
        matches!(
            self.request.mode,
            TransmissionMode::ServerOnChange | TransmissionMode::ClientOnChange
        )
    }

    fn record(&mut self, at: FileTime, value: Vec<u8>) {
        if self.on_change() && self.last_value.as_ref() == Some(&value) {
            return;
        }
        if self.buffered.len() >= MAX_BUFFERED_SAMPLES {
            self.buffered.remove(0);
        }
        self.buffered.push((at, value.clone()));
        self.last_value = Some(value);
    }
}

#[derive(Debug)]
struct Peer {
    outbound: mpsc::Sender<Vec<u8>>,
    client: AmsAddr,
    server: AmsAddr,
    next_handle: u32,
    subscriptions: BTreeMap<u32, Subscription>,
}

impl Peer {
    fn allocate_handle(&mut self) -> u32 {
        loop {
            self.next_handle = self.next_handle.wrapping_add(1);
            if self.next_handle != 0 && !self.subscriptions.contains_key(&self.next_handle) {
                return self.next_handle;
            }
        }
    }

    /// Drain buffered samples into one stream.
    fn take_stream(&mut self) -> Option<NotificationStream> {
        let stamps: Vec<NotificationStamp> = self
            .subscriptions
            .iter_mut()
            .filter(|(_, sub)| !sub.buffered.is_empty())
            .map(|(&handle, sub)| {
                let timestamp = sub
                    .buffered
                    .iter()
                    .map(|(at, _)| *at)
                    .max()
                    .unwrap_or_default();
                let samples = sub
                    .buffered
                    .drain(..)
                    .map(|(_, data)| NotificationSample { handle, data })
                    .collect();
                NotificationStamp { timestamp, samples }
            })
            .collect();
        (!stamps.is_empty()).then_some(NotificationStream { stamps })
    }
}

/// Registry of connections and their notification handles.
#[derive(Debug, Default)]
pub struct NotificationHub {
    peers: Mutex<HashMap<u64, Peer>>,
}

impl NotificationHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<u64, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection and its outbound frame queue.
    pub fn register(&self, connection: u64, outbound: mpsc::Sender<Vec<u8>>) {
        self.peers().insert(
            connection,
            Peer {
                outbound,
                client: AmsAddr::default(),
                server: AmsAddr::default(),
                next_handle: 0,
                subscriptions: BTreeMap::new(),
            },
        );
    }

    /// Forget a connection; its handles die with it.
    pub fn unregister(&self, connection: u64) -> usize {
        self.peers()
            .remove(&connection)
            .map_or(0, |peer| peer.subscriptions.len())
    }

    /// Create a notification handle on `connection`.
    ///
    /// `client` and `server` are the endpoints of the request that created
    /// it; notifications travel from `server` to `client`.
    pub fn subscribe(
        &self,
        connection: u64,
        client: AmsAddr,
        server: AmsAddr,
        endpoint: Endpoint,
        request: AddNotificationRequest,
    ) -> AdsResult<u32> {
        if request.mode == TransmissionMode::NoTrans {
            return Err(AdsError::Protocol(AdsErrorCode::TransModeNotSupported));
        }
        let mut peers = self.peers();
        let peer = peers
            .get_mut(&connection)
            .ok_or(AdsError::Protocol(AdsErrorCode::NotReady))?;
        peer.client = client;
        peer.server = server;
        let handle = peer.allocate_handle();
        peer.subscriptions.insert(
            handle,
            Subscription {
                endpoint,
                request,
                buffered: Vec::new(),
                last_value: None,
                last_sampled: None,
            },
        );
        debug!(connection, handle, mode = ?request.mode, "Notification handle created");
        Ok(handle)
    }

    /// Release a notification handle of `connection`.
    pub fn unsubscribe(&self, connection: u64, handle: u32) -> AdsResult<()> {
        self.peers()
            .get_mut(&connection)
            .and_then(|peer| peer.subscriptions.remove(&handle))
            .map(|_| debug!(connection, handle, "Notification handle deleted"))
            .ok_or(AdsError::Protocol(AdsErrorCode::NotifyHandleInvalid))
    }

    /// Number of live handles across all connections.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.peers().values().map(|p| p.subscriptions.len()).sum()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.peers().len()
    }

    /// Sample every due handle against `state`.
    pub fn sample(&self, state: &ServerState, at: FileTime, now: Instant) {
        let mut peers = self.peers();
        for (connection, peer) in peers.iter_mut() {
            for (handle, sub) in &mut peer.subscriptions {
                if !sub.due(now) {
                    continue;
                }
                sub.last_sampled = Some(now);
                let request = &sub.request;
                match read_index(
                    state,
                    &sub.endpoint,
                    request.index_group,
                    request.index_offset,
                    request.length as usize,
                ) {
                    Ok(value) => sub.record(at, value),
                    Err(e) => trace!(connection, handle, error = %e, "Sampling failed"),
                }
            }
        }
    }

    /// Push buffered samples, one frame per connection.
    ///
    /// Returns the number of frames queued. Full or closed queues are
    /// skipped.
    pub fn flush(&self) -> usize {
        let mut peers = self.peers();
        let mut sent = 0;
        for (connection, peer) in peers.iter_mut() {
            let Some(stream) = peer.take_stream() else {
                continue;
            };
            let header =
                AmsHeader::request(peer.client, peer.server, CommandId::DeviceNotification, 0);
            let frame = encode_frame(&header, &stream.encode());
            match peer.outbound.try_send(frame) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => warn!(
                    connection,
                    samples = stream.sample_count(),
                    "Outbound queue full, dropping notifications"
                ),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(connection, "Connection gone, notifications discarded");
                }
            }
        }
        sent
    }
}

/// Spawn the broadcaster: advances device frame counters and samples on
/// every sample tick, flushes on every flush tick.
pub fn spawn_broadcaster(
    hub: Arc<NotificationHub>,
    state: SharedState,
    sample_interval: Duration,
    flush_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sample_tick = tokio::time::interval(sample_interval.max(MIN_PERIOD));
        let mut flush_tick = tokio::time::interval(flush_period.max(MIN_PERIOD));
        sample_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sample_tick.tick() => {
                    let at = FileTime::now();
                    {
                        let mut state = state.write().unwrap_or_else(PoisonError::into_inner);
                        for device in &mut state.topology.tree.devices {
                            device.frame_counters.record_cycle(at);
                        }
                    }
                    let state = state.read().unwrap_or_else(PoisonError::into_inner);
                    hub.sample(&state, at, Instant::now());
                }
                _ = flush_tick.tick() => {
                    hub.flush();
                }
                _ = shutdown.changed() => {
                    debug!("Broadcaster stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_frame;
    use crate::index;
    use crate::topology::Topology;
    use catio_common::config::{Direction, ServerConfig, TopologyConfig};

    fn state() -> ServerState {
        ServerState::new(
            &ServerConfig::default(),
            Topology::from_config(&TopologyConfig::default()),
        )
    }

    fn request(mode: TransmissionMode) -> AddNotificationRequest {
        AddNotificationRequest {
            index_group: index::IO_RW_I,
            index_offset: 4,
            length: 2,
            mode,
            max_delay: Duration::ZERO,
            cycle_time: Duration::ZERO,
        }
    }

    #[test]
    fn test_handles_per_connection() {
        let hub = NotificationHub::new();
        let (tx, _rx) = mpsc::channel(4);
        hub.register(1, tx);
        let client = AmsAddr::default();
        let h1 = hub
            .subscribe(1, client, client, Endpoint::Server, request(TransmissionMode::ServerCycle))
            .unwrap();
        let h2 = hub
            .subscribe(1, client, client, Endpoint::Server, request(TransmissionMode::ServerCycle))
            .unwrap();
        assert_ne!(h1, 0);
        assert_ne!(h1, h2);
        assert_eq!(hub.subscription_count(), 2);

        hub.unsubscribe(1, h1).unwrap();
        assert_eq!(
            hub.unsubscribe(1, h1).unwrap_err(),
            AdsError::Protocol(AdsErrorCode::NotifyHandleInvalid)
        );
        assert_eq!(hub.unregister(1), 1);
        assert_eq!(hub.subscription_count(), 0);
    }

    #[test]
    fn test_no_trans_rejected() {
        let hub = NotificationHub::new();
        let (tx, _rx) = mpsc::channel(4);
        hub.register(1, tx);
        let addr = AmsAddr::default();
        assert_eq!(
            hub.subscribe(1, addr, addr, Endpoint::Server, request(TransmissionMode::NoTrans))
                .unwrap_err(),
            AdsError::Protocol(AdsErrorCode::TransModeNotSupported)
        );
    }

    #[test]
    fn test_flush_one_frame_per_connection() {
        let hub = NotificationHub::new();
        let (tx, mut rx) = mpsc::channel(4);
        hub.register(7, tx);
        let server = state();
        let client_addr: AmsAddr = "127.0.0.1.1.20:30000".parse().unwrap();
        let server_addr = AmsAddr::new(server.net_id, 300);

        let cyclic = hub
            .subscribe(7, client_addr, server_addr, Endpoint::Server, request(TransmissionMode::ServerCycle))
            .unwrap();
        let changes = hub
            .subscribe(7, client_addr, server_addr, Endpoint::Server, request(TransmissionMode::ServerOnChange))
            .unwrap();

        let start = Instant::now();
        hub.sample(&server, FileTime(1), start);
        hub.sample(&server, FileTime(2), start + Duration::from_millis(1));
        assert_eq!(hub.flush(), 1);
        assert_eq!(hub.flush(), 0);

        let frame = decode_frame(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame.header.command(), Some(CommandId::DeviceNotification));
        assert_eq!(frame.header.invoke_id, 0);
        assert!(!frame.header.is_response());
        assert_eq!(frame.header.target, client_addr);

        let stream = NotificationStream::decode(&frame.payload).unwrap();
        assert_eq!(stream.stamps.len(), 2);
        let count = |handle: u32| {
            stream
                .stamps
                .iter()
                .flat_map(|s| &s.samples)
                .filter(|s| s.handle == handle)
                .count()
        };
        // Cyclic buffers every sample, on-change only the first.
        assert_eq!(count(cyclic), 2);
        assert_eq!(count(changes), 1);
        assert_eq!(stream.stamps[0].timestamp, FileTime(2));
        assert_eq!(server.topology.image.size(Direction::Input), 12);
    }

    #[test]
    fn test_flush_skips_full_queue() {
        let hub = NotificationHub::new();
        let (tx, _rx) = mpsc::channel(1);
        hub.register(1, tx);
        let server = state();
        let addr = AmsAddr::default();
        hub.subscribe(1, addr, addr, Endpoint::Server, request(TransmissionMode::ServerCycle))
            .unwrap();

        let mut now = Instant::now();
        for _ in 0..3 {
            hub.sample(&server, FileTime::now(), now);
            hub.flush();
            now += Duration::from_millis(1);
        }
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcaster_survives_zero_periods() {
        let shared: SharedState = Arc::new(std::sync::RwLock::new(state()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = spawn_broadcaster(
            Arc::new(NotificationHub::new()),
            Arc::clone(&shared),
            Duration::ZERO,
            Duration::ZERO,
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = shutdown_tx.send(true);
        assert!(task.await.is_ok());

        let state = shared.read().unwrap();
        assert!(state.topology.tree.devices[0].frame_counters.cyclic_sent > 0);
    }
}
