//! ADS client: one TCP connection, one request in flight.
//!
//! A single reader task owns the read half of the socket. It routes
//! DeviceNotification frames to the notification channel and hands the
//! response matching the pending request to the waiting caller. Requests
//! are serialized by an async lock around the write half.

use crate::codec::{read_frame, write_frame, AmsFrame, AmsHeader, ReadOutcome};
use crate::command::{
    check_result, AckResponse, AddNotificationRequest, AddNotificationResponse, AdsState,
    CommandId, DeleteNotificationRequest, Payload, ReadDeviceInfoResponse, ReadRequest,
    ReadResponse, ReadStateResponse, ReadWriteRequest, SumReadRequest, TransmissionMode,
    WriteControlRequest, WriteRequest,
};
use crate::index;
use crate::notification::{FieldSpec, NotificationStream};
use crate::symbols::{parse_symbol_upload, SymbolEntry, SymbolTable, UploadInfo};
use catio_common::ads_types::AdsValue;
use catio_common::config::ClientConfig;
use catio_common::error::{AdsError, AdsErrorCode, AdsResult};
use catio_common::net_id::AmsAddr;
use catio_common::state::{ConnectionState, StateMachine};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server socket address (host:port).
    pub address: String,
    /// Default target endpoint (the I/O server).
    pub target: AmsAddr,
    /// Our own endpoint.
    pub source: AmsAddr,
    /// Upper bound for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Upper bound for a response to arrive.
    pub request_timeout: Duration,
    /// Wait for the first byte of a frame.
    pub idle_timeout: Duration,
    /// Wait for the rest of a frame.
    pub frame_timeout: Duration,
    /// Notification channel capacity.
    pub notification_capacity: usize,
}

impl ClientOptions {
    /// Build options from the `[client]` configuration section.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            address: config.address.clone(),
            target: AmsAddr::new(config.target_net_id, config.target_port),
            source: AmsAddr::new(config.source_net_id, config.source_port),
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            idle_timeout: config.idle_timeout,
            frame_timeout: config.frame_timeout,
            notification_capacity: config.notification_capacity.max(1),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

struct Pending {
    invoke_id: u32,
    command: CommandId,
    reply: oneshot::Sender<AdsResult<AmsFrame>>,
}

struct RequestLane {
    writer: Option<OwnedWriteHalf>,
    invoke_id: u32,
}

impl RequestLane {
    /// Next invoke id; wraps on overflow and never yields zero.
    fn next_invoke_id(&mut self) -> u32 {
        self.invoke_id = self.invoke_id.wrapping_add(1);
        if self.invoke_id == 0 {
            self.invoke_id = 1;
        }
        self.invoke_id
    }
}

struct Shared {
    state: Mutex<StateMachine>,
    generation: AtomicU64,
    lane: tokio::sync::Mutex<RequestLane>,
    pending: Mutex<Option<Pending>>,
    notify_tx: Mutex<Option<mpsc::Sender<NotificationStream>>>,
    symbols: Mutex<SymbolTable>,
    subscriptions: Mutex<HashMap<u32, AmsAddr>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn dispatch(&self, frame: AmsFrame) {
        let header = frame.header;

        if header.command() == Some(CommandId::DeviceNotification) && !header.is_response() {
            self.forward_notification(&frame.payload);
            return;
        }
        if !header.is_response() {
            warn!(
                command = header.command_id,
                invoke_id = header.invoke_id,
                "Ignoring request frame sent to client"
            );
            return;
        }

        let mut pending = lock(&self.pending);
        let matches = pending.as_ref().is_some_and(|p| {
            p.invoke_id == header.invoke_id && p.command as u16 == header.command_id
        });
        if matches {
            if let Some(p) = pending.take() {
                let _ = p.reply.send(Ok(frame));
            }
        } else {
            warn!(
                command = header.command_id,
                invoke_id = header.invoke_id,
                expected = pending.as_ref().map(|p| p.invoke_id),
                "Discarding unmatched response"
            );
        }
    }

    fn forward_notification(&self, payload: &[u8]) {
        let stream = match NotificationStream::decode(payload) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Dropping malformed notification");
                return;
            }
        };
        let tx = lock(&self.notify_tx);
        let Some(tx) = tx.as_ref() else {
            return;
        };
        match tx.try_send(stream) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(stream)) => warn!(
                samples = stream.sample_count(),
                "Notification consumer lagging, dropping stream"
            ),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Notification consumer gone");
            }
        }
    }

    fn fail_pending(&self, reason: &str) {
        if let Some(p) = lock(&self.pending).take() {
            let _ = p
                .reply
                .send(Err(AdsError::Transport(format!("connection lost: {reason}"))));
        }
    }

    /// Tear down after the reader saw the connection end.
    async fn connection_lost(&self, generation: u64, reason: &AdsError) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        warn!(error = %reason, "ADS connection lost");

        self.fail_pending(&reason.to_string());
        lock(&self.state).mark_disconnected();
        lock(&self.symbols).invalidate();
        lock(&self.subscriptions).clear();
        lock(&self.notify_tx).take();

        let writer = self.lane.lock().await.writer.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

async fn reader_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    generation: u64,
    idle_timeout: Duration,
    frame_timeout: Duration,
) {
    let reason = loop {
        match read_frame(&mut reader, idle_timeout, frame_timeout).await {
            Ok(ReadOutcome::Frame(frame)) => shared.dispatch(frame),
            Ok(ReadOutcome::Idle) => trace!("ADS connection idle"),
            Ok(ReadOutcome::Closed) => {
                break AdsError::Transport("connection closed by peer".into());
            }
            Err(e) => break e,
        }
    };
    shared.connection_lost(generation, &reason).await;
}

/// ADS client connection.
pub struct AdsClient {
    options: ClientOptions,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    notify_rx: Mutex<Option<mpsc::Receiver<NotificationStream>>>,
}

impl std::fmt::Debug for AdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdsClient")
            .field("address", &self.options.address)
            .field("target", &self.options.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AdsClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(StateMachine::new()),
                generation: AtomicU64::new(0),
                lane: tokio::sync::Mutex::new(RequestLane {
                    writer: None,
                    invoke_id: 0,
                }),
                pending: Mutex::new(None),
                notify_tx: Mutex::new(None),
                symbols: Mutex::new(SymbolTable::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
            reader: Mutex::new(None),
            notify_rx: Mutex::new(None),
        }
    }

    /// Create a client and open the connection.
    pub async fn connect(options: ClientOptions) -> AdsResult<Self> {
        let client = Self::new(options);
        client.reopen().await?;
        Ok(client)
    }

    /// Open the connection; valid only while disconnected.
    ///
    /// Handles from an earlier session are gone, so callers re-run symbol
    /// upload and discovery afterwards.
    pub async fn reopen(&self) -> AdsResult<()> {
        lock(&self.shared.state).transition(ConnectionState::Connecting)?;
        info!(addr = %self.options.address, target = %self.options.target, "Connecting to ADS server");

        let connected = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect(&self.options.address),
        )
        .await;
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                lock(&self.shared.state).mark_disconnected();
                return Err(AdsError::Transport(format!(
                    "connect to {} failed: {e}",
                    self.options.address
                )));
            }
            Err(_) => {
                lock(&self.shared.state).mark_disconnected();
                return Err(AdsError::Timeout(format!(
                    "connect to {} after {:?}",
                    self.options.address, self.options.connect_timeout
                )));
            }
        };
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(self.options.notification_capacity);
        *lock(&self.shared.notify_tx) = Some(tx);
        *lock(&self.notify_rx) = Some(rx);
        self.shared.lane.lock().await.writer = Some(write_half);

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = tokio::spawn(reader_loop(
            read_half,
            Arc::clone(&self.shared),
            generation,
            self.options.idle_timeout,
            self.options.frame_timeout,
        ));
        if let Some(old) = lock(&self.reader).replace(handle) {
            old.abort();
        }

        lock(&self.shared.state).transition(ConnectionState::Open)?;
        info!(addr = %self.options.address, "Connected to ADS server");
        Ok(())
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.state).state()
    }

    /// Connection options.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Default target endpoint.
    #[must_use]
    pub fn target(&self) -> AmsAddr {
        self.options.target
    }

    /// Take the receiving end of the notification channel of the current
    /// session. Returns `None` if already taken or never connected.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<NotificationStream>> {
        lock(&self.notify_rx).take()
    }

    fn ensure_ready(&self) -> AdsResult<()> {
        let state = self.state();
        if state.accepts_requests() {
            Ok(())
        } else {
            Err(AdsError::NotReady(format!("connection is {state}")))
        }
    }

    /// Send one request and wait for its response payload.
    ///
    /// A non-zero AMS header error code surfaces as [`AdsError::Protocol`].
    /// Requests are never retried.
    pub async fn request(
        &self,
        target: AmsAddr,
        command: CommandId,
        payload: &[u8],
    ) -> AdsResult<Vec<u8>> {
        self.ensure_ready()?;
        let mut lane = self.shared.lane.lock().await;
        self.ensure_ready()?;

        let invoke_id = lane.next_invoke_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        *lock(&self.shared.pending) = Some(Pending {
            invoke_id,
            command,
            reply: reply_tx,
        });

        let header = AmsHeader::request(target, self.options.source, command, invoke_id);
        let Some(writer) = lane.writer.as_mut() else {
            lock(&self.shared.pending).take();
            return Err(AdsError::NotReady("connection has no writer".into()));
        };
        debug!(%command, invoke_id, %target, len = payload.len(), "ADS request");
        if let Err(e) = write_frame(writer, &header, payload).await {
            lock(&self.shared.pending).take();
            return Err(e);
        }

        let frame = match tokio::time::timeout(self.options.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(AdsError::Transport(
                    "connection closed while awaiting response".into(),
                ))
            }
            Err(_) => {
                let mut pending = lock(&self.shared.pending);
                if pending.as_ref().is_some_and(|p| p.invoke_id == invoke_id) {
                    pending.take();
                }
                return Err(AdsError::Timeout(format!(
                    "{command} invoke id {invoke_id} after {:?}",
                    self.options.request_timeout
                )));
            }
        };
        drop(lane);

        if frame.header.error_code != 0 {
            return Err(AdsError::Protocol(frame.header.error()));
        }
        Ok(frame.payload)
    }

    /// Read `length` bytes at `index_group`/`index_offset`.
    pub async fn read(
        &self,
        target: AmsAddr,
        index_group: u32,
        index_offset: u32,
        length: u32,
    ) -> AdsResult<Vec<u8>> {
        let request = ReadRequest {
            index_group,
            index_offset,
            length,
        };
        let raw = self.request(target, CommandId::Read, &request.encode()).await?;
        let response = ReadResponse::decode(&raw)?;
        check_result(response.result)?;
        Ok(response.data)
    }

    /// Write `data` at `index_group`/`index_offset`.
    pub async fn write(
        &self,
        target: AmsAddr,
        index_group: u32,
        index_offset: u32,
        data: &[u8],
    ) -> AdsResult<()> {
        let request = WriteRequest {
            index_group,
            index_offset,
            data: data.to_vec(),
        };
        let raw = self.request(target, CommandId::Write, &request.encode()).await?;
        check_result(AckResponse::decode(&raw)?.result)
    }

    /// Write `data`, then read up to `read_length` bytes back.
    pub async fn read_write(
        &self,
        target: AmsAddr,
        index_group: u32,
        index_offset: u32,
        read_length: u32,
        data: &[u8],
    ) -> AdsResult<Vec<u8>> {
        let request = ReadWriteRequest {
            index_group,
            index_offset,
            read_length,
            data: data.to_vec(),
        };
        self.send_read_write(target, &request).await
    }

    async fn send_read_write(
        &self,
        target: AmsAddr,
        request: &ReadWriteRequest,
    ) -> AdsResult<Vec<u8>> {
        let raw = self
            .request(target, CommandId::ReadWrite, &request.encode())
            .await?;
        let response = ReadResponse::decode(&raw)?;
        check_result(response.result)?;
        Ok(response.data)
    }

    /// ADS and device state of `target`.
    pub async fn read_state(&self, target: AmsAddr) -> AdsResult<(AdsState, u16)> {
        let raw = self.request(target, CommandId::ReadState, &[]).await?;
        let response = ReadStateResponse::decode(&raw)?;
        check_result(response.result)?;
        Ok((response.ads_state, response.device_state))
    }

    /// Name and version of `target`.
    pub async fn read_device_info(&self, target: AmsAddr) -> AdsResult<ReadDeviceInfoResponse> {
        let raw = self.request(target, CommandId::ReadDeviceInfo, &[]).await?;
        let response = ReadDeviceInfoResponse::decode(&raw)?;
        check_result(response.result)?;
        Ok(response)
    }

    /// Request an ADS/device state change.
    pub async fn write_control(
        &self,
        target: AmsAddr,
        ads_state: AdsState,
        device_state: u16,
        data: &[u8],
    ) -> AdsResult<()> {
        let request = WriteControlRequest {
            ads_state,
            device_state,
            data: data.to_vec(),
        };
        let raw = self
            .request(target, CommandId::WriteControl, &request.encode())
            .await?;
        check_result(AckResponse::decode(&raw)?.result)
    }

    /// Create a notification handle owned by this connection.
    pub async fn add_notification(
        &self,
        target: AmsAddr,
        request: &AddNotificationRequest,
    ) -> AdsResult<u32> {
        let raw = self
            .request(target, CommandId::AddNotification, &request.encode())
            .await?;
        let response = AddNotificationResponse::decode(&raw)?;
        check_result(response.result)?;
        lock(&self.shared.subscriptions).insert(response.handle, target);
        debug!(
            handle = response.handle,
            group = format_args!("{:#x}", request.index_group),
            offset = request.index_offset,
            "Notification added"
        );
        Ok(response.handle)
    }

    /// Subscribe to the whole value of a symbol.
    ///
    /// Returns the notification handle and the field layout for the reducer.
    pub async fn subscribe_symbol(
        &self,
        name: &str,
        mode: TransmissionMode,
        max_delay: Duration,
        cycle_time: Duration,
    ) -> AdsResult<(u32, FieldSpec)> {
        let entry = self.symbol_entry(name)?;
        let mut spec = FieldSpec::for_symbol(&entry, 0)
            .ok_or(AdsError::Protocol(AdsErrorCode::InvalidData))?;
        let request = AddNotificationRequest {
            index_group: entry.index_group,
            index_offset: entry.index_offset,
            length: entry.size,
            mode,
            max_delay,
            cycle_time,
        };
        spec.handle = self.add_notification(self.options.target, &request).await?;
        Ok((spec.handle, spec))
    }

    /// Release a notification handle.
    pub async fn delete_notification(&self, handle: u32) -> AdsResult<()> {
        let target = lock(&self.shared.subscriptions)
            .remove(&handle)
            .unwrap_or(self.options.target);
        self.send_delete_notification(target, handle).await
    }

    async fn send_delete_notification(&self, target: AmsAddr, handle: u32) -> AdsResult<()> {
        let request = DeleteNotificationRequest { handle };
        let raw = self
            .request(target, CommandId::DeleteNotification, &request.encode())
            .await?;
        check_result(AckResponse::decode(&raw)?.result)
    }

    /// Many reads in one round trip; one result per item.
    pub async fn sum_read(
        &self,
        target: AmsAddr,
        request: &SumReadRequest,
    ) -> AdsResult<Vec<AdsResult<Vec<u8>>>> {
        if request.items.is_empty() {
            return Ok(Vec::new());
        }
        let data = self.send_read_write(target, &request.to_read_write()).await?;
        request.decode_results(&data)
    }

    /// Read one typed value.
    pub async fn read_value<T: AdsValue>(
        &self,
        target: AmsAddr,
        index_group: u32,
        index_offset: u32,
    ) -> AdsResult<T> {
        #[allow(clippy::cast_possible_truncation)]
        let length = T::DATA_TYPE.size() as u32;
        let data = self.read(target, index_group, index_offset, length).await?;
        T::from_le_slice(&data)
    }

    /// Write one typed value.
    pub async fn write_value<T: AdsValue>(
        &self,
        target: AmsAddr,
        index_group: u32,
        index_offset: u32,
        value: &T,
    ) -> AdsResult<()> {
        self.write(target, index_group, index_offset, &value.to_le_vec())
            .await
    }

    /// Fetch the symbol table from the I/O server and rebuild the local one.
    ///
    /// Returns the number of symbols.
    pub async fn upload_symbols(&self) -> AdsResult<usize> {
        let target = self.options.target;
        let info = self.read(target, index::SYM_UPLOADINFO, 0, 8).await?;
        let info = UploadInfo::decode(&info)?;
        let raw = self
            .read(target, index::SYM_UPLOAD, 0, info.symbol_length)
            .await?;
        let entries = parse_symbol_upload(&raw)?;
        if entries.len() != info.symbol_count as usize {
            warn!(
                announced = info.symbol_count,
                parsed = entries.len(),
                "Symbol count differs from upload info"
            );
        }
        let count = entries.len();
        lock(&self.shared.symbols).build(entries);
        info!(count, "Symbol table uploaded");
        Ok(count)
    }

    /// Look up an uploaded symbol.
    pub fn symbol_entry(&self, name: &str) -> AdsResult<SymbolEntry> {
        lock(&self.shared.symbols)
            .get(name)
            .cloned()
            .ok_or(AdsError::Protocol(AdsErrorCode::SymbolNotFound))
    }

    /// All uploaded symbols in name order.
    #[must_use]
    pub fn symbols(&self) -> Vec<SymbolEntry> {
        lock(&self.shared.symbols).iter().cloned().collect()
    }

    /// Handle for `name`, served from the session cache when possible.
    pub async fn get_handle(&self, name: &str) -> AdsResult<u32> {
        if let Some(handle) = lock(&self.shared.symbols).cached_handle(name) {
            trace!(name, handle, "Symbol handle from cache");
            return Ok(handle);
        }
        let data = self
            .read_write(
                self.options.target,
                index::SYM_HNDBYNAME,
                0,
                4,
                name.as_bytes(),
            )
            .await?;
        let handle = u32::from_le_slice(data.get(..4).unwrap_or(&data))?;
        lock(&self.shared.symbols).cache_handle(name, handle);
        debug!(name, handle, "Symbol handle resolved");
        Ok(handle)
    }

    /// Release the cached handle for `name`, if any.
    pub async fn release_handle(&self, name: &str) -> AdsResult<()> {
        let handle = lock(&self.shared.symbols).remove_handle(name);
        match handle {
            Some(handle) => self.send_release_handle(handle).await,
            None => Ok(()),
        }
    }

    async fn send_release_handle(&self, handle: u32) -> AdsResult<()> {
        self.write(
            self.options.target,
            index::SYM_RELEASEHND,
            0,
            &handle.to_le_bytes(),
        )
        .await
    }

    /// Read a symbol value by handle.
    pub async fn read_symbol(&self, name: &str) -> AdsResult<Vec<u8>> {
        let size = self.symbol_entry(name)?.size;
        let handle = self.get_handle(name).await?;
        self.read(self.options.target, index::SYM_VALBYHND, handle, size)
            .await
    }

    /// Write a symbol value by handle.
    pub async fn write_symbol(&self, name: &str, data: &[u8]) -> AdsResult<()> {
        let handle = self.get_handle(name).await?;
        self.write(self.options.target, index::SYM_VALBYHND, handle, data)
            .await
    }

    /// Release owned handles and shut the connection down.
    ///
    /// Safe to call on a closed connection.
    pub async fn close(&self) -> AdsResult<()> {
        {
            let mut state = lock(&self.shared.state);
            if state.state() != ConnectionState::Open {
                return Ok(());
            }
            state.transition(ConnectionState::Closing)?;
        }

        let subscriptions: Vec<(u32, AmsAddr)> =
            lock(&self.shared.subscriptions).drain().collect();
        for (handle, target) in subscriptions {
            if let Err(e) = self.send_delete_notification(target, handle).await {
                warn!(handle, error = %e, "Failed to delete notification on close");
            }
        }

        let handles = lock(&self.shared.symbols).take_handles();
        for (name, handle) in handles {
            if let Err(e) = self.send_release_handle(handle).await {
                warn!(name, handle, error = %e, "Failed to release symbol handle on close");
            }
        }

        // Detach the reader so it does not run its own teardown.
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        let writer = self.shared.lane.lock().await.writer.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        self.shared.fail_pending("closed");
        lock(&self.shared.symbols).invalidate();
        lock(&self.shared.notify_tx).take();
        lock(&self.shared.state).mark_disconnected();
        info!(addr = %self.options.address, "ADS connection closed");
        Ok(())
    }
}

impl Drop for AdsClient {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}
