//! Async TCP client for the OpenRGB SDK server.
//!
//! The [`OpenRgbClient`] connects to an OpenRGB server, negotiates an SDK
//! protocol version, routes replies back to callers via oneshot channels, and
//! forwards unsolicited server packets as [`ClientEvent`]s.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      OpenRgbClient                           │
//! │                                                              │
//! │  ┌──────────────┐        ┌──────────────────────────────┐   │
//! │  │  Public API  │        │   Background Task             │   │
//! │  │              │        │                                │   │
//! │  │  request() ──┼──cmd──▶│  TCP read/write loop          │   │
//! │  │              │  chan   │                                │   │
//! │  │  events()  ◀─┼──evt──◀│  Route: reply → tracker       │   │
//! │  │              │  chan   │    DeviceListUpdated → events  │   │
//! │  └──────────────┘        └──────────────────────────────┘   │
//! │                                                              │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │  RequestTracker                                       │   │
//! │  │  Correlates (device index, packet id) with receivers  │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replies carry no sequence number; the server echoes the request's device
//! index and packet id, and replies for the same pair arrive in request order
//! on the single TCP stream. The tracker therefore keeps a FIFO queue per
//! `(device index, packet id)` key.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use accentsync_core::prelude::*;
use accentsync_core::Color;

use crate::protocol::{self, packet_id, Controller, PacketHeader, CLIENT_PROTOCOL_VERSION};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Initial reconnection backoff duration.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum reconnection backoff duration (cap).
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Maximum number of consecutive reconnection attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Capacity of the command channel (bounded, to apply backpressure).
const CMD_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the event channel (bounded, events can be bursty).
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the channel between the socket reader and the I/O loop.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// How long to wait for a RequestProtocolVersion reply before concluding the
/// server predates version 1 (such servers never answer).
const VERSION_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default reply timeout for requests, when not overridden in
/// [`ClientOptions`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How often to run stale request cleanup in the I/O loop.
const STALE_REQUEST_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout after which a pending request is considered stale and removed.
const STALE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Mode names that accept direct color writes without animating over them.
/// Compared case-insensitively against the active mode name.
pub const STATIC_MODE_NAMES: [&str; 4] = ["direct", "static", "fixed", "solid"];

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Current connection state of an [`OpenRgbClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected and not attempting to connect.
    Disconnected,
    /// Initial connection attempt in progress.
    Connecting,
    /// Connected and ready to exchange packets.
    Connected,
    /// Connection lost; background task is retrying.
    Reconnecting {
        /// The current reconnection attempt number (1-indexed).
        attempt: u32,
    },
}

/// Unsolicited happenings surfaced to the event receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The server announced that its controller list changed.
    DeviceListUpdated,
    /// The connection dropped; a reconnection attempt is scheduled.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// A reconnection attempt succeeded. The device cache is stale until the
    /// next refresh.
    Reconnected,
    /// Reconnection was exhausted or disabled; the client is dead.
    PermanentlyDisconnected,
}

/// Connection parameters beyond the server address.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Name announced to the server (shows up in its client list).
    pub client_name: String,
    /// How long to wait for a reply before failing a request.
    pub request_timeout: Duration,
    /// Whether to reconnect with backoff after an unexpected disconnect.
    pub reconnect: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_name: "accent-sync".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: true,
        }
    }
}

/// Summary of one controller, kept in the client's device cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub index: u32,
    pub name: String,
    pub device_type: i32,
    pub led_count: u32,
    pub mode_names: Vec<String>,
    pub active_mode: i32,
}

impl Device {
    pub fn from_controller(index: u32, controller: &Controller) -> Self {
        Self {
            index,
            name: controller.name.clone(),
            device_type: controller.device_type,
            led_count: controller.leds.len() as u32,
            mode_names: controller.modes.iter().map(|m| m.name.clone()).collect(),
            active_mode: controller.active_mode,
        }
    }

    /// Name of the active mode, if the index is in range.
    pub fn active_mode_name(&self) -> Option<&str> {
        usize::try_from(self.active_mode)
            .ok()
            .and_then(|i| self.mode_names.get(i))
            .map(String::as_str)
    }

    /// `true` when the active mode is in the static family and direct color
    /// writes will stick without a mode switch.
    pub fn in_static_mode(&self) -> bool {
        self.active_mode_name()
            .map(|name| STATIC_MODE_NAMES.iter().any(|s| name.eq_ignore_ascii_case(s)))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Internal command type
// ---------------------------------------------------------------------------

/// Internal messages sent from the public API to the background task.
enum ClientCommand {
    /// Write `frame` and deliver the correlated reply to `response_tx`.
    Request {
        /// `(device index, packet id)` the reply will echo.
        key: (u32, u32),
        frame: Vec<u8>,
        response_tx: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Write `frame`; the server sends no reply. `ack_tx` reports the write.
    Send {
        frame: Vec<u8>,
        ack_tx: oneshot::Sender<Result<()>>,
    },
    /// Close the connection and stop the background task.
    Disconnect,
}

// ---------------------------------------------------------------------------
// Request tracker
// ---------------------------------------------------------------------------

struct PendingRequest {
    response_tx: oneshot::Sender<Result<Vec<u8>>>,
    created_at: Instant,
}

/// Correlates replies with waiting callers, FIFO per key.
struct RequestTracker {
    pending: HashMap<(u32, u32), VecDeque<PendingRequest>>,
}

impl RequestTracker {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Register a pending slot for `key`.
    fn register(&mut self, key: (u32, u32), response_tx: oneshot::Sender<Result<Vec<u8>>>) {
        self.pending
            .entry(key)
            .or_default()
            .push_back(PendingRequest {
                response_tx,
                created_at: Instant::now(),
            });
    }

    /// Deliver a reply payload to the oldest caller waiting on `key`.
    ///
    /// Returns `true` if a pending request was found, `false` for an
    /// unsolicited reply.
    fn complete(&mut self, key: (u32, u32), payload: Vec<u8>) -> bool {
        let Some(queue) = self.pending.get_mut(&key) else {
            return false;
        };
        let Some(slot) = queue.pop_front() else {
            return false;
        };
        if queue.is_empty() {
            self.pending.remove(&key);
        }
        // The receiver may have been dropped (caller timed out); ignore.
        let _ = slot.response_tx.send(Ok(payload));
        true
    }

    /// Fail every pending request, e.g. when the connection is lost.
    fn fail_all<F: Fn() -> Error>(&mut self, err: F) {
        for (_, queue) in self.pending.drain() {
            for slot in queue {
                let _ = slot.response_tx.send(Err(err()));
            }
        }
    }

    /// Remove all requests that have been pending longer than `timeout`.
    ///
    /// Returns the keys that had stale entries removed. Dropping the slot
    /// drops its sender, which surfaces as [`Error::ChannelClosed`] for any
    /// caller still waiting.
    fn cleanup_stale(&mut self, timeout: Duration) -> Vec<(u32, u32)> {
        let now = Instant::now();
        let mut stale = Vec::new();
        self.pending.retain(|key, queue| {
            let before = queue.len();
            queue.retain(|slot| now.duration_since(slot.created_at) <= timeout);
            if queue.len() < before {
                stale.push(*key);
            }
            !queue.is_empty()
        });
        stale
    }

    /// Return the number of currently pending requests.
    fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }
}

// ---------------------------------------------------------------------------
// ClientHandle
// ---------------------------------------------------------------------------

/// A clonable handle for talking to the OpenRGB server.
///
/// Shares the underlying connection with the [`OpenRgbClient`] that created
/// it. The handle becomes inoperable when the client (or its background task)
/// is dropped; requests then return [`Error::ChannelClosed`].
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<ClientCommand>,
    state: Arc<std::sync::RwLock<ConnectionState>>,
    /// Controller summaries from the last successful refresh.
    devices: Arc<std::sync::RwLock<Vec<Device>>>,
    /// Negotiated SDK protocol version. Updated by the background task after
    /// a reconnection handshake.
    protocol_version: Arc<AtomicU32>,
    request_timeout: Duration,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner()).clone();
        f.debug_struct("ClientHandle")
            .field("connection_state", &state)
            .field("device_count", &self.device_count())
            .finish()
    }
}

impl ClientHandle {
    /// Send a request frame and wait for the correlated reply payload.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`] if the background task has exited.
    /// - [`Error::Protocol`] if no reply arrives within the request timeout.
    /// - [`Error::Connection`] if the connection drops while waiting.
    async fn request_frame(&self, key: (u32, u32), frame: Vec<u8>) -> Result<Vec<u8>> {
        let (response_tx, response_rx) = oneshot::channel();

        self.cmd_tx
            .send(ClientCommand::Request {
                key,
                frame,
                response_tx,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => Err(Error::protocol(format!(
                "no reply to packet {} within {:?}",
                key.1, self.request_timeout
            ))),
        }
    }

    /// Send a fire-and-forget frame, waiting only for the socket write.
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();

        self.cmd_tx
            .send(ClientCommand::Send { frame, ack_tx })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        ack_rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Ask the server how many controllers it manages.
    pub async fn controller_count(&self) -> Result<u32> {
        let key = (0, packet_id::REQUEST_CONTROLLER_COUNT);
        let payload = self
            .request_frame(key, protocol::request_controller_count())
            .await?;
        if payload.len() < 4 {
            return Err(Error::protocol(format!(
                "controller count reply too short: {} bytes",
                payload.len()
            )));
        }
        Ok(u32::from_le_bytes(payload[..4].try_into().unwrap()))
    }

    /// Fetch and parse the full description of one controller.
    pub async fn controller_data(&self, device_index: u32) -> Result<Controller> {
        let version = self.protocol_version();
        let key = (device_index, packet_id::REQUEST_CONTROLLER_DATA);
        let payload = self
            .request_frame(key, protocol::request_controller_data(device_index, version))
            .await?;
        Controller::parse(&payload, version)
    }

    /// Re-enumerate the server's controllers and replace the device cache.
    ///
    /// Controllers whose blobs fail to parse are skipped with a warning; the
    /// rest of the refresh proceeds.
    pub async fn refresh_devices(&self) -> Result<Vec<Device>> {
        let count = self.controller_count().await?;
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            match self.controller_data(index).await {
                Ok(controller) => devices.push(Device::from_controller(index, &controller)),
                Err(err) if err.is_recoverable() => {
                    warn!("Skipping controller {}: {}", index, err);
                }
                Err(err) => return Err(err),
            }
        }

        {
            let mut cache = self.devices.write().unwrap_or_else(|e| e.into_inner());
            *cache = devices.clone();
        }
        info!("Device cache refreshed: {} controller(s)", devices.len());
        Ok(devices)
    }

    /// Switch every cached device whose active mode is outside the static
    /// family to its custom (direct-color) mode.
    ///
    /// Returns the number of devices switched.
    pub async fn prepare_devices(&self) -> Result<usize> {
        let devices = self.devices();
        let mut switched = 0;
        for device in &devices {
            if device.in_static_mode() {
                debug!(
                    "Device {} '{}' already in static-family mode '{}'",
                    device.index,
                    device.name,
                    device.active_mode_name().unwrap_or("?")
                );
                continue;
            }
            self.send_frame(protocol::set_custom_mode(device.index))
                .await?;
            info!(
                "Device {} '{}' switched to its custom mode (was '{}')",
                device.index,
                device.name,
                device.active_mode_name().unwrap_or("?")
            );
            switched += 1;
        }
        Ok(switched)
    }

    /// Paint every cached device with `color`, one UpdateLeds per device
    /// covering its full LED count.
    ///
    /// Returns the number of devices written. The first socket failure aborts
    /// with [`Error::DeviceWrite`].
    pub async fn apply_to_all(&self, color: Color) -> Result<usize> {
        let devices = self.devices();
        let mut written = 0;
        for device in &devices {
            self.send_frame(protocol::update_leds(device.index, color, device.led_count))
                .await?;
            written += 1;
        }
        debug!("Applied {} to {} device(s)", color, written);
        Ok(written)
    }

    /// Snapshot of the device cache from the last refresh.
    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of cached devices.
    pub fn device_count(&self) -> usize {
        self.devices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The SDK protocol version negotiated with the server.
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version.load(Ordering::SeqCst)
    }

    /// Return the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Return `true` if the client is currently connected.
    pub fn is_connected(&self) -> bool {
        *self.state.read().unwrap_or_else(|e| e.into_inner()) == ConnectionState::Connected
    }
}

// ---------------------------------------------------------------------------
// OpenRgbClient
// ---------------------------------------------------------------------------

/// Async client for the OpenRGB SDK server.
///
/// Create with [`OpenRgbClient::connect`], then use the operations on the
/// client (or a [`ClientHandle`] from [`request_handle`]) and consume
/// unsolicited [`ClientEvent`]s from [`event_receiver`].
///
/// The client spawns a background Tokio task that owns the TCP connection.
/// The task cleans up automatically when `OpenRgbClient` is dropped (the
/// command channel closes, which signals the task to exit).
///
/// [`request_handle`]: OpenRgbClient::request_handle
/// [`event_receiver`]: OpenRgbClient::event_receiver
pub struct OpenRgbClient {
    handle: ClientHandle,
    /// Event receiver (not clonable; owned exclusively by this client).
    event_rx: mpsc::Receiver<ClientEvent>,
}

impl OpenRgbClient {
    /// Connect to the OpenRGB server at `addr` (`host:port`).
    ///
    /// Performs the version handshake and announces the client name before
    /// returning, then spawns the background I/O task (with automatic
    /// reconnection if `options.reconnect` is set).
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] if the TCP connect or the handshake fails.
    pub async fn connect(addr: &str, options: ClientOptions) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ClientCommand>(CMD_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(std::sync::RwLock::new(ConnectionState::Connecting));
        let devices = Arc::new(std::sync::RwLock::new(Vec::new()));

        // Attempt the first connection before returning so callers know
        // whether the server is reachable.
        info!("Connecting to OpenRGB at {}", addr);
        let mut stream = TcpStream::connect(addr).await.map_err(|err| {
            Error::connection(format!("Failed to connect to OpenRGB at {addr}: {err}"))
        })?;
        let negotiated = handshake(&mut stream, &options.client_name).await?;
        let protocol_version = Arc::new(AtomicU32::new(negotiated));

        {
            let mut guard = state.write().unwrap_or_else(|e| e.into_inner());
            *guard = ConnectionState::Connected;
        }

        let max_attempts = if options.reconnect {
            MAX_RECONNECT_ATTEMPTS
        } else {
            0
        };

        tokio::spawn(run_client_task(
            addr.to_string(),
            options.client_name.clone(),
            stream,
            max_attempts,
            cmd_rx,
            event_tx,
            Arc::clone(&state),
            Arc::clone(&protocol_version),
        ));

        Ok(Self {
            handle: ClientHandle {
                cmd_tx,
                state,
                devices,
                protocol_version,
                request_timeout: options.request_timeout,
            },
            event_rx,
        })
    }

    /// Create a clonable handle that shares this client's connection.
    pub fn request_handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Return a mutable reference to the event receiver.
    pub fn event_receiver(&mut self) -> &mut mpsc::Receiver<ClientEvent> {
        &mut self.event_rx
    }

    /// Split the client into its handle and the owned event receiver.
    ///
    /// Useful when the event stream is consumed by a different task than the
    /// one making requests.
    pub fn into_parts(self) -> (ClientHandle, mpsc::Receiver<ClientEvent>) {
        (self.handle, self.event_rx)
    }

    /// Re-enumerate controllers; see [`ClientHandle::refresh_devices`].
    pub async fn refresh_devices(&self) -> Result<Vec<Device>> {
        self.handle.refresh_devices().await
    }

    /// Prepare device modes; see [`ClientHandle::prepare_devices`].
    pub async fn prepare_devices(&self) -> Result<usize> {
        self.handle.prepare_devices().await
    }

    /// Paint every device; see [`ClientHandle::apply_to_all`].
    pub async fn apply_to_all(&self, color: Color) -> Result<usize> {
        self.handle.apply_to_all(color).await
    }

    /// Snapshot of the device cache from the last refresh.
    pub fn devices(&self) -> Vec<Device> {
        self.handle.devices()
    }

    /// The SDK protocol version negotiated with the server.
    pub fn protocol_version(&self) -> u32 {
        self.handle.protocol_version()
    }

    /// Return the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.handle.connection_state()
    }

    /// Return `true` if the client is currently connected.
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Close the connection and stop the background task.
    pub async fn disconnect(&self) {
        // Ignore the send error; if the channel is already closed the task
        // has already exited.
        let _ = self.handle.cmd_tx.send(ClientCommand::Disconnect).await;
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Negotiate the protocol version and announce the client name.
///
/// Returns the negotiated version, `min(client, server)`. A server that
/// stays silent for [`VERSION_HANDSHAKE_TIMEOUT`] is treated as version 0.
async fn handshake(stream: &mut TcpStream, client_name: &str) -> Result<u32> {
    stream
        .write_all(&protocol::request_protocol_version(CLIENT_PROTOCOL_VERSION))
        .await
        .map_err(|err| Error::connection(format!("handshake write failed: {err}")))?;

    let server_version =
        match tokio::time::timeout(VERSION_HANDSHAKE_TIMEOUT, read_version_reply(stream)).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(
                    "No protocol version reply within {:?}; assuming a version 0 server",
                    VERSION_HANDSHAKE_TIMEOUT
                );
                0
            }
        };

    let negotiated = CLIENT_PROTOCOL_VERSION.min(server_version);
    info!(
        "Negotiated SDK protocol version {} (client {}, server {})",
        negotiated, CLIENT_PROTOCOL_VERSION, server_version
    );

    stream
        .write_all(&protocol::set_client_name(client_name))
        .await
        .map_err(|err| Error::connection(format!("failed to announce client name: {err}")))?;

    Ok(negotiated)
}

/// Read packets until the version reply shows up.
async fn read_version_reply(stream: &mut TcpStream) -> Result<u32> {
    loop {
        let (header, payload) = match protocol::read_packet(stream).await {
            Ok(packet) => packet,
            Err(Error::Io(err)) => {
                return Err(Error::connection(format!("handshake read failed: {err}")))
            }
            Err(err) => return Err(err),
        };
        if header.packet_id == packet_id::REQUEST_PROTOCOL_VERSION {
            if payload.len() < 4 {
                return Err(Error::protocol(format!(
                    "protocol version reply too short: {} bytes",
                    payload.len()
                )));
            }
            return Ok(u32::from_le_bytes(payload[..4].try_into().unwrap()));
        }
        // Anything else this early is unexpected; skip it and keep waiting.
        debug!(
            "Ignoring packet {} during version handshake",
            header.packet_id
        );
    }
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

/// Entry point for the background I/O task.
///
/// Accepts an already-connected `stream` for the first connection, then
/// manages reconnection on unexpected disconnects.
#[allow(clippy::too_many_arguments)]
async fn run_client_task(
    addr: String,
    client_name: String,
    stream: TcpStream,
    max_reconnect_attempts: u32,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    event_tx: mpsc::Sender<ClientEvent>,
    state: Arc<std::sync::RwLock<ConnectionState>>,
    protocol_version: Arc<AtomicU32>,
) {
    let mut tracker = RequestTracker::new();

    // Run the read/write loop with the initial connection.
    let reconnect = run_io_loop(stream, &mut cmd_rx, &event_tx, &mut tracker).await;
    tracker.fail_all(|| Error::connection("connection to the hub lost"));

    if !reconnect {
        // Either we received a Disconnect command or the cmd channel closed.
        set_state(&state, ConnectionState::Disconnected);
        return;
    }

    // Connection lost unexpectedly, attempt reconnection with backoff.
    let mut attempt: u32 = 1;
    loop {
        if attempt > max_reconnect_attempts {
            if max_reconnect_attempts == 0 {
                warn!("OpenRGB: connection lost and reconnection is disabled");
            } else {
                error!(
                    "OpenRGB: exceeded {} reconnection attempts, giving up",
                    max_reconnect_attempts
                );
            }
            set_state(&state, ConnectionState::Disconnected);
            let _ = event_tx.send(ClientEvent::PermanentlyDisconnected).await;
            break;
        }

        set_state(&state, ConnectionState::Reconnecting { attempt });
        let _ = event_tx
            .send(ClientEvent::Reconnecting {
                attempt,
                max_attempts: max_reconnect_attempts,
            })
            .await;

        let backoff = compute_backoff(attempt);
        warn!(
            "OpenRGB: connection lost, retrying in {:?} (attempt {}/{})",
            backoff, attempt, max_reconnect_attempts
        );
        tokio::time::sleep(backoff).await;

        // Check if the cmd channel closed while we were sleeping; the
        // client was dropped, no point reconnecting.
        if cmd_rx.is_closed() {
            set_state(&state, ConnectionState::Disconnected);
            break;
        }

        match reconnect_once(&addr, &client_name).await {
            Ok((stream, negotiated)) => {
                info!("OpenRGB: reconnected (attempt {})", attempt);
                protocol_version.store(negotiated, Ordering::SeqCst);
                set_state(&state, ConnectionState::Connected);
                let _ = event_tx.send(ClientEvent::Reconnected).await;

                attempt = 1; // reset on success

                let reconnect = run_io_loop(stream, &mut cmd_rx, &event_tx, &mut tracker).await;
                tracker.fail_all(|| Error::connection("connection to the hub lost"));
                if !reconnect {
                    set_state(&state, ConnectionState::Disconnected);
                    break;
                }
                // The loop continues and retries from attempt 1.
            }
            Err(err) => {
                warn!("OpenRGB: reconnection attempt {} failed: {}", attempt, err);
                attempt += 1;
            }
        }
    }

    debug!("OpenRGB background task exiting");
}

/// Open a fresh connection and redo the handshake.
async fn reconnect_once(addr: &str, client_name: &str) -> Result<(TcpStream, u32)> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|err| Error::connection(format!("{err}")))?;
    let negotiated = handshake(&mut stream, client_name).await?;
    Ok((stream, negotiated))
}

fn set_state(state: &Arc<std::sync::RwLock<ConnectionState>>, next: ConnectionState) {
    let mut guard = state.write().unwrap_or_else(|e| e.into_inner());
    *guard = next;
}

/// Run one connection's read/write select loop.
///
/// Returns `true` if the connection was lost unexpectedly (caller should
/// reconnect), or `false` if the task should terminate (Disconnect command
/// or command channel closed).
async fn run_io_loop(
    stream: TcpStream,
    cmd_rx: &mut mpsc::Receiver<ClientCommand>,
    event_tx: &mpsc::Sender<ClientEvent>,
    tracker: &mut RequestTracker,
) -> bool {
    let (read_half, mut write_half) = stream.into_split();

    // read_exact is not cancellation-safe, so packets are read by a side task
    // and fed through a channel the select loop can safely poll.
    let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_frames(read_half, frame_tx));

    let mut cleanup_interval = tokio::time::interval(STALE_REQUEST_CLEANUP_INTERVAL);
    cleanup_interval.tick().await; // consume the immediate first tick

    let reconnect = loop {
        tokio::select! {
            // ── Incoming packet ─────────────────────────────────────────
            frame = frame_rx.recv() => {
                match frame {
                    Some((header, payload)) => handle_frame(header, payload, tracker, event_tx),
                    None => {
                        debug!("OpenRGB: socket reader ended");
                        break true; // reconnect
                    }
                }
            }

            // ── Outgoing command from the public API ─────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Request { key, frame, response_tx }) => {
                        handle_request(key, frame, response_tx, tracker, &mut write_half).await;
                    }
                    Some(ClientCommand::Send { frame, ack_tx }) => {
                        handle_send(frame, ack_tx, &mut write_half).await;
                    }
                    Some(ClientCommand::Disconnect) => {
                        break false; // clean shutdown
                    }
                    None => {
                        // The OpenRgbClient was dropped.
                        debug!("OpenRGB: command channel closed, shutting down");
                        break false;
                    }
                }
            }

            // ── Periodic stale request cleanup ──────────────────────────
            _ = cleanup_interval.tick() => {
                let stale = tracker.cleanup_stale(STALE_REQUEST_TIMEOUT);
                if !stale.is_empty() {
                    debug!(
                        "OpenRGB: cleaned up {} stale request(s): {:?}",
                        stale.len(),
                        stale,
                    );
                }
            }
        }
    };

    reader.abort();
    reconnect
}

/// Read packets off the socket and forward them to the I/O loop.
async fn read_frames(mut read_half: OwnedReadHalf, frame_tx: mpsc::Sender<(PacketHeader, Vec<u8>)>) {
    loop {
        match protocol::read_packet(&mut read_half).await {
            Ok(packet) => {
                if frame_tx.send(packet).await.is_err() {
                    break; // I/O loop gone
                }
            }
            Err(err) => {
                debug!("OpenRGB: socket read ended: {}", err);
                break;
            }
        }
    }
}

/// Route one incoming packet to the tracker or the event channel.
fn handle_frame(
    header: PacketHeader,
    payload: Vec<u8>,
    tracker: &mut RequestTracker,
    event_tx: &mpsc::Sender<ClientEvent>,
) {
    if header.packet_id == packet_id::DEVICE_LIST_UPDATED {
        if let Err(err) = event_tx.try_send(ClientEvent::DeviceListUpdated) {
            warn!(
                "OpenRGB: event channel full or closed, dropping device list update: {}",
                err
            );
        }
        return;
    }

    if !tracker.complete((header.device_index, header.packet_id), payload) {
        debug!(
            "OpenRGB: unsolicited reply for packet {} (device {})",
            header.packet_id, header.device_index
        );
    }
}

/// Write a request frame and register the caller for its reply.
async fn handle_request(
    key: (u32, u32),
    frame: Vec<u8>,
    response_tx: oneshot::Sender<Result<Vec<u8>>>,
    tracker: &mut RequestTracker,
    write_half: &mut OwnedWriteHalf,
) {
    if let Err(err) = write_half.write_all(&frame).await {
        let _ = response_tx.send(Err(Error::connection(format!(
            "failed to send request: {err}"
        ))));
        return;
    }
    // This loop is the only frame consumer, so the reply cannot be processed
    // before this registration runs.
    tracker.register(key, response_tx);
}

/// Write a fire-and-forget frame and ack the caller.
async fn handle_send(
    frame: Vec<u8>,
    ack_tx: oneshot::Sender<Result<()>>,
    write_half: &mut OwnedWriteHalf,
) {
    let result = write_half
        .write_all(&frame)
        .await
        .map_err(|err| Error::device_write(format!("socket write failed: {err}")));
    let _ = ack_tx.send(result);
}

/// Compute exponential backoff duration for reconnection attempt `n`.
///
/// The formula is `INITIAL_BACKOFF * 2^(n-1)`, capped at `MAX_BACKOFF`.
fn compute_backoff(attempt: u32) -> Duration {
    // 2^(attempt-1), capped to avoid overflow.
    // checked_shl returns None if the shift amount would overflow.
    let exponent = attempt.saturating_sub(1);
    let multiplier: u64 = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let secs = INITIAL_BACKOFF.as_secs().saturating_mul(multiplier);
    Duration::from_secs(secs.min(MAX_BACKOFF.as_secs()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
