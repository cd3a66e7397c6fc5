//! Test utilities: an in-process fake OpenRGB server.
//!
//! [`FakeHub`] binds a real TCP listener on a loopback port and speaks just
//! enough of the SDK protocol to exercise [`crate::client::OpenRgbClient`]:
//! version negotiation, client names, controller enumeration, and recording
//! of UpdateLeds / SetCustomMode writes. It can also push unsolicited
//! DeviceListUpdated packets and drop live connections to provoke the
//! reconnection path.
//!
//! Available to other crates through the `test-helpers` feature.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use accentsync_core::Color;

use crate::protocol::{self, packet_id, PacketHeader, CLIENT_PROTOCOL_VERSION};

/// How long the `wait_for_*` helpers poll before panicking.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One controller the fake hub will report.
#[derive(Debug, Clone)]
pub struct FakeController {
    pub name: String,
    pub device_type: i32,
    pub led_count: u32,
    pub mode_names: Vec<String>,
    pub active_mode: i32,
}

impl FakeController {
    /// A controller with one "Direct" mode, active.
    pub fn new(name: &str, led_count: u32) -> Self {
        Self {
            name: name.to_string(),
            device_type: 0,
            led_count,
            mode_names: vec!["Direct".to_string()],
            active_mode: 0,
        }
    }

    /// Replace the mode list and the active mode index.
    pub fn with_modes(mut self, mode_names: &[&str], active_mode: i32) -> Self {
        self.mode_names = mode_names.iter().map(|s| s.to_string()).collect();
        self.active_mode = active_mode;
        self
    }

    /// Serialize this controller the way a real server would at
    /// `protocol_version`.
    fn encode(&self, protocol_version: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.device_type.to_le_bytes());
        put_string(&mut body, &self.name);
        if protocol_version >= 1 {
            put_string(&mut body, "Fake Vendor");
        }
        put_string(&mut body, "Fake controller");
        put_string(&mut body, "1.0");
        put_string(&mut body, "FAKE-0001");
        put_string(&mut body, "TCP: fake");

        body.extend_from_slice(&(self.mode_names.len() as u16).to_le_bytes());
        body.extend_from_slice(&self.active_mode.to_le_bytes());
        for name in &self.mode_names {
            put_mode(&mut body, name, protocol_version);
        }

        // One zone covering every LED.
        body.extend_from_slice(&1u16.to_le_bytes());
        put_string(&mut body, "Zone 0");
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&self.led_count.to_le_bytes()); // leds min
        body.extend_from_slice(&self.led_count.to_le_bytes()); // leds max
        body.extend_from_slice(&self.led_count.to_le_bytes()); // leds count
        body.extend_from_slice(&0u16.to_le_bytes()); // no matrix

        body.extend_from_slice(&(self.led_count as u16).to_le_bytes());
        for i in 0..self.led_count {
            put_string(&mut body, &format!("LED {i}"));
            body.extend_from_slice(&i.to_le_bytes());
        }

        // Current colors, all off.
        body.extend_from_slice(&(self.led_count as u16).to_le_bytes());
        for _ in 0..self.led_count {
            body.extend_from_slice(&[0u8; 4]);
        }

        let mut blob = Vec::with_capacity(body.len() + 4);
        blob.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        blob.extend_from_slice(&body);
        blob
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    let len = (s.len() + 1) as u16;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn put_mode(buf: &mut Vec<u8>, name: &str, protocol_version: u32) {
    put_string(buf, name);
    buf.extend_from_slice(&0i32.to_le_bytes()); // value
    buf.extend_from_slice(&0u32.to_le_bytes()); // flags
    buf.extend_from_slice(&0u32.to_le_bytes()); // speed min
    buf.extend_from_slice(&0u32.to_le_bytes()); // speed max
    if protocol_version >= 3 {
        buf.extend_from_slice(&0u32.to_le_bytes()); // brightness min
        buf.extend_from_slice(&100u32.to_le_bytes()); // brightness max
    }
    buf.extend_from_slice(&0u32.to_le_bytes()); // colors min
    buf.extend_from_slice(&0u32.to_le_bytes()); // colors max
    buf.extend_from_slice(&0u32.to_le_bytes()); // speed
    if protocol_version >= 3 {
        buf.extend_from_slice(&100u32.to_le_bytes()); // brightness
    }
    buf.extend_from_slice(&0u32.to_le_bytes()); // direction
    buf.extend_from_slice(&0u32.to_le_bytes()); // color mode
    buf.extend_from_slice(&0u16.to_le_bytes()); // color count
}

/// One recorded UpdateLeds write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLedsFrame {
    pub device_index: u32,
    pub colors: Vec<Color>,
}

struct HubShared {
    /// Protocol version the hub answers with; `None` simulates a pre-version
    /// server that never replies to the version request.
    version: Option<u32>,
    controllers: std::sync::RwLock<Vec<FakeController>>,
    client_names: std::sync::Mutex<Vec<String>>,
    update_leds: std::sync::Mutex<Vec<UpdateLedsFrame>>,
    custom_modes: std::sync::Mutex<Vec<u32>>,
    /// When set, enumeration requests go unanswered.
    mute: AtomicBool,
}

impl HubShared {
    /// Build the reply (if any) for one inbound packet, recording writes.
    fn respond(&self, header: &PacketHeader, payload: &[u8]) -> Option<Vec<u8>> {
        match header.packet_id {
            packet_id::REQUEST_PROTOCOL_VERSION => {
                let version = self.version?;
                Some(protocol::frame(
                    0,
                    packet_id::REQUEST_PROTOCOL_VERSION,
                    &version.to_le_bytes(),
                ))
            }
            packet_id::SET_CLIENT_NAME => {
                let bytes = payload.strip_suffix(&[0]).unwrap_or(payload);
                self.client_names
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(String::from_utf8_lossy(bytes).into_owned());
                None
            }
            packet_id::REQUEST_CONTROLLER_COUNT => {
                if self.mute.load(Ordering::SeqCst) {
                    return None;
                }
                let count = self
                    .controllers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .len() as u32;
                Some(protocol::frame(
                    0,
                    packet_id::REQUEST_CONTROLLER_COUNT,
                    &count.to_le_bytes(),
                ))
            }
            packet_id::REQUEST_CONTROLLER_DATA => {
                if self.mute.load(Ordering::SeqCst) {
                    return None;
                }
                // A real server serializes at the version both sides agreed
                // on: the minimum of its own and the one in the payload.
                let requested = if payload.len() >= 4 {
                    u32::from_le_bytes(payload[..4].try_into().unwrap())
                } else {
                    0
                };
                let blob_version = self.version.unwrap_or(0).min(requested);
                let controllers = self.controllers.read().unwrap_or_else(|e| e.into_inner());
                let controller = controllers.get(header.device_index as usize)?;
                Some(protocol::frame(
                    header.device_index,
                    packet_id::REQUEST_CONTROLLER_DATA,
                    &controller.encode(blob_version),
                ))
            }
            packet_id::UPDATE_LEDS => {
                self.update_leds
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(UpdateLedsFrame {
                        device_index: header.device_index,
                        colors: parse_update_leds(payload),
                    });
                None
            }
            packet_id::SET_CUSTOM_MODE => {
                self.custom_modes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(header.device_index);
                None
            }
            _ => None,
        }
    }
}

fn parse_update_leds(payload: &[u8]) -> Vec<Color> {
    if payload.len() < 6 {
        return Vec::new();
    }
    let count = u16::from_le_bytes(payload[4..6].try_into().unwrap()) as usize;
    let mut colors = Vec::with_capacity(count);
    for i in 0..count {
        let at = 6 + i * 4;
        if at + 4 > payload.len() {
            break;
        }
        colors.push(Color::new(payload[at], payload[at + 1], payload[at + 2]));
    }
    colors
}

/// An in-process fake OpenRGB SDK server.
///
/// Listens on an ephemeral loopback port; connect real clients to
/// [`addr`](FakeHub::addr). Accepts any number of connections (reconnection
/// tests need more than one over the hub's lifetime).
pub struct FakeHub {
    addr: SocketAddr,
    shared: Arc<HubShared>,
    /// Raw frames pushed to every live connection.
    push_tx: broadcast::Sender<Vec<u8>>,
    /// Closing signal for every live connection.
    close_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl FakeHub {
    /// Start a hub that reports `controllers` and speaks the current
    /// protocol version.
    pub async fn start(controllers: Vec<FakeController>) -> Self {
        Self::start_with_version(controllers, Some(CLIENT_PROTOCOL_VERSION)).await
    }

    /// Start a hub answering version requests with `version`; `None` means
    /// the hub stays silent on them, like servers from before the version
    /// handshake existed.
    pub async fn start_with_version(
        controllers: Vec<FakeController>,
        version: Option<u32>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake hub listener");
        let addr = listener.local_addr().expect("fake hub local addr");

        let shared = Arc::new(HubShared {
            version,
            controllers: std::sync::RwLock::new(controllers),
            client_names: std::sync::Mutex::new(Vec::new()),
            update_leds: std::sync::Mutex::new(Vec::new()),
            custom_modes: std::sync::Mutex::new(Vec::new()),
            mute: AtomicBool::new(false),
        });

        let (push_tx, _) = broadcast::channel(16);
        let (close_tx, _) = broadcast::channel(4);

        let accept_shared = Arc::clone(&shared);
        let accept_push = push_tx.clone();
        let accept_close = close_tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&accept_shared),
                    accept_push.subscribe(),
                    accept_close.subscribe(),
                ));
            }
        });

        Self {
            addr,
            shared,
            push_tx,
            close_tx,
            accept_task,
        }
    }

    /// `host:port` to hand to a client.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Replace the controller list. Pair with
    /// [`notify_device_list_changed`](FakeHub::notify_device_list_changed)
    /// to mimic a hot-plug.
    pub fn set_controllers(&self, controllers: Vec<FakeController>) {
        let mut guard = self
            .shared
            .controllers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *guard = controllers;
    }

    /// When muted, the hub ignores controller count and data requests.
    pub fn set_mute(&self, mute: bool) {
        self.shared.mute.store(mute, Ordering::SeqCst);
    }

    /// Push a DeviceListUpdated packet to every live connection.
    pub fn notify_device_list_changed(&self) {
        let _ = self
            .push_tx
            .send(protocol::frame(0, packet_id::DEVICE_LIST_UPDATED, &[]));
    }

    /// Sever every live connection without stopping the listener.
    pub fn drop_connections(&self) {
        let _ = self.close_tx.send(());
    }

    /// Client names announced so far, in arrival order.
    pub fn client_names(&self) -> Vec<String> {
        self.shared
            .client_names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// UpdateLeds writes recorded so far.
    pub fn update_leds_frames(&self) -> Vec<UpdateLedsFrame> {
        self.shared
            .update_leds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Device indices that received SetCustomMode, in arrival order.
    pub fn custom_mode_devices(&self) -> Vec<u32> {
        self.shared
            .custom_modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until at least one client name arrived.
    pub async fn wait_for_client_name(&self) {
        wait_until("a client name announcement", || {
            !self.client_names().is_empty()
        })
        .await;
    }

    /// Wait until at least `count` UpdateLeds writes arrived and return them.
    pub async fn wait_for_update_leds(&self, count: usize) -> Vec<UpdateLedsFrame> {
        wait_until("UpdateLeds writes", || {
            self.update_leds_frames().len() >= count
        })
        .await;
        self.update_leds_frames()
    }

    /// Wait until at least `count` SetCustomMode writes arrived and return
    /// the device indices.
    pub async fn wait_for_custom_mode(&self, count: usize) -> Vec<u32> {
        wait_until("SetCustomMode writes", || {
            self.custom_mode_devices().len() >= count
        })
        .await;
        self.custom_mode_devices()
    }
}

impl Drop for FakeHub {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Serve one client connection until it closes or the hub severs it.
async fn serve_connection(
    stream: TcpStream,
    shared: Arc<HubShared>,
    mut push_rx: broadcast::Receiver<Vec<u8>>,
    mut close_rx: broadcast::Receiver<()>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    // Same shape as the real client: reads happen in a side task because
    // read_exact is not cancellation-safe inside select.
    let (in_tx, mut in_rx) = mpsc::channel::<(PacketHeader, Vec<u8>)>(32);
    let reader = tokio::spawn(async move {
        loop {
            match protocol::read_packet(&mut read_half).await {
                Ok(packet) => {
                    if in_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        tokio::select! {
            inbound = in_rx.recv() => {
                match inbound {
                    Some((header, payload)) => {
                        if let Some(reply) = shared.respond(&header, &payload) {
                            if write_half.write_all(&reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break, // client went away
                }
            }
            pushed = push_rx.recv() => {
                match pushed {
                    Ok(frame) => {
                        if write_half.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = close_rx.recv() => break,
        }
    }

    reader.abort();
}
