//! Test doubles for the device seam plus a few fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use meshlink::ingest::Ingestor;
use meshlink::model::MeshModel;
use meshlink::radio::{
    ConnectionManager, DeviceEvent, DeviceFactory, DeviceStatus, MeshDevice, PacketEvent,
    PacketPayload, RadioSettings, TextRequest, TransportKind,
};
use meshlink::DeviceError;

pub const LOCAL_NODE: u32 = 0x0a0b_0c0d;

/// Scripted device: records every call and answers `configure` with an identity
/// and a `Configured` status when `auto_configure` is set.
pub struct MockDevice {
    events: broadcast::Sender<DeviceEvent>,
    pub calls: Mutex<Vec<&'static str>>,
    pub sent: Mutex<Vec<TextRequest>>,
    pub fail_heartbeat: AtomicBool,
    pub heartbeats: AtomicUsize,
    pub closed: AtomicBool,
    pub heartbeat_interval: Mutex<Option<Duration>>,
    auto_configure: bool,
    next_id: AtomicU32,
}

impl MockDevice {
    pub fn new(auto_configure: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            fail_heartbeat: AtomicBool::new(false),
            heartbeats: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            heartbeat_interval: Mutex::new(None),
            auto_configure,
            next_id: AtomicU32::new(1000),
        })
    }

    pub fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MeshDevice for MockDevice {
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.record("subscribe");
        self.events.subscribe()
    }

    async fn configure(&self) -> Result<(), DeviceError> {
        self.record("configure");
        if self.auto_configure {
            self.emit(DeviceEvent::Status(DeviceStatus::Configuring));
            self.emit(DeviceEvent::MyNodeInfo {
                node_num: LOCAL_NODE,
            });
            self.emit(DeviceEvent::Status(DeviceStatus::Configured));
        }
        Ok(())
    }

    async fn send_text(&self, request: TextRequest) -> Result<u32, DeviceError> {
        self.record("send_text");
        self.sent.lock().unwrap().push(request);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn request_position(
        &self,
        _destination: meshlink::radio::Destination,
    ) -> Result<(), DeviceError> {
        self.record("request_position");
        Ok(())
    }

    async fn trace_route(&self, _node: u32) -> Result<(), DeviceError> {
        self.record("trace_route");
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), DeviceError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeat.load(Ordering::SeqCst) {
            Err(DeviceError::Write("link gone".into()))
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        self.record("close");
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn set_heartbeat_interval(&self, interval: Duration) -> Result<(), DeviceError> {
        self.record("set_heartbeat_interval");
        *self.heartbeat_interval.lock().unwrap() = Some(interval);
        Ok(())
    }
}

/// Hands out fresh [`MockDevice`]s and records when each open happened.
pub struct MockFactory {
    pub devices: Mutex<Vec<Arc<MockDevice>>>,
    pub open_times: Mutex<Vec<Instant>>,
    pub resumes: AtomicUsize,
    pub fail_opens: AtomicBool,
    auto_configure: bool,
}

impl MockFactory {
    pub fn new(auto_configure: bool) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(Vec::new()),
            open_times: Mutex::new(Vec::new()),
            resumes: AtomicUsize::new(0),
            fail_opens: AtomicBool::new(false),
            auto_configure,
        })
    }

    pub fn latest(&self) -> Arc<MockDevice> {
        self.devices.lock().unwrap().last().cloned().expect("no device opened")
    }

    pub fn open_count(&self) -> usize {
        self.open_times.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceFactory for MockFactory {
    async fn open(
        &self,
        _kind: TransportKind,
        _address: Option<&str>,
    ) -> Result<Arc<dyn MeshDevice>, DeviceError> {
        self.open_times.lock().unwrap().push(Instant::now());
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(DeviceError::Transport("connection refused".into()));
        }
        let device = MockDevice::new(self.auto_configure);
        self.devices.lock().unwrap().push(device.clone());
        Ok(device)
    }

    async fn resume(
        &self,
        kind: TransportKind,
        address: Option<&str>,
    ) -> Result<Arc<dyn MeshDevice>, DeviceError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.open(kind, address).await
    }
}

pub fn manager(factory: Arc<MockFactory>) -> (ConnectionManager, Arc<MeshModel>) {
    let model = Arc::new(MeshModel::new());
    let ingest = Ingestor::new(model.clone());
    let manager = ConnectionManager::new(factory, ingest, RadioSettings::default());
    (manager, model)
}

/// Let spawned tasks run. With a paused clock this also advances time by `ms`.
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub fn text_packet(id: u32, from: u32, text: &str) -> DeviceEvent {
    DeviceEvent::Packet(Box::new(PacketEvent {
        id,
        from,
        to: meshlink::protobuf::BROADCAST_ADDR,
        channel: 0,
        rx_time: None,
        snr: Some(8.0),
        rssi: Some(-70),
        hop_start: Some(3),
        hop_limit: Some(3),
        via_mqtt: false,
        payload: PacketPayload::Text {
            text: text.to_string(),
            reply_id: None,
            emoji: None,
        },
    }))
}
