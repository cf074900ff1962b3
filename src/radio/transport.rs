//! Transport provider: opens a duplex byte stream to a radio.
//!
//! A [`Transport`] is a pair of channels. Writing to `sink` sends bytes to the radio;
//! `source` yields whatever the radio sends and ends when the link goes away, which
//! the device layer reports as a native disconnect.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::DeviceError;

/// Default TCP port of the Meshtastic stream API.
pub const DEFAULT_TCP_PORT: u16 = 4403;
pub const DEFAULT_SERIAL_BAUD: u32 = 115_200;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_DEPTH: usize = 64;

/// The physical link to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Short-range wireless (Bluetooth LE).
    Ble,
    /// Wired serial / USB.
    Serial,
    /// Network socket (TCP).
    Tcp,
}

impl TransportKind {
    /// Silence after which the session is reported stale.
    pub fn stale_after(self) -> Duration {
        match self {
            TransportKind::Ble => Duration::from_secs(90),
            TransportKind::Serial => Duration::from_secs(120),
            TransportKind::Tcp => Duration::from_secs(60),
        }
    }

    /// Silence after which the connection is treated as lost.
    pub fn dead_after(self) -> Duration {
        match self {
            TransportKind::Ble => Duration::from_secs(180),
            TransportKind::Serial => Duration::from_secs(300),
            TransportKind::Tcp => Duration::from_secs(120),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Ble => "ble",
            TransportKind::Serial => "serial",
            TransportKind::Tcp => "tcp",
        })
    }
}

/// Aborts the transport's I/O tasks when closed or dropped.
pub struct TransportCloser {
    tasks: Vec<JoinHandle<()>>,
}

impl TransportCloser {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    pub fn close(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TransportCloser {
    fn drop(&mut self) {
        self.abort_all();
    }
}

pub struct Transport {
    pub sink: mpsc::Sender<Bytes>,
    pub source: mpsc::Receiver<Bytes>,
    pub closer: Option<TransportCloser>,
}

impl Transport {
    /// In-memory transport; returns the far ends (`to_radio` receiver, `from_radio` sender).
    pub fn pair() -> (Self, mpsc::Receiver<Bytes>, mpsc::Sender<Bytes>) {
        let (sink, to_radio) = mpsc::channel(CHANNEL_DEPTH);
        let (from_radio, source) = mpsc::channel(CHANNEL_DEPTH);
        (
            Self {
                sink,
                source,
                closer: None,
            },
            to_radio,
            from_radio,
        )
    }
}

#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn open(&self, kind: TransportKind, address: Option<&str>)
        -> Result<Transport, DeviceError>;
}

/// Opens TCP sockets and (with the `serial` feature) serial ports.
#[derive(Debug, Default, Clone)]
pub struct DefaultTransportProvider {
    pub baud_rate: Option<u32>,
}

#[async_trait]
impl TransportProvider for DefaultTransportProvider {
    async fn open(
        &self,
        kind: TransportKind,
        address: Option<&str>,
    ) -> Result<Transport, DeviceError> {
        match kind {
            TransportKind::Tcp => {
                let addr = address.ok_or_else(|| {
                    DeviceError::Transport("tcp transport needs a host address".into())
                })?;
                open_tcp(addr).await
            }
            TransportKind::Serial => {
                let path = address.ok_or_else(|| {
                    DeviceError::Transport("serial transport needs a port path".into())
                })?;
                open_serial(path, self.baud_rate.unwrap_or(DEFAULT_SERIAL_BAUD)).await
            }
            TransportKind::Ble => Err(DeviceError::Unsupported(
                "ble transport has no built-in backend; supply a DeviceFactory",
            )),
        }
    }
}

fn with_default_port(addr: &str) -> String {
    if addr.starts_with('[') {
        if addr.contains("]:") {
            return addr.to_string();
        }
        return format!("{}:{}", addr, DEFAULT_TCP_PORT);
    }
    match addr.matches(':').count() {
        0 => format!("{}:{}", addr, DEFAULT_TCP_PORT),
        1 => addr.to_string(),
        // Bare IPv6 literal.
        _ => format!("[{}]:{}", addr, DEFAULT_TCP_PORT),
    }
}

async fn open_tcp(addr: &str) -> Result<Transport, DeviceError> {
    let target = with_default_port(addr);
    info!("Connecting to radio at tcp://{}", target);
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target))
        .await
        .map_err(|_| DeviceError::Transport(format!("connect to {} timed out", target)))?
        .map_err(|e| DeviceError::Transport(format!("connect to {}: {}", target, e)))?;
    let _ = stream.set_nodelay(true);
    let (mut rd, mut wr) = stream.into_split();

    let (sink, mut outbound) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let (inbound, source) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);

    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            match rd.read(&mut buf).await {
                Ok(0) => {
                    debug!("tcp peer closed the connection");
                    break;
                }
                Ok(n) => {
                    trace!("tcp read {} bytes", n);
                    if inbound.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("tcp read error: {}", e);
                    break;
                }
            }
        }
    });
    let writer = tokio::spawn(async move {
        while let Some(chunk) = outbound.recv().await {
            if let Err(e) = wr.write_all(&chunk).await {
                debug!("tcp write error: {}", e);
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    Ok(Transport {
        sink,
        source,
        closer: Some(TransportCloser::new(vec![reader, writer])),
    })
}

#[cfg(feature = "serial")]
async fn open_serial(path: &str, baud_rate: u32) -> Result<Transport, DeviceError> {
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    info!("Opening radio serial port {} at {} baud", path, baud_rate);
    let mut builder = serialport::new(path, baud_rate).timeout(Duration::from_millis(200));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder
        .open()
        .map_err(|e| DeviceError::Transport(format!("open serial port {}: {}", path, e)))?;
    // ESP32 boards often need DTR/RTS asserted to start talking.
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    let mut write_port = port
        .try_clone()
        .map_err(|e| DeviceError::Transport(format!("clone serial port {}: {}", path, e)))?;

    let (sink, mut outbound) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let (inbound, source) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let stop = Arc::new(AtomicBool::new(false));

    let reader_stop = stop.clone();
    let reader = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 1024];
        while !reader_stop.load(Ordering::Relaxed) && !inbound.is_closed() {
            match port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    if inbound.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    debug!("serial read error: {}", e);
                    break;
                }
            }
        }
    });
    let writer = tokio::task::spawn_blocking(move || {
        while let Some(chunk) = outbound.blocking_recv() {
            if let Err(e) = write_port.write_all(&chunk).and_then(|_| write_port.flush()) {
                debug!("serial write error: {}", e);
                break;
            }
        }
    });
    // Blocking tasks ignore abort; the stop flag ends the reader and dropping the sink
    // ends the writer.
    let stopper = tokio::spawn(async move {
        let _guard = StopOnDrop(stop);
        std::future::pending::<()>().await;
    });

    Ok(Transport {
        sink,
        source,
        closer: Some(TransportCloser::new(vec![stopper, reader, writer])),
    })
}

#[cfg(feature = "serial")]
struct StopOnDrop(std::sync::Arc<std::sync::atomic::AtomicBool>);

#[cfg(feature = "serial")]
impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(not(feature = "serial"))]
async fn open_serial(_path: &str, _baud_rate: u32) -> Result<Transport, DeviceError> {
    Err(DeviceError::Unsupported(
        "serial support not compiled in (enable the `serial` feature)",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_per_kind() {
        assert_eq!(TransportKind::Ble.stale_after(), Duration::from_secs(90));
        assert_eq!(TransportKind::Ble.dead_after(), Duration::from_secs(180));
        assert_eq!(TransportKind::Serial.stale_after(), Duration::from_secs(120));
        assert_eq!(TransportKind::Serial.dead_after(), Duration::from_secs(300));
        assert_eq!(TransportKind::Tcp.stale_after(), Duration::from_secs(60));
        assert_eq!(TransportKind::Tcp.dead_after(), Duration::from_secs(120));
    }

    #[test]
    fn tcp_address_gets_default_port() {
        assert_eq!(with_default_port("192.168.1.20"), "192.168.1.20:4403");
        assert_eq!(with_default_port("radio.local:5000"), "radio.local:5000");
        assert_eq!(with_default_port("[fe80::1]:4403"), "[fe80::1]:4403");
        assert_eq!(with_default_port("fe80::1"), "[fe80::1]:4403");
    }

    #[tokio::test]
    async fn ble_has_no_builtin_backend() {
        let provider = DefaultTransportProvider::default();
        let err = provider.open(TransportKind::Ble, None).await.err();
        assert!(matches!(err, Some(DeviceError::Unsupported(_))));
    }

    #[tokio::test]
    async fn tcp_round_trip_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });
        let provider = DefaultTransportProvider::default();
        let mut t = provider.open(TransportKind::Tcp, Some(&addr)).await.unwrap();
        t.sink.send(Bytes::from_static(b"ping")).await.unwrap();
        let mut got = Vec::new();
        while got.len() < 4 {
            got.extend_from_slice(&t.source.recv().await.unwrap());
        }
        assert_eq!(got, b"ping");
        server.await.unwrap();
        // Peer closed: the source ends.
        assert!(t.source.recv().await.is_none());
    }
}
