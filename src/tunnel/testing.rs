//! In-memory host capabilities for tests

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::flow::{
    Connector, DatagramSocket, IpFamily, NetworkSettingsApplier, PacketFlow,
    TunnelNetworkSettings,
};
use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::protocol::{self, Body, ClientAuthRequest};

/// Client side of an in-memory datagram link
pub(crate) struct MockSocket {
    sent: mpsc::UnboundedSender<Vec<u8>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<Vec<u8>>>>>,
    closed: Arc<AtomicUsize>,
}

/// Server side of an in-memory datagram link
pub(crate) struct ServerEnd {
    /// Datagrams the client sent
    pub sent: mpsc::UnboundedReceiver<Vec<u8>>,
    inbox: mpsc::UnboundedSender<io::Result<Vec<Vec<u8>>>>,
    closed: Arc<AtomicUsize>,
}

pub(crate) fn mock_socket() -> (Arc<dyn DatagramSocket>, ServerEnd) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicUsize::new(0));
    let socket = MockSocket {
        sent: sent_tx,
        inbox: tokio::sync::Mutex::new(inbox_rx),
        closed: closed.clone(),
    };
    let server = ServerEnd {
        sent: sent_rx,
        inbox: inbox_tx,
        closed,
    };
    (Arc::new(socket), server)
}

impl ServerEnd {
    /// Wait for the client's authentication request
    pub async fn expect_auth(&mut self, cipher: &Cipher) -> ClientAuthRequest {
        let datagram = self.sent.recv().await.expect("client closed the link");
        protocol::decode(&datagram, cipher).expect("first datagram should be an auth request")
    }

    pub fn reply<B: Body>(&self, body: &B, cipher: &Cipher) {
        self.deliver(vec![protocol::encode(body, cipher).unwrap()]);
    }

    pub fn deliver(&self, datagrams: Vec<Vec<u8>>) {
        let _ = self.inbox.send(Ok(datagrams));
    }

    pub fn fail(&self, kind: io::ErrorKind) {
        let _ = self.inbox.send(Err(io::Error::new(kind, "injected receive failure")));
    }

    /// How many times the client side has been dropped
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatagramSocket for MockSocket {
    async fn send_datagrams(&self, datagrams: &[Vec<u8>]) -> io::Result<()> {
        for datagram in datagrams {
            let _ = self.sent.send(datagram.clone());
        }
        Ok(())
    }

    async fn recv_datagrams(&self) -> io::Result<Vec<Vec<u8>>> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    fn peer(&self) -> String {
        "mock-server".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectMode {
    Ready,
    Fail,
    Hang,
}

pub(crate) struct MockConnector {
    mode: Mutex<ConnectMode>,
    servers: mpsc::UnboundedSender<ServerEnd>,
    opened: Mutex<Vec<String>>,
}

pub(crate) fn mock_connector(
    mode: ConnectMode,
) -> (Arc<MockConnector>, mpsc::UnboundedReceiver<ServerEnd>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = MockConnector {
        mode: Mutex::new(mode),
        servers: tx,
        opened: Mutex::new(Vec::new()),
    };
    (Arc::new(connector), rx)
}

impl MockConnector {
    pub fn set_mode(&self, mode: ConnectMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Endpoints `open` was called with
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, hostname: &str, port: &str) -> io::Result<Arc<dyn DatagramSocket>> {
        self.opened.lock().unwrap().push(format!("{}:{}", hostname, port));
        let mode = *self.mode.lock().unwrap();
        match mode {
            ConnectMode::Ready => {
                let (socket, server) = mock_socket();
                let _ = self.servers.send(server);
                Ok(socket)
            }
            ConnectMode::Fail => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )),
            ConnectMode::Hang => std::future::pending().await,
        }
    }
}

/// In-memory virtual interface
pub(crate) struct MockFlow {
    outbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<Vec<u8>>>>>,
    delivered: mpsc::UnboundedSender<(Vec<u8>, IpFamily)>,
    stalled: Arc<AtomicBool>,
}

/// Host side of an in-memory virtual interface
pub(crate) struct HostEnd {
    outbound: mpsc::UnboundedSender<io::Result<Vec<Vec<u8>>>>,
    /// Packets the tunnel delivered to the host
    pub delivered: mpsc::UnboundedReceiver<(Vec<u8>, IpFamily)>,
    stalled: Arc<AtomicBool>,
}

pub(crate) fn mock_flow() -> (Arc<dyn PacketFlow>, HostEnd) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
    let stalled = Arc::new(AtomicBool::new(false));
    let flow = MockFlow {
        outbound: tokio::sync::Mutex::new(outbound_rx),
        delivered: delivered_tx,
        stalled: stalled.clone(),
    };
    let host = HostEnd {
        outbound: outbound_tx,
        delivered: delivered_rx,
        stalled,
    };
    (Arc::new(flow), host)
}

impl HostEnd {
    /// Queue a packet batch for the tunnel to read
    pub fn send(&self, batch: Vec<Vec<u8>>) {
        let _ = self.outbound.send(Ok(batch));
    }

    /// Make the next interface read fail
    pub fn fail(&self, kind: io::ErrorKind) {
        let _ = self.outbound.send(Err(io::Error::new(kind, "injected read failure")));
    }

    /// Make every later interface write hang
    pub fn stall_writes(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PacketFlow for MockFlow {
    async fn read_packets(&self) -> io::Result<Vec<Vec<u8>>> {
        let mut outbound = self.outbound.lock().await;
        match outbound.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn write_packets(&self, packets: Vec<(Vec<u8>, IpFamily)>) -> io::Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        for packet in packets {
            let _ = self.delivered.send(packet);
        }
        Ok(())
    }
}

/// Records applied settings instead of touching the host
#[derive(Default)]
pub(crate) struct MockSettings {
    applied: Mutex<Vec<TunnelNetworkSettings>>,
    fail: AtomicBool,
    hang: AtomicBool,
}

impl MockSettings {
    pub fn failing() -> Self {
        let settings = Self::default();
        settings.fail.store(true, Ordering::SeqCst);
        settings
    }

    /// Never finishes applying
    pub fn hanging() -> Self {
        let settings = Self::default();
        settings.hang.store(true, Ordering::SeqCst);
        settings
    }

    pub fn applied(&self) -> Vec<TunnelNetworkSettings> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkSettingsApplier for MockSettings {
    async fn apply(&self, settings: &TunnelNetworkSettings) -> Result<()> {
        if self.hang.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::NetworkSettings("interface is gone".into()));
        }
        self.applied.lock().unwrap().push(settings.clone());
        Ok(())
    }
}
