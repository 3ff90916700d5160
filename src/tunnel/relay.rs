//! Packet Relay
//!
//! Pumps packets between the virtual interface and the datagram socket
//! once a session is established. Per-packet failures are logged and the
//! packet dropped; they never end the relay. Only a failing interface read
//! ends the outbound half, and the session is told about it.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::flow::{DatagramSocket, IpFamily, PacketFlow};
use crate::crypto::Cipher;
use crate::protocol::{self, Data, PacketCode};

/// Traffic counters for one session
#[derive(Debug, Default)]
pub struct RelayStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    outbound_dropped: AtomicU64,
    inbound_dropped: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub outbound_dropped: u64,
    pub inbound_dropped: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.packets_sent,
            &self.bytes_sent,
            &self.packets_received,
            &self.bytes_received,
            &self.outbound_dropped,
            &self.inbound_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Seal outbound packets as `Data` datagrams, skipping any that fail
pub fn encode_outbound(packets: &[Vec<u8>], cipher: &Cipher, stats: &RelayStats) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::with_capacity(packets.len());
    for packet in packets {
        match protocol::encode_data(packet, cipher) {
            Ok(datagram) => {
                stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                stats.bytes_sent.fetch_add(packet.len() as u64, Ordering::Relaxed);
                datagrams.push(datagram);
            }
            Err(e) => {
                stats.outbound_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping outbound packet ({} bytes): {}", packet.len(), e);
            }
        }
    }
    datagrams
}

/// Open inbound datagrams, keeping only valid `Data` packets
pub fn decode_inbound(
    datagrams: Vec<Vec<u8>>,
    cipher: &Cipher,
    stats: &RelayStats,
) -> Vec<(Vec<u8>, IpFamily)> {
    let mut packets = Vec::with_capacity(datagrams.len());
    for datagram in datagrams {
        match PacketCode::from_datagram(&datagram) {
            Ok(PacketCode::Data) => {}
            Ok(code) => {
                debug!("Ignoring {} datagram on established session", code.type_name());
                stats.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Err(e) => {
                debug!("Dropping inbound datagram ({} bytes): {}", datagram.len(), e);
                stats.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        match protocol::decode::<Data>(&datagram, cipher) {
            Ok(data) => {
                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                stats.bytes_received.fetch_add(data.payload.len() as u64, Ordering::Relaxed);
                let family = IpFamily::classify(&data.payload);
                packets.push((data.payload, family));
            }
            Err(e) => {
                warn!("Dropping inbound data datagram: {}", e);
                stats.inbound_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    packets
}

/// Batches of decoded packets waiting for the interface
pub type InboundQueue = mpsc::Sender<Vec<(Vec<u8>, IpFamily)>>;

/// Decode a received batch and queue it for the interface writer
///
/// Never waits: when the writer has fallen behind by a full queue the batch
/// is dropped and counted.
pub fn queue_inbound(
    datagrams: Vec<Vec<u8>>,
    cipher: &Cipher,
    queue: &InboundQueue,
    stats: &RelayStats,
) {
    let packets = decode_inbound(datagrams, cipher, stats);
    if packets.is_empty() {
        return;
    }
    let count = packets.len() as u64;
    if let Err(e) = queue.try_send(packets) {
        stats.inbound_dropped.fetch_add(count, Ordering::Relaxed);
        debug!("Interface writer is behind, dropping {} packet(s): {}", count, e);
    }
}

/// Inbound half of the relay: write queued batches to the interface
pub async fn run_inbound_writer(
    flow: Arc<dyn PacketFlow>,
    mut queue: mpsc::Receiver<Vec<(Vec<u8>, IpFamily)>>,
    cancel: CancellationToken,
) {
    loop {
        let packets = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = queue.recv() => match batch {
                Some(packets) => packets,
                None => break,
            },
        };
        let count = packets.len();
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = flow.write_packets(packets) => {
                if let Err(e) = result {
                    warn!("Failed to deliver {} packet(s) to the interface: {}", count, e);
                }
            }
        }
    }
    debug!("Inbound writer stopped");
}

/// Interface read errors worth another read
fn is_transient_read(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

/// Outbound half of the relay
///
/// Each iteration waits for one batch from the interface, seals it and
/// submits it as one socket write; the next read is only issued after
/// that. Returns `Ok` once `cancel` fires and the read error otherwise.
pub async fn run_outbound(
    flow: Arc<dyn PacketFlow>,
    socket: Arc<dyn DatagramSocket>,
    cipher: Cipher,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
) -> io::Result<()> {
    info!("Outbound relay to {} started", socket.peer());
    loop {
        let packets = tokio::select! {
            _ = cancel.cancelled() => break,
            result = flow.read_packets() => match result {
                Ok(packets) => packets,
                Err(e) if is_transient_read(&e) => {
                    debug!("Retrying interface read: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("Reading from the virtual interface failed: {}", e);
                    return Err(e);
                }
            },
        };

        let datagrams = encode_outbound(&packets, &cipher, &stats);
        if datagrams.is_empty() {
            continue;
        }
        if let Err(e) = socket.send_datagrams(&datagrams).await {
            debug!("Send of {} datagram(s) failed: {}", datagrams.len(), e);
        }
    }
    debug!("Outbound relay to {} stopped", socket.peer());
    Ok(())
}
