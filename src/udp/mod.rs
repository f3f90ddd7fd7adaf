//! UDP transport engine for the Semtech packet-forwarder protocol.
//!
//! Owns the socket and drives the protocol: inbound datagrams are decoded,
//! acknowledged, and turned into normalized events; downlinks submitted via
//! [`Backend::send_downlink`] are routed to the gateway's last-known
//! address. All outbound datagrams funnel through one serialized writer so
//! concurrent handlers never interleave on the socket.

pub mod packets;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{
    DownlinkFrame, DownlinkFrameItem, DownlinkTiming, DownlinkTxAck, DownlinkTxAckItem, GatewayId,
    GatewayStatsEvent, Location, Modulation, UplinkFrame, UplinkRxInfo, UplinkTxInfo,
    TXACK_STATUS_OK,
};
use packets::{
    CodecError, CrcStatus, DataRate, Packet, PullRespPayload, PushDataPayload, Rxpk, Stat, Txpk,
};
use registry::{Callbacks, Registry, Session};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown gateway: {0}")]
    UnknownGateway(GatewayId),
    #[error("downlink frame has no items")]
    EmptyDownlink,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("backend is shutting down")]
    Closed,
}

/// Receivers for the three normalized event streams. Delivery applies
/// backpressure per datagram handler: a slow consumer stalls that handler's
/// event emission, never packet reception or acks.
pub struct Events {
    pub uplinks: mpsc::Receiver<UplinkFrame>,
    pub stats: mpsc::Receiver<GatewayStatsEvent>,
    pub tx_acks: mpsc::Receiver<DownlinkTxAck>,
}

/// State shared by the receive loop and the per-datagram handlers
struct Shared {
    registry: Registry,
    writer_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    uplink_tx: mpsc::Sender<UplinkFrame>,
    stats_tx: mpsc::Sender<GatewayStatsEvent>,
    txack_tx: mpsc::Sender<DownlinkTxAck>,
    skip_crc_check: bool,
}

/// Handle to a running transport engine
pub struct Backend {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Backend {
    /// Bind the socket and launch the receive loop, the serialized writer
    /// and the periodic registry sweep.
    pub async fn start(config: &Config, callbacks: Callbacks) -> anyhow::Result<(Self, Events)> {
        let socket = UdpSocket::bind(&config.udp.bind).await?;
        let local_addr = socket.local_addr()?;
        info!("UDP server listening on {}", local_addr);
        let socket = Arc::new(socket);

        let (writer_tx, writer_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(64);
        let (uplink_tx, uplinks) = mpsc::channel(256);
        let (stats_tx, stats) = mpsc::channel(16);
        let (txack_tx, tx_acks) = mpsc::channel(64);

        let registry = Registry::new(
            Duration::from_secs(config.udp.gateway_retention_secs),
            callbacks,
        );
        let shared = Arc::new(Shared {
            registry,
            writer_tx,
            uplink_tx,
            stats_tx,
            txack_tx,
            skip_crc_check: config.udp.skip_crc_check,
        });

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(write_loop(socket.clone(), writer_rx));
        tracker.spawn(receive_loop(
            socket,
            shared.clone(),
            shutdown.clone(),
            tracker.clone(),
            config.udp.max_inflight_datagrams,
        ));
        tracker.spawn(sweep_loop(
            shared.clone(),
            shutdown.clone(),
            Duration::from_secs(config.udp.cleanup_interval_secs),
        ));

        let backend = Backend {
            shared,
            local_addr,
            shutdown,
            tracker,
        };
        let events = Events {
            uplinks,
            stats,
            tx_acks,
        };
        Ok((backend, events))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves once the engine has terminated. [`Backend::stop`] consumes
    /// the handle, so if this resolves while the caller still holds one, the
    /// engine died on its own (an unrecoverable socket read failure).
    /// Embedders select on this alongside their own shutdown signal.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Queue a downlink for the gateway's last-known address. Returns once
    /// the datagram is queued on the writer; delivery confirmation, if any,
    /// arrives later as a tx-ack event. The wire packet carries exactly one
    /// transmit request, taken from the frame's first item.
    pub async fn send_downlink(&self, frame: &DownlinkFrame) -> Result<(), BackendError> {
        // A cancelled token means the engine terminated (fatal read failure
        // or a stop in progress); refuse to queue onto a dead socket.
        if self.shutdown.is_cancelled() {
            return Err(BackendError::Closed);
        }
        let session = self
            .shared
            .registry
            .get(frame.gateway_id)
            .map_err(|_| BackendError::UnknownGateway(frame.gateway_id))?;
        let item = frame.items.first().ok_or(BackendError::EmptyDownlink)?;
        if frame.items.len() > 1 {
            warn!(
                "Downlink 0x{:04x} for gateway {} carries {} items, only the first is transmitted",
                frame.downlink_id,
                frame.gateway_id,
                frame.items.len()
            );
        }

        let packet = Packet::PullResp {
            version: session.version,
            token: frame.downlink_id,
            payload: PullRespPayload {
                txpk: downlink_txpk(item),
            },
        };
        let bytes = packet.encode()?;

        debug!(
            "Queueing PULL_RESP for gateway {} at {} (token: 0x{:04x})",
            frame.gateway_id, session.addr, frame.downlink_id
        );
        self.shared
            .writer_tx
            .send((bytes, session.addr))
            .await
            .map_err(|_| BackendError::Closed)
    }

    /// Cooperative shutdown: stop accepting datagrams, let every dispatched
    /// handler finish, drain the writer, then return.
    pub async fn stop(self) {
        info!("Stopping UDP server");
        let Backend {
            shared,
            shutdown,
            tracker,
            ..
        } = self;
        shutdown.cancel();
        // Dropping our handle closes the writer queue once all in-flight
        // handlers have released theirs.
        drop(shared);
        tracker.close();
        tracker.wait().await;
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    max_inflight: usize,
) {
    let semaphore = Arc::new(Semaphore::new(max_inflight.max(1)));
    let mut buf = vec![0u8; 65535];

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    // Read failure outside shutdown is unrecoverable.
                    // Cancelling the token resolves `Backend::closed` and
                    // makes further `send_downlink` calls fail.
                    error!("Socket read failed, terminating engine: {}", e);
                    shutdown.cancel();
                    break;
                }
            },
        };
        debug!("Received {} bytes from {}", len, src);
        let datagram = buf[..len].to_vec();

        // Admission control: hold reception until an in-flight slot frees
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let shared = shared.clone();
        tracker.spawn(async move {
            let _permit = permit;
            handle_datagram(shared, datagram, src).await;
        });
    }
    debug!("Receive loop stopped");
}

async fn write_loop(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>) {
    while let Some((bytes, addr)) = rx.recv().await {
        if let Err(e) = socket.send_to(&bytes, addr).await {
            error!("Socket write to {} failed, terminating write loop: {}", addr, e);
            break;
        }
    }
    debug!("Write loop stopped");
}

async fn sweep_loop(shared: Arc<Shared>, shutdown: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.registry.sweep() {
                    error!("Registry sweep failed: {}", e);
                }
            }
        }
    }
    debug!("Sweep loop stopped");
}

async fn handle_datagram(shared: Arc<Shared>, data: Vec<u8>, src: SocketAddr) {
    let packet = match Packet::decode(&data) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Dropping datagram from {}: {}", src, e);
            return;
        }
    };

    match packet {
        Packet::PullData {
            version,
            token,
            gateway_id,
        } => {
            debug!(
                "PULL_DATA from gateway {} at {} (token: 0x{:04x})",
                gateway_id, src, token
            );
            let session = Session {
                addr: src,
                version,
                last_seen: Instant::now(),
            };
            if let Err(e) = shared.registry.set(gateway_id, session) {
                // Session not committed; withholding the ack makes the
                // gateway retry its probe.
                error!("Failed to register gateway {}: {}", gateway_id, e);
                return;
            }
            enqueue(&shared, Packet::PullAck { version, token }, src).await;
        }
        Packet::PushData {
            version,
            token,
            gateway_id,
            payload,
        } => {
            info!(
                "PUSH_DATA from gateway {} (token: 0x{:04x}, rxpk: {})",
                gateway_id,
                token,
                payload.rxpk.len()
            );
            // Ack before event delivery so the gateway never waits on
            // downstream consumers.
            enqueue(&shared, Packet::PushAck { version, token }, src).await;
            handle_push_payload(&shared, gateway_id, token, payload).await;
        }
        Packet::TxAck {
            token,
            gateway_id,
            error,
            ..
        } => {
            debug!(
                "TX_ACK from gateway {} (token: 0x{:04x}): {:?}",
                gateway_id, token, error
            );
            let status = error.unwrap_or_else(|| TXACK_STATUS_OK.to_string());
            let ack = DownlinkTxAck {
                gateway_id,
                downlink_id: token,
                items: vec![DownlinkTxAckItem { status }],
            };
            if shared.txack_tx.send(ack).await.is_err() {
                debug!("Tx-ack consumer gone, dropping event");
            }
        }
        // Server-role packets have no business arriving on our socket
        Packet::PushAck { token, .. } | Packet::PullAck { token, .. } => {
            warn!(
                "Ignoring unexpected ack from {} (token: 0x{:04x})",
                src, token
            );
        }
        Packet::PullResp { token, .. } => {
            warn!(
                "Ignoring unexpected PULL_RESP from {} (token: 0x{:04x})",
                src, token
            );
        }
    }
}

async fn handle_push_payload(
    shared: &Shared,
    gateway_id: GatewayId,
    token: u16,
    payload: PushDataPayload,
) {
    if let Some(stat) = &payload.stat {
        let event = stats_event(gateway_id, stat);
        if shared.stats_tx.send(event).await.is_err() {
            debug!("Stats consumer gone, dropping event");
        }
    }

    for rxpk in &payload.rxpk {
        if !shared.skip_crc_check && rxpk.stat != CrcStatus::Ok {
            // Per-record skip: sibling records in the batch still go through
            warn!(
                "Discarding rxpk with invalid CRC from gateway {} (freq: {} MHz)",
                gateway_id, rxpk.freq
            );
            continue;
        }
        match uplink_frames(gateway_id, token, rxpk) {
            Ok(frames) => {
                for frame in frames {
                    if shared.uplink_tx.send(frame).await.is_err() {
                        debug!("Uplink consumer gone, dropping event");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to convert rxpk from gateway {}: {}", gateway_id, e);
            }
        }
    }
}

/// Encode and queue an outbound packet on the serialized writer
async fn enqueue(shared: &Shared, packet: Packet, addr: SocketAddr) {
    match packet.encode() {
        Ok(bytes) => {
            if shared.writer_tx.send((bytes, addr)).await.is_err() {
                debug!("Writer closed, dropping outbound packet for {}", addr);
            }
        }
        Err(e) => {
            error!("Failed to encode outbound packet for {}: {}", addr, e);
        }
    }
}

/// Expand one wire rxpk record into normalized uplinks: one per antenna
/// signal report, or exactly one from the legacy top-level fields.
fn uplink_frames(
    gateway_id: GatewayId,
    token: u16,
    rxpk: &Rxpk,
) -> anyhow::Result<Vec<UplinkFrame>> {
    let phy_payload = base64::engine::general_purpose::STANDARD
        .decode(&rxpk.data)
        .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))?;

    let tx_info = UplinkTxInfo {
        frequency: (rxpk.freq * 1_000_000.0).round() as u32,
        modulation: rxpk_modulation(rxpk),
    };
    let rx_info = UplinkRxInfo {
        gateway_id,
        uplink_token: token,
        time: rxpk.time.0,
        time_since_gps_epoch: rxpk.tmms.map(chrono::Duration::milliseconds),
        timestamp: rxpk.tmst,
        rssi: rxpk.rssi as i32,
        snr: rxpk.lsnr,
        channel: rxpk.chan,
        rf_chain: rxpk.rfch,
        board: rxpk.brd,
        antenna: 0,
        crc_valid: rxpk.stat == CrcStatus::Ok,
    };

    if rxpk.rsig.is_empty() {
        return Ok(vec![UplinkFrame {
            phy_payload,
            tx_info,
            rx_info,
        }]);
    }

    Ok(rxpk
        .rsig
        .iter()
        .map(|rsig| {
            let mut rx_info = rx_info.clone();
            rx_info.antenna = rsig.ant;
            rx_info.channel = rsig.chan;
            rx_info.rssi = rsig.rssic as i32;
            rx_info.snr = rsig.lsnr;
            UplinkFrame {
                phy_payload: phy_payload.clone(),
                tx_info: tx_info.clone(),
                rx_info,
            }
        })
        .collect())
}

fn rxpk_modulation(rxpk: &Rxpk) -> Modulation {
    match rxpk.datr {
        DataRate::Lora {
            spreading_factor,
            bandwidth,
        } => Modulation::Lora {
            bandwidth,
            spreading_factor,
            code_rate: rxpk.codr.clone().unwrap_or_default(),
            polarization_inversion: false,
        },
        DataRate::Fsk { bitrate } => Modulation::Fsk {
            datarate: bitrate,
            frequency_deviation: None,
        },
    }
}

fn stats_event(gateway_id: GatewayId, stat: &Stat) -> GatewayStatsEvent {
    let location = match (stat.lati, stat.long) {
        (Some(latitude), Some(longitude)) => Some(Location {
            latitude,
            longitude,
            altitude: stat.alti.unwrap_or(0),
        }),
        _ => None,
    };
    GatewayStatsEvent {
        gateway_id,
        time: stat.time.0,
        location,
        rx_packets_received: stat.rxnb,
        rx_packets_received_ok: stat.rxok,
        rx_packets_forwarded: stat.rxfw,
        tx_packets_received: stat.dwnb,
        tx_packets_emitted: stat.txnb,
        ack_rate: stat.ackr,
    }
}

/// Build the wire transmit request for one downlink item
fn downlink_txpk(item: &DownlinkFrameItem) -> Txpk {
    let (imme, tmst, tmms) = match item.tx_info.timing {
        DownlinkTiming::Immediate => (true, None, None),
        DownlinkTiming::Delay { timestamp } => (false, Some(timestamp), None),
        DownlinkTiming::GpsEpoch { duration } => (false, None, Some(duration.num_milliseconds())),
    };

    let (modu, datr, codr, ipol, fdev) = match &item.tx_info.modulation {
        Modulation::Lora {
            bandwidth,
            spreading_factor,
            code_rate,
            polarization_inversion,
        } => (
            "LORA",
            DataRate::Lora {
                spreading_factor: *spreading_factor,
                bandwidth: *bandwidth,
            },
            Some(code_rate.clone()),
            *polarization_inversion,
            None,
        ),
        Modulation::Fsk {
            datarate,
            frequency_deviation,
        } => (
            "FSK",
            DataRate::Fsk { bitrate: *datarate },
            None,
            false,
            // Default deviation is half the bit rate
            Some(frequency_deviation.unwrap_or(datarate / 2) as u16),
        ),
    };

    Txpk {
        imme,
        tmst,
        tmms,
        freq: item.tx_info.frequency as f64 / 1_000_000.0,
        rfch: 0,
        powe: item.tx_info.power,
        modu: modu.to_string(),
        datr,
        codr,
        fdev,
        ipol,
        prea: item.tx_info.preamble,
        // Size always derives from the payload, never from caller input
        size: item.phy_payload.len() as u16,
        ncrc: item.tx_info.disable_crc,
        data: base64::engine::general_purpose::STANDARD.encode(&item.phy_payload),
        brd: item.tx_info.board,
        ant: item.tx_info.antenna,
    }
}
