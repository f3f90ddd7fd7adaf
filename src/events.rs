//! Normalized event types shared by the UDP transport engine and the
//! stats collector.
//!
//! The transport engine decodes wire packets into these shapes; consumers
//! (network-server forwarders, telemetry) only ever see these, never the
//! raw packet-forwarder JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Gateway identifier (EUI-64, 8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GatewayId(pub [u8; 8]);

impl GatewayId {
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for GatewayId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let id: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("gateway id must be 8 bytes, got {}", bytes.len()))?;
        Ok(GatewayId(id))
    }
}

impl Serialize for GatewayId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for GatewayId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Modulation descriptor for a reception or transmission.
///
/// Derives `Eq + Hash` so the stats collector can key its per-modulation
/// counters on the full variant directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "modulation", rename_all = "UPPERCASE")]
pub enum Modulation {
    Lora {
        /// Bandwidth in kHz (125 / 250 / 500)
        bandwidth: u32,
        spreading_factor: u32,
        /// Coding rate, e.g. "4/5"
        code_rate: String,
        polarization_inversion: bool,
    },
    Fsk {
        /// Bit rate in bits/second
        datarate: u32,
        /// Frequency deviation in Hz; derived from the bit rate when unset
        frequency_deviation: Option<u32>,
    },
}

impl Modulation {
    /// LoRa modulation with the downlink default of inverted polarization.
    pub fn lora(spreading_factor: u32, bandwidth: u32, code_rate: impl Into<String>) -> Self {
        Modulation::Lora {
            bandwidth,
            spreading_factor,
            code_rate: code_rate.into(),
            polarization_inversion: true,
        }
    }

    pub fn fsk(datarate: u32) -> Self {
        Modulation::Fsk {
            datarate,
            frequency_deviation: None,
        }
    }
}

/// A single normalized radio reception.
///
/// One wire rxpk record expands into one of these per antenna signal
/// report (or exactly one when no reports are present).
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkFrame {
    /// Raw PHY payload (base64-decoded)
    pub phy_payload: Vec<u8>,
    pub tx_info: UplinkTxInfo,
    pub rx_info: UplinkRxInfo,
}

/// Shared transmission parameters of a reception
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkTxInfo {
    /// Frequency in Hz
    pub frequency: u32,
    pub modulation: Modulation,
}

/// Per-antenna reception metadata
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkRxInfo {
    pub gateway_id: GatewayId,
    /// Correlation token of the carrying uplink batch
    pub uplink_token: u16,
    /// UTC time of reception, when the gateway reported one
    pub time: Option<DateTime<Utc>>,
    /// Time since the GPS epoch, when the gateway has a GPS fix
    pub time_since_gps_epoch: Option<Duration>,
    /// Concentrator counter at reception (microseconds, rolls over)
    pub timestamp: u32,
    pub rssi: i32,
    pub snr: f64,
    pub channel: u32,
    pub rf_chain: u32,
    pub board: u32,
    pub antenna: u32,
    pub crc_valid: bool,
}

/// Normalized gateway status report
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayStatsEvent {
    pub gateway_id: GatewayId,
    pub time: Option<DateTime<Utc>>,
    pub location: Option<Location>,
    /// Radio packets received
    pub rx_packets_received: u32,
    /// Radio packets received with valid CRC
    pub rx_packets_received_ok: u32,
    /// Radio packets forwarded upstream
    pub rx_packets_forwarded: u32,
    /// Downlink datagrams received from the server
    pub tx_packets_received: u32,
    /// Radio packets emitted
    pub tx_packets_emitted: u32,
    /// Ratio of upstream datagrams that were acknowledged
    pub ack_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
}

/// Server-to-gateway transmit request
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkFrame {
    pub gateway_id: GatewayId,
    /// Correlation token for the wire packet and the eventual tx-ack
    pub downlink_id: u16,
    pub items: Vec<DownlinkFrameItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkFrameItem {
    pub phy_payload: Vec<u8>,
    pub tx_info: DownlinkTxInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkTxInfo {
    /// Frequency in Hz
    pub frequency: u32,
    /// TX power in dBm
    pub power: i32,
    pub modulation: Modulation,
    pub timing: DownlinkTiming,
    pub board: u32,
    pub antenna: u32,
    /// Preamble length override
    pub preamble: Option<u16>,
    /// Disable the physical CRC on transmit
    pub disable_crc: bool,
}

/// When the gateway should emit the downlink
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownlinkTiming {
    /// Transmit as soon as possible
    Immediate,
    /// Transmit when the concentrator counter reaches the given value
    Delay { timestamp: u32 },
    /// Transmit at the given time since the GPS epoch
    GpsEpoch { duration: Duration },
}

/// Normalized downlink acknowledgement, one item per sent downlink item
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkTxAck {
    pub gateway_id: GatewayId,
    pub downlink_id: u16,
    pub items: Vec<DownlinkTxAckItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkTxAckItem {
    /// Delivery status, "OK" for success
    pub status: String,
}

/// Status value for a successful delivery
pub const TXACK_STATUS_OK: &str = "OK";
/// Status value for an item the gateway never considered
pub const TXACK_STATUS_IGNORED: &str = "IGNORED";
