//! Semtech UDP Packet Forwarder wire codec (GWMP)
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! Every datagram starts with a 4-byte binary header: protocol version,
//! a 2-byte correlation token (little-endian) and the packet-type byte.
//! Kinds that carry a gateway identity follow with 8 identity bytes; the
//! remainder, if any, is a JSON body.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::GatewayId;

/// Decode/encode failures. Any of these drops the datagram; none are fatal
/// to the engine.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("datagram malformed: {0} bytes, minimum 4")]
    Malformed(usize),
    #[error("unsupported protocol version: 0x{0:02x}")]
    UnsupportedVersion(u8),
    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),
    #[error("wrong length for {kind:?}: got {got} bytes, expected {expected}")]
    WrongLength {
        kind: PacketType,
        got: usize,
        expected: usize,
    },
    #[error("{kind:?} too short: {got} bytes, minimum {min}")]
    TooShort {
        kind: PacketType,
        got: usize,
        min: usize,
    },
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Protocol version byte. Two values are in the wild; everything else is
/// rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Legacy packet forwarders (pre-3.0)
    V1,
    /// Current packet forwarders
    V2,
}

impl ProtocolVersion {
    pub fn to_u8(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 0x01,
            ProtocolVersion::V2 => 0x02,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ProtocolVersion::V1),
            0x02 => Ok(ProtocolVersion::V2),
            _ => Err(CodecError::UnsupportedVersion(value)),
        }
    }
}

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(CodecError::UnknownPacketType(value)),
        }
    }
}

/// Parsed GWMP packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Gateway → server: batch of receptions and/or a status record
    PushData {
        version: ProtocolVersion,
        token: u16,
        gateway_id: GatewayId,
        payload: PushDataPayload,
    },
    /// Server → gateway: PUSH_DATA acknowledgement
    PushAck { version: ProtocolVersion, token: u16 },
    /// Gateway → server: liveness probe, opens the downlink return path
    PullData {
        version: ProtocolVersion,
        token: u16,
        gateway_id: GatewayId,
    },
    /// Server → gateway: single transmit request
    PullResp {
        version: ProtocolVersion,
        token: u16,
        payload: PullRespPayload,
    },
    /// Server → gateway: PULL_DATA acknowledgement
    PullAck { version: ProtocolVersion, token: u16 },
    /// Gateway → server: downlink delivery result. `error` is `None` on
    /// success (the wire sentinel `"NONE"` is normalized away on decode).
    TxAck {
        version: ProtocolVersion,
        token: u16,
        gateway_id: GatewayId,
        error: Option<String>,
    },
}

impl Packet {
    /// Parse a raw UDP datagram into a GWMP packet
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < 4 {
            return Err(CodecError::Malformed(data.len()));
        }

        let mut buf = &data[..];
        let version = ProtocolVersion::try_from(buf.get_u8())?;
        let token = buf.get_u16_le();
        let packet_type = PacketType::try_from(buf.get_u8())?;

        match packet_type {
            PacketType::PushData => {
                // 12-byte prefix plus a non-empty JSON body (minimum "{}")
                if data.len() < 13 {
                    return Err(CodecError::TooShort {
                        kind: packet_type,
                        got: data.len(),
                        min: 13,
                    });
                }
                let gateway_id = read_gateway_id(&mut buf);
                let payload: PushDataPayload = serde_json::from_slice(buf)?;
                Ok(Packet::PushData {
                    version,
                    token,
                    gateway_id,
                    payload,
                })
            }
            PacketType::PushAck => {
                check_exact(packet_type, data.len(), 4)?;
                Ok(Packet::PushAck { version, token })
            }
            PacketType::PullData => {
                check_exact(packet_type, data.len(), 12)?;
                let gateway_id = read_gateway_id(&mut buf);
                Ok(Packet::PullData {
                    version,
                    token,
                    gateway_id,
                })
            }
            PacketType::PullResp => {
                if data.len() < 5 {
                    return Err(CodecError::TooShort {
                        kind: packet_type,
                        got: data.len(),
                        min: 5,
                    });
                }
                let payload: PullRespPayload = serde_json::from_slice(buf)?;
                Ok(Packet::PullResp {
                    version,
                    token,
                    payload,
                })
            }
            PacketType::PullAck => {
                check_exact(packet_type, data.len(), 4)?;
                Ok(Packet::PullAck { version, token })
            }
            PacketType::TxAck => {
                if data.len() < 12 {
                    return Err(CodecError::TooShort {
                        kind: packet_type,
                        got: data.len(),
                        min: 12,
                    });
                }
                let gateway_id = read_gateway_id(&mut buf);
                let error = if buf.has_remaining() {
                    let body: TxAckPayload = serde_json::from_slice(buf)?;
                    normalize_txack_error(body)
                } else {
                    None
                };
                Ok(Packet::TxAck {
                    version,
                    token,
                    gateway_id,
                    error,
                })
            }
        }
    }

    /// Serialize the packet into a datagram
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = BytesMut::with_capacity(256);

        match self {
            Packet::PushData {
                version,
                token,
                gateway_id,
                payload,
            } => {
                put_header(&mut buf, *version, *token, PacketType::PushData);
                buf.put_slice(gateway_id.as_bytes());
                buf.put_slice(&serde_json::to_vec(payload)?);
            }
            Packet::PushAck { version, token } => {
                put_header(&mut buf, *version, *token, PacketType::PushAck);
            }
            Packet::PullData {
                version,
                token,
                gateway_id,
            } => {
                put_header(&mut buf, *version, *token, PacketType::PullData);
                buf.put_slice(gateway_id.as_bytes());
            }
            Packet::PullResp {
                version,
                token,
                payload,
            } => {
                // Version 1 forwarders never populated the PULL_RESP token
                let token = match version {
                    ProtocolVersion::V1 => 0,
                    ProtocolVersion::V2 => *token,
                };
                put_header(&mut buf, *version, token, PacketType::PullResp);
                buf.put_slice(&serde_json::to_vec(payload)?);
            }
            Packet::PullAck { version, token } => {
                put_header(&mut buf, *version, *token, PacketType::PullAck);
            }
            Packet::TxAck {
                version,
                token,
                gateway_id,
                error,
            } => {
                put_header(&mut buf, *version, *token, PacketType::TxAck);
                buf.put_slice(gateway_id.as_bytes());
                if let Some(err) = error {
                    let body = TxAckPayload {
                        txpk_ack: Some(TxAckStatus {
                            error: Some(err.clone()),
                        }),
                    };
                    buf.put_slice(&serde_json::to_vec(&body)?);
                }
            }
        }

        Ok(buf.to_vec())
    }
}

fn put_header(buf: &mut BytesMut, version: ProtocolVersion, token: u16, packet_type: PacketType) {
    buf.put_u8(version.to_u8());
    buf.put_u16_le(token);
    buf.put_u8(packet_type as u8);
}

fn read_gateway_id(buf: &mut &[u8]) -> GatewayId {
    let mut id = [0u8; 8];
    buf.copy_to_slice(&mut id);
    GatewayId(id)
}

fn check_exact(kind: PacketType, got: usize, expected: usize) -> Result<(), CodecError> {
    if got != expected {
        return Err(CodecError::WrongLength {
            kind,
            got,
            expected,
        });
    }
    Ok(())
}

/// `"NONE"` and the empty string both mean "delivered fine".
fn normalize_txack_error(body: TxAckPayload) -> Option<String> {
    match body.txpk_ack.and_then(|ack| ack.error) {
        Some(err) if err.is_empty() || err == "NONE" => None,
        other => other,
    }
}

/// PUSH_DATA JSON body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushDataPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rxpk: Vec<Rxpk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<Stat>,
}

/// PULL_RESP JSON body: exactly one transmit request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

/// TX_ACK JSON body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxAckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txpk_ack: Option<TxAckStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxAckStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A received radio packet (one wire record; may expand into several
/// normalized uplinks when `rsig` reports are present)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of reception, RFC3339 with sub-second precision
    #[serde(default, skip_serializing_if = "CompactTime::is_none")]
    pub time: CompactTime,
    /// GPS time of reception, milliseconds since the GPS epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmms: Option<i64>,
    /// Concentrator counter at reception (microseconds, rolls over)
    pub tmst: u32,
    /// Centre frequency in MHz
    pub freq: f64,
    /// Concentrator board
    #[serde(default)]
    pub brd: u32,
    /// Concentrator IF channel
    #[serde(default)]
    pub chan: u32,
    /// Concentrator RF chain
    #[serde(default)]
    pub rfch: u32,
    /// CRC status of the payload
    pub stat: CrcStatus,
    /// Modulation identifier ("LORA" or "FSK")
    pub modu: String,
    /// Data-rate identifier
    pub datr: DataRate,
    /// LoRa coding rate, e.g. "4/5" (absent for FSK)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// RSSI in dBm
    pub rssi: i16,
    /// LoRa signal-to-noise ratio in dB
    #[serde(default)]
    pub lsnr: f64,
    /// Payload size in bytes
    pub size: u16,
    /// Base64-encoded PHY payload
    pub data: String,
    /// Per-antenna signal reports (fine-timestamp capable gateways)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rsig: Vec<RSig>,
}

/// One antenna's view of a reception
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RSig {
    /// Antenna number
    pub ant: u32,
    /// Concentrator IF channel
    pub chan: u32,
    /// Signal-to-noise ratio in dB
    #[serde(default)]
    pub lsnr: f64,
    /// RSSI of the channel in dBm
    pub rssic: i16,
}

/// Gateway status record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    /// UTC system time of the gateway
    #[serde(default)]
    pub time: ExpandedTime,
    /// GPS latitude, degrees north
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lati: Option<f64>,
    /// GPS longitude, degrees east
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,
    /// GPS altitude, meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alti: Option<i32>,
    /// Radio packets received
    pub rxnb: u32,
    /// Radio packets received with a valid CRC
    pub rxok: u32,
    /// Radio packets forwarded
    pub rxfw: u32,
    /// Ratio of upstream datagrams that were acknowledged; some forwarders
    /// omit it before the first ack
    #[serde(default)]
    pub ackr: f64,
    /// PULL_RESP datagrams received
    pub dwnb: u32,
    /// Radio packets emitted
    pub txnb: u32,
}

/// A transmit request carried in PULL_RESP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately, ignoring tmst/tmms
    #[serde(default)]
    pub imme: bool,
    /// Send when the concentrator counter reaches this value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    /// Send at this GPS time (milliseconds since the GPS epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmms: Option<i64>,
    /// Centre frequency in MHz
    pub freq: f64,
    /// Concentrator RF chain
    #[serde(default)]
    pub rfch: u32,
    /// TX power in dBm
    #[serde(default)]
    pub powe: i32,
    /// Modulation identifier ("LORA" or "FSK")
    pub modu: String,
    /// Data-rate identifier
    pub datr: DataRate,
    /// LoRa coding rate (absent for FSK)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// FSK frequency deviation in Hz
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fdev: Option<u16>,
    /// Invert LoRa polarization
    #[serde(default)]
    pub ipol: bool,
    /// Preamble length override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prea: Option<u16>,
    /// Payload size in bytes
    pub size: u16,
    /// Disable the physical CRC on transmit
    #[serde(default)]
    pub ncrc: bool,
    /// Base64-encoded PHY payload
    pub data: String,
    /// Concentrator board
    #[serde(default)]
    pub brd: u32,
    /// Antenna number
    #[serde(default)]
    pub ant: u32,
}

/// Per-payload CRC status as reported by the concentrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcStatus {
    Ok,
    Fail,
    NoCrc,
}

impl Serialize for CrcStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(match self {
            CrcStatus::Ok => 1,
            CrcStatus::Fail => -1,
            CrcStatus::NoCrc => 0,
        })
    }
}

impl<'de> Deserialize<'de> for CrcStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match i8::deserialize(deserializer)? {
            1 => Ok(CrcStatus::Ok),
            -1 => Ok(CrcStatus::Fail),
            0 => Ok(CrcStatus::NoCrc),
            other => Err(serde::de::Error::custom(format!(
                "invalid CRC status: {}",
                other
            ))),
        }
    }
}

/// Data-rate identifier: a `"SF<n>BW<m>"` string for LoRa, a bare integer
/// (bits/second) for FSK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataRate {
    Lora { spreading_factor: u32, bandwidth: u32 },
    Fsk { bitrate: u32 },
}

impl Serialize for DataRate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DataRate::Lora {
                spreading_factor,
                bandwidth,
            } => serializer.serialize_str(&format!("SF{}BW{}", spreading_factor, bandwidth)),
            DataRate::Fsk { bitrate } => serializer.serialize_u32(*bitrate),
        }
    }
}

impl<'de> Deserialize<'de> for DataRate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DataRateVisitor;

        impl serde::de::Visitor<'_> for DataRateVisitor {
            type Value = DataRate;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an integer bit rate or a \"SF<n>BW<m>\" string")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<DataRate, E> {
                let bitrate = u32::try_from(v)
                    .map_err(|_| E::custom(format!("FSK bit rate out of range: {}", v)))?;
                Ok(DataRate::Fsk { bitrate })
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<DataRate, E> {
                let bitrate = u32::try_from(v)
                    .map_err(|_| E::custom(format!("FSK bit rate out of range: {}", v)))?;
                Ok(DataRate::Fsk { bitrate })
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<DataRate, E> {
                parse_lora_datr(v)
                    .ok_or_else(|| E::custom(format!("invalid LoRa data-rate: {:?}", v)))
            }
        }

        deserializer.deserialize_any(DataRateVisitor)
    }
}

fn parse_lora_datr(s: &str) -> Option<DataRate> {
    let rest = s.strip_prefix("SF")?;
    let (sf, bw) = rest.split_once("BW")?;
    Some(DataRate::Lora {
        spreading_factor: sf.parse().ok()?,
        bandwidth: bw.parse().ok()?,
    })
}

/// Compact RFC3339 timestamp used for reception times. The zero value
/// serializes to `null`; the empty string decodes to the zero value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompactTime(pub Option<DateTime<Utc>>);

impl CompactTime {
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl From<DateTime<Utc>> for CompactTime {
    fn from(t: DateTime<Utc>) -> Self {
        CompactTime(Some(t))
    }
}

impl Serialize for CompactTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            None => serializer.serialize_none(),
            Some(t) => {
                serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

impl<'de> Deserialize<'de> for CompactTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(CompactTime(None)),
            Some(s) if s.is_empty() => Ok(CompactTime(None)),
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|t| CompactTime(Some(t.with_timezone(&Utc))))
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Expanded `YYYY-MM-DD HH:MM:SS UTC` timestamp used by status records.
/// The empty string decodes to the zero value without error.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExpandedTime(pub Option<DateTime<Utc>>);

impl From<DateTime<Utc>> for ExpandedTime {
    fn from(t: DateTime<Utc>) -> Self {
        ExpandedTime(Some(t))
    }
}

impl Serialize for ExpandedTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            None => serializer.serialize_str(""),
            Some(t) => serializer.serialize_str(&t.format("%Y-%m-%d %H:%M:%S %Z").to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ExpandedTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(ExpandedTime(None));
        }
        // The timezone token is informational; gateways report UTC.
        let (datetime, _tz) = s
            .rsplit_once(' ')
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {:?}", s)))?;
        NaiveDateTime::parse_from_str(datetime, "%Y-%m-%d %H:%M:%S")
            .map(|t| ExpandedTime(Some(Utc.from_utc_datetime(&t))))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_id() -> GatewayId {
        GatewayId([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])
    }

    #[test]
    fn test_decode_pull_data() {
        // version=0x02, token=0x1234 (LE: 34 12), type=0x02, 8-byte id
        let data: Vec<u8> = vec![
            0x02, // version
            0x34, 0x12, // token (LE)
            0x02, // PULL_DATA
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // gateway id
        ];

        let packet = Packet::decode(&data).unwrap();
        assert_eq!(
            packet,
            Packet::PullData {
                version: ProtocolVersion::V2,
                token: 0x1234,
                gateway_id: gateway_id(),
            }
        );
    }

    #[test]
    fn test_decode_pull_data_wrong_length() {
        // 13 bytes instead of exactly 12
        let mut data = vec![0x02, 0x34, 0x12, 0x02];
        data.extend_from_slice(&[0u8; 9]);
        let err = Packet::decode(&data).unwrap_err();
        assert!(matches!(err, CodecError::WrongLength { expected: 12, .. }));
    }

    #[test]
    fn test_decode_too_short_datagram() {
        let err = Packet::decode(&[0x02, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(3)));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let err = Packet::decode(&[0x03, 0x00, 0x00, 0x02]).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(0x03)));
    }

    #[test]
    fn test_decode_unknown_packet_type() {
        let err = Packet::decode(&[0x02, 0x00, 0x00, 0x09]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownPacketType(0x09)));
    }

    #[test]
    fn test_push_ack_round_trip() {
        let packet = Packet::PushAck {
            version: ProtocolVersion::V2,
            token: 0xBEEF,
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_pull_ack_round_trip() {
        let packet = Packet::PullAck {
            version: ProtocolVersion::V1,
            token: 0x0001,
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_push_data_round_trip() {
        let packet = Packet::PushData {
            version: ProtocolVersion::V2,
            token: 0x1234,
            gateway_id: gateway_id(),
            payload: PushDataPayload {
                rxpk: vec![Rxpk {
                    time: CompactTime(None),
                    tmms: Some(5_000_000),
                    tmst: 708016819,
                    freq: 868.3,
                    brd: 0,
                    chan: 2,
                    rfch: 0,
                    stat: CrcStatus::Ok,
                    modu: "LORA".to_string(),
                    datr: DataRate::Lora {
                        spreading_factor: 7,
                        bandwidth: 125,
                    },
                    codr: Some("4/5".to_string()),
                    rssi: -57,
                    lsnr: 7.8,
                    size: 3,
                    data: "qrvM".to_string(),
                    rsig: vec![],
                }],
                stat: None,
            },
        };

        let bytes = packet.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_push_data_empty_body_fails() {
        // 12 bytes only: prefix + id, no JSON body at all
        let mut data = vec![0x02, 0x00, 0x00, 0x00];
        data.extend_from_slice(gateway_id().as_bytes());
        let err = Packet::decode(&data).unwrap_err();
        assert!(matches!(err, CodecError::TooShort { min: 13, .. }));
    }

    #[test]
    fn test_pull_resp_round_trip() {
        let packet = Packet::PullResp {
            version: ProtocolVersion::V2,
            token: 0xCAFE,
            payload: PullRespPayload {
                txpk: Txpk {
                    imme: false,
                    tmst: Some(5000000),
                    tmms: None,
                    freq: 869.525,
                    rfch: 0,
                    powe: 14,
                    modu: "LORA".to_string(),
                    datr: DataRate::Lora {
                        spreading_factor: 12,
                        bandwidth: 125,
                    },
                    codr: Some("4/5".to_string()),
                    fdev: None,
                    ipol: true,
                    prea: None,
                    size: 2,
                    ncrc: false,
                    data: "qrs=".to_string(),
                    brd: 0,
                    ant: 0,
                },
            },
        };

        let bytes = packet.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_pull_resp_v1_zeroes_token_on_encode() {
        let packet = Packet::PullResp {
            version: ProtocolVersion::V1,
            token: 0xCAFE,
            payload: PullRespPayload {
                txpk: fsk_txpk(),
            },
        };

        let bytes = packet.encode().unwrap();
        assert_eq!(&bytes[1..3], &[0x00, 0x00]);

        // Decode reads the token bytes as provided, even under v1
        match Packet::decode(&bytes).unwrap() {
            Packet::PullResp { token, version, .. } => {
                assert_eq!(token, 0);
                assert_eq!(version, ProtocolVersion::V1);
            }
            other => panic!("expected PullResp, got {:?}", other),
        }
    }

    fn fsk_txpk() -> Txpk {
        Txpk {
            imme: true,
            tmst: None,
            tmms: None,
            freq: 868.1,
            rfch: 0,
            powe: 27,
            modu: "FSK".to_string(),
            datr: DataRate::Fsk { bitrate: 50000 },
            codr: None,
            fdev: Some(25000),
            ipol: false,
            prea: None,
            size: 2,
            ncrc: false,
            data: "qrs=".to_string(),
            brd: 0,
            ant: 0,
        }
    }

    #[test]
    fn test_tx_ack_error_round_trip() {
        let packet = Packet::TxAck {
            version: ProtocolVersion::V2,
            token: 0x0042,
            gateway_id: gateway_id(),
            error: Some("TX_FREQ".to_string()),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_tx_ack_none_sentinel_normalized() {
        let mut data = vec![0x02, 0x42, 0x00, 0x05];
        data.extend_from_slice(gateway_id().as_bytes());
        data.extend_from_slice(br#"{"txpk_ack":{"error":"NONE"}}"#);

        match Packet::decode(&data).unwrap() {
            Packet::TxAck { error, .. } => assert_eq!(error, None),
            other => panic!("expected TxAck, got {:?}", other),
        }
    }

    #[test]
    fn test_tx_ack_no_body_means_no_error() {
        let packet = Packet::TxAck {
            version: ProtocolVersion::V2,
            token: 0x0042,
            gateway_id: gateway_id(),
            error: None,
        };
        let bytes = packet.encode().unwrap();
        // No error, no body: never emit the "NONE" sentinel
        assert_eq!(bytes.len(), 12);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_data_rate_lora_round_trip() {
        let dr = DataRate::Lora {
            spreading_factor: 7,
            bandwidth: 125,
        };
        let json = serde_json::to_string(&dr).unwrap();
        assert_eq!(json, "\"SF7BW125\"");
        assert_eq!(serde_json::from_str::<DataRate>(&json).unwrap(), dr);
    }

    #[test]
    fn test_data_rate_fsk_round_trip() {
        let dr = DataRate::Fsk { bitrate: 50000 };
        let json = serde_json::to_string(&dr).unwrap();
        assert_eq!(json, "50000");
        assert_eq!(serde_json::from_str::<DataRate>(&json).unwrap(), dr);
    }

    #[test]
    fn test_data_rate_malformed_fails() {
        assert!(serde_json::from_str::<DataRate>("\"SFXBW125\"").is_err());
        assert!(serde_json::from_str::<DataRate>("\"7BW125\"").is_err());
        assert!(serde_json::from_str::<DataRate>("\"\"").is_err());
    }

    #[test]
    fn test_data_rate_out_of_range_integer_fails() {
        assert!(serde_json::from_str::<DataRate>("-1").is_err());
        assert!(serde_json::from_str::<DataRate>("4294967296").is_err());
        assert_eq!(
            serde_json::from_str::<DataRate>("4294967295").unwrap(),
            DataRate::Fsk {
                bitrate: u32::MAX
            }
        );
    }

    #[test]
    fn test_compact_time_zero_is_null() {
        let json = serde_json::to_string(&CompactTime(None)).unwrap();
        assert_eq!(json, "null");
    }

    #[test]
    fn test_compact_time_empty_string_decodes_to_zero() {
        let t: CompactTime = serde_json::from_str("\"\"").unwrap();
        assert_eq!(t, CompactTime(None));
        let t: CompactTime = serde_json::from_str("null").unwrap();
        assert_eq!(t, CompactTime(None));
    }

    #[test]
    fn test_compact_time_format_exact() {
        let t = CompactTime(Some(
            Utc.with_ymd_and_hms(2006, 1, 2, 22, 4, 5).unwrap(),
        ));
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"2006-01-02T22:04:05Z\"");
        assert_eq!(serde_json::from_str::<CompactTime>(&json).unwrap(), t);
    }

    #[test]
    fn test_expanded_time_format_exact() {
        let t = ExpandedTime(Some(
            Utc.with_ymd_and_hms(2006, 1, 2, 22, 4, 5).unwrap(),
        ));
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"2006-01-02 22:04:05 UTC\"");
        assert_eq!(serde_json::from_str::<ExpandedTime>(&json).unwrap(), t);
    }

    #[test]
    fn test_expanded_time_empty_string_decodes_to_zero() {
        let t: ExpandedTime = serde_json::from_str("\"\"").unwrap();
        assert_eq!(t, ExpandedTime(None));
    }
}
