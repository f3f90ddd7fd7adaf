//! Bridge between radio gateways speaking the Semtech UDP packet-forwarder
//! protocol and a LoRaWAN network server.
//!
//! The [`udp::Backend`] owns the socket and turns wire packets into the
//! normalized events in [`events`]; [`stats::Collector`] summarizes that
//! traffic for telemetry export.

pub mod config;
pub mod events;
pub mod stats;
pub mod udp;
