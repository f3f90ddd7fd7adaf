//! Gateway session registry.
//!
//! Tracks the last-known address, protocol version and liveness of every
//! gateway that has sent a PULL_DATA probe. The transport engine consults
//! it to route downlinks; a periodic sweep evicts gateways that have gone
//! quiet.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::events::GatewayId;
use crate::udp::packets::ProtocolVersion;

/// Default retention window: a gateway that has not probed for this long
/// is dropped by the next sweep.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown gateway: {0}")]
    NotFound(GatewayId),
}

/// Side effect invoked on first sight / eviction of a gateway. A returned
/// error aborts the corresponding commit or eviction.
pub type GatewayCallback = Box<dyn Fn(GatewayId) -> anyhow::Result<()> + Send + Sync>;

/// Injected registry side effects
#[derive(Default)]
pub struct Callbacks {
    /// Invoked once, the first time an identity is observed
    pub on_new: Option<GatewayCallback>,
    /// Invoked for each session the sweep evicts
    pub on_delete: Option<GatewayCallback>,
}

/// Last-known state of one gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub addr: SocketAddr,
    pub version: ProtocolVersion,
    pub last_seen: Instant,
}

pub struct Registry {
    sessions: RwLock<HashMap<GatewayId, Session>>,
    callbacks: Callbacks,
    retention: Duration,
}

impl Registry {
    pub fn new(retention: Duration, callbacks: Callbacks) -> Self {
        Registry {
            sessions: RwLock::new(HashMap::new()),
            callbacks,
            retention,
        }
    }

    /// Look up a gateway's session
    pub fn get(&self, gateway_id: GatewayId) -> Result<Session, RegistryError> {
        let sessions = self.sessions.read().expect("registry lock poisoned");
        sessions
            .get(&gateway_id)
            .copied()
            .ok_or(RegistryError::NotFound(gateway_id))
    }

    /// Insert or refresh a gateway's session. The on-new callback runs
    /// exactly once per identity, before the first insert; if it fails the
    /// session is not stored.
    pub fn set(&self, gateway_id: GatewayId, session: Session) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().expect("registry lock poisoned");
        if !sessions.contains_key(&gateway_id) {
            if let Some(on_new) = &self.callbacks.on_new {
                on_new(gateway_id)?;
            }
        }
        sessions.insert(gateway_id, session);
        Ok(())
    }

    /// Evict every session whose last update is older than the retention
    /// window. The on-delete callback runs before each removal; a failure
    /// leaves that session in place and aborts the sweep.
    pub fn sweep(&self) -> anyhow::Result<()> {
        let mut sessions = self.sessions.write().expect("registry lock poisoned");
        let expired: Vec<GatewayId> = sessions
            .iter()
            .filter(|(_, s)| s.last_seen.elapsed() > self.retention)
            .map(|(id, _)| *id)
            .collect();

        for gateway_id in expired {
            if let Some(on_delete) = &self.callbacks.on_delete {
                on_delete(gateway_id)?;
            }
            sessions.remove(&gateway_id);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.read().expect("registry lock poisoned").len()
    }
}
