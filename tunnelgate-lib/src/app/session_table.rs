use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;
use uuid::Uuid;

use crate::{
    proxy::sniffer::Protocol,
    session::{Network, TargetAddr},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer: Option<SocketAddr>,
    pub protocol: Option<Protocol>,
    pub destination: Option<TargetAddr>,
    pub network: Option<Network>,
    pub started_at: DateTime<Utc>,
}

/// Live sessions, for introspection only.
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session. The entry lives as long as the returned
    /// handle.
    pub fn track(&self, peer: Option<SocketAddr>) -> TrackedSession {
        let id = Uuid::new_v4();
        let info = SessionInfo {
            id,
            peer,
            protocol: None,
            destination: None,
            network: None,
            started_at: Utc::now(),
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, info);
        TrackedSession {
            id,
            table: self.clone(),
        }
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut SessionInfo)) {
        if let Some(info) = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            f(info);
        }
    }

    fn remove(&self, id: Uuid) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

pub struct TrackedSession {
    id: Uuid,
    table: SessionTable,
}

impl TrackedSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn set_route(
        &self,
        protocol: Protocol,
        destination: TargetAddr,
        network: Network,
    ) {
        self.table.update(self.id, |info| {
            info.protocol = Some(protocol);
            info.destination = Some(destination);
            info.network = Some(network);
        });
    }
}

impl Drop for TrackedSession {
    fn drop(&mut self) {
        trace!("session {} untracked", self.id);
        self.table.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_untrack() {
        let table = SessionTable::new();
        let a = table.track(Some("127.0.0.1:5000".parse().unwrap()));
        let b = table.track(None);
        assert_eq!(table.len(), 2);
        assert_ne!(a.id(), b.id());

        drop(a);
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, b.id());

        drop(b);
        assert!(table.is_empty());
    }

    #[test]
    fn test_set_route() {
        let table = SessionTable::new();
        let s = table.track(None);
        s.set_route(
            Protocol::Vmess,
            TargetAddr::new("example.com", 443),
            Network::Tcp,
        );

        let info = &table.snapshot()[0];
        assert_eq!(info.protocol, Some(Protocol::Vmess));
        assert_eq!(info.destination, Some(TargetAddr::new("example.com", 443)));
        assert_eq!(info.network, Some(Network::Tcp));
    }

    #[test]
    fn test_snapshot_serializes() {
        let table = SessionTable::new();
        let s = table.track(None);
        s.set_route(
            Protocol::Shadowsocks,
            TargetAddr::new("8.8.8.8", 53),
            Network::Udp,
        );

        let v = serde_json::to_value(table.snapshot()).unwrap();
        assert_eq!(v[0]["protocol"], "shadowsocks");
        assert_eq!(v[0]["network"], "udp");
        assert_eq!(v[0]["destination"]["host"], "8.8.8.8");
        assert_eq!(v[0]["destination"]["port"], 53);
        assert!(v[0]["startedAt"].is_string());
    }
}
