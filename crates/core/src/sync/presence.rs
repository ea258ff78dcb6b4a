//! Owner record heartbeat.
//!
//! The authoritative session writes its [`OwnerRecord`] when it starts
//! hosting and refreshes `lastHeartbeat` on a fixed interval. Nothing here
//! reads the record back to take authority away; staleness is reported only.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Map;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PresenceConfig;
use crate::model::{OWNER_KEY, OwnerRecord, SharedDocument};
use crate::transport::{HostTransport, RoleOracle};

/// Periodic writer of this session's [`OwnerRecord`].
#[derive(Clone)]
pub struct Heartbeat {
    transport: Arc<dyn HostTransport>,
    role: Arc<dyn RoleOracle>,
    session_id: String,
    session_name: String,
    config: PresenceConfig,
}

impl Heartbeat {
    pub fn new(
        transport: Arc<dyn HostTransport>, role: Arc<dyn RoleOracle>, session_name: impl Into<String>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            transport,
            role,
            session_id: uuid::Uuid::new_v4().to_string(),
            session_name: session_name.into(),
            config,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Write the owner record now. Returns whether it was written.
    pub async fn beat(&self) -> bool {
        if !self.role.is_authoritative().await {
            return false;
        }
        let record = OwnerRecord {
            id: self.session_id.clone(),
            name: self.session_name.clone(),
            last_heartbeat: Utc::now(),
        };
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "owner record not serializable");
                return false;
            }
        };

        let mut patch = Map::new();
        patch.insert(OWNER_KEY.to_string(), value);
        match self.transport.set_metadata(patch).await {
            Ok(()) => {
                tracing::debug!(session_id = %self.session_id, "heartbeat written");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat write failed");
                false
            }
        }
    }

    /// Owner record currently in the shared document, with its staleness.
    pub async fn current_owner(&self) -> Option<(OwnerRecord, bool)> {
        let metadata = self.transport.get_metadata().await.ok()?;
        let owner = SharedDocument::from_metadata(&metadata).owner?;
        let stale = owner.is_stale(Utc::now(), self.config.stale_after());
        Some((owner, stale))
    }

    /// Beat immediately, then once per interval until aborted.
    pub fn start(self) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                self.beat().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryRoom, StaticRole, Subscription, TransportError};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn heartbeat(room: &MemoryRoom, role: Arc<StaticRole>) -> Heartbeat {
        Heartbeat::new(Arc::new(room.clone()), role, "vault-host", PresenceConfig::default())
    }

    fn owner(room: &MemoryRoom) -> Option<OwnerRecord> {
        SharedDocument::from_metadata(&room.metadata()).owner
    }

    #[tokio::test]
    async fn test_beat_writes_owner_record() {
        let room = MemoryRoom::new();
        let hb = heartbeat(&room, Arc::new(StaticRole::new(true)));

        assert!(hb.beat().await);

        let record = owner(&room).unwrap();
        assert_eq!(record.id, hb.session_id());
        assert_eq!(record.name, "vault-host");
        let (_, stale) = hb.current_owner().await.unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn test_viewer_never_writes() {
        let room = MemoryRoom::new();
        let hb = heartbeat(&room, Arc::new(StaticRole::new(false)));
        assert!(!hb.beat().await);
        assert!(owner(&room).is_none());
    }

    /// Room that counts metadata writes.
    #[derive(Default)]
    struct CountingRoom {
        room: MemoryRoom,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl HostTransport for CountingRoom {
        async fn get_metadata(&self) -> Result<Map<String, Value>, TransportError> {
            self.room.get_metadata().await
        }

        async fn set_metadata(&self, patch: Map<String, Value>) -> Result<(), TransportError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.room.set_metadata(patch).await
        }

        async fn send_message(&self, channel: &str, payload: Value) -> Result<(), TransportError> {
            self.room.send_message(channel, payload).await
        }

        fn on_message(&self, channel: &str) -> Subscription {
            self.room.on_message(channel)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_on_interval() {
        let room = Arc::new(CountingRoom::default());
        let handle =
            Heartbeat::new(room.clone(), Arc::new(StaticRole::new(true)), "vault-host", PresenceConfig::default())
                .start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(room.writes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(room.writes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(room.writes.load(Ordering::SeqCst), 2);
        assert!(owner(&room.room).is_some());

        handle.abort();
    }
}
