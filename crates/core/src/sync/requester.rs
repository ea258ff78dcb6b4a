//! Requester side of the protocol.
//!
//! Each request walks `Idle -> Sent(key, deadline) -> Resolved | TimedOut`.
//! The response listener is registered before the request is published, so a
//! fast host cannot answer into the void. Whatever the outcome, the listener
//! is dropped on return; late or duplicate answers land nowhere.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use super::{
    CONTENT_REQUEST_CHANNEL, CONTENT_RESPONSE_CHANNEL, ContentRequest, ContentResponse, SendError,
    TREE_REQUEST_CHANNEL, TREE_RESPONSE_CHANNEL, TreePayload, publish,
};
use crate::config::ProtocolConfig;
use crate::model::BroadcastEnvelope;
use crate::transport::{HostTransport, Subscription};

/// Terminal state of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome<T> {
    Resolved(T),
    TimedOut,
    SendFailed(SendError),
}

impl<T> RequestOutcome<T> {
    /// Collapse to "content or nothing"; timeouts read as no content.
    pub fn into_option(self) -> Option<T> {
        match self {
            RequestOutcome::Resolved(value) => Some(value),
            RequestOutcome::TimedOut | RequestOutcome::SendFailed(_) => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, RequestOutcome::TimedOut)
    }
}

/// Issues content and visible-tree requests over a [`HostTransport`].
#[derive(Clone)]
pub struct SyncClient {
    transport: Arc<dyn HostTransport>,
    config: ProtocolConfig,
}

impl SyncClient {
    pub fn new(transport: Arc<dyn HostTransport>, config: ProtocolConfig) -> Self {
        Self { transport, config }
    }

    /// Ask the authoritative session for `page_id`.
    ///
    /// Waits 5s, or 10s with `force_refresh`. Never retries.
    pub async fn request_content(&self, page_id: &str, force_refresh: bool) -> RequestOutcome<ContentResponse> {
        let key = format!("{page_id}:{}", uuid::Uuid::new_v4());
        let request = ContentRequest { page_id: page_id.to_string(), force_refresh };
        let timeout = self.config.content_timeout(force_refresh);

        self.exchange(CONTENT_REQUEST_CHANNEL, CONTENT_RESPONSE_CHANNEL, Some(key), request, timeout)
            .await
    }

    /// Ask the authoritative session for the visible tree.
    pub async fn request_visible_tree(&self) -> RequestOutcome<Option<Value>> {
        let outcome = self
            .exchange::<_, TreePayload>(
                TREE_REQUEST_CHANNEL,
                TREE_RESPONSE_CHANNEL,
                None,
                TreePayload { tree: None },
                self.config.tree_timeout(),
            )
            .await;

        match outcome {
            RequestOutcome::Resolved(payload) => RequestOutcome::Resolved(payload.tree),
            RequestOutcome::TimedOut => RequestOutcome::TimedOut,
            RequestOutcome::SendFailed(e) => RequestOutcome::SendFailed(e),
        }
    }

    async fn exchange<Req: Serialize, Resp: DeserializeOwned>(
        &self, request_channel: &str, response_channel: &str, key: Option<String>, request: Req, timeout: Duration,
    ) -> RequestOutcome<Resp> {
        let mut subscription = self.transport.on_message(response_channel);

        let envelope = BroadcastEnvelope::new(key.clone(), request);
        if let Err(e) =
            publish(self.transport.as_ref(), request_channel, &envelope, self.config.message_limit_bytes).await
        {
            tracing::warn!(channel = request_channel, error = %e, "request not sent");
            return RequestOutcome::SendFailed(e);
        }

        let deadline = Instant::now() + timeout;
        tracing::debug!(channel = request_channel, correlation_key = ?key, ?timeout, "request sent");

        match tokio::time::timeout_at(deadline, wait_for(&mut subscription, key.as_deref())).await {
            Ok(Some(payload)) => RequestOutcome::Resolved(payload),
            Ok(None) => {
                tracing::debug!(channel = response_channel, "response channel closed");
                RequestOutcome::TimedOut
            }
            Err(_) => {
                tracing::debug!(channel = response_channel, correlation_key = ?key, "request timed out");
                RequestOutcome::TimedOut
            }
        }
    }
}

/// First well-formed envelope whose correlation key matches `key`.
async fn wait_for<Resp: DeserializeOwned>(subscription: &mut Subscription, key: Option<&str>) -> Option<Resp> {
    while let Some(raw) = subscription.recv().await {
        let envelope: BroadcastEnvelope<Resp> = match serde_json::from_value(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring malformed response");
                continue;
            }
        };
        if key.is_none() || envelope.correlation_key.as_deref() == key {
            return Some(envelope.payload);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryRoom;
    use serde_json::json;

    fn client(room: &MemoryRoom) -> SyncClient {
        SyncClient::new(Arc::new(room.clone()), ProtocolConfig::default())
    }

    /// Answer the next content request with `answers`, in order. Answers
    /// flagged `false` carry a foreign correlation key.
    fn spawn_answerer(room: &MemoryRoom, answers: Vec<(bool, ContentResponse)>) {
        let room = room.clone();
        let mut requests = room.on_message(CONTENT_REQUEST_CHANNEL);
        tokio::spawn(async move {
            let raw = requests.recv().await.unwrap();
            let envelope: BroadcastEnvelope<ContentRequest> = serde_json::from_value(raw).unwrap();
            let key = envelope.correlation_key.unwrap();
            for (matching, response) in answers {
                let tag = if matching { key.clone() } else { "p1:someone-else".to_string() };
                let reply = BroadcastEnvelope::new(Some(tag), response);
                room.send_message(CONTENT_RESPONSE_CHANNEL, serde_json::to_value(reply).unwrap())
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_resolves_on_matching_key_only() {
        let room = MemoryRoom::new();
        let decoy = ContentResponse { page_id: "p1".into(), html: Some("wrong".into()), ..Default::default() };
        let real = ContentResponse { page_id: "p1".into(), html: Some("right".into()), ..Default::default() };
        spawn_answerer(&room, vec![(false, decoy), (true, real.clone())]);

        let outcome = client(&room).request_content("p1", false).await;

        assert_eq!(outcome, RequestOutcome::Resolved(real));
        assert_eq!(room.listener_count(CONTENT_RESPONSE_CHANNEL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out_and_unsubscribes() {
        let room = MemoryRoom::new();
        let started = Instant::now();

        let outcome = client(&room).request_content("p1", false).await;

        assert!(outcome.is_timed_out());
        assert!(outcome.into_option().is_none());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(room.listener_count(CONTENT_RESPONSE_CHANNEL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_waits_longer() {
        let room = MemoryRoom::new();
        let started = Instant::now();

        let outcome = client(&room).request_content("p1", true).await;

        assert!(outcome.is_timed_out());
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_tree_timeout() {
        let room = MemoryRoom::new();
        let started = Instant::now();

        let outcome = client(&room).request_visible_tree().await;

        assert!(outcome.is_timed_out());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(room.listener_count(TREE_RESPONSE_CHANNEL), 0);
    }

    #[tokio::test]
    async fn test_visible_tree_resolves() {
        let room = MemoryRoom::new();
        let responder = room.clone();
        let mut requests = room.on_message(TREE_REQUEST_CHANNEL);
        tokio::spawn(async move {
            requests.recv().await.unwrap();
            let reply = BroadcastEnvelope::new(None, TreePayload { tree: Some(json!({"root": ["p1"]})) });
            responder
                .send_message(TREE_RESPONSE_CHANNEL, serde_json::to_value(reply).unwrap())
                .await
                .unwrap();
        });

        let outcome = client(&room).request_visible_tree().await;
        assert_eq!(outcome, RequestOutcome::Resolved(Some(json!({"root": ["p1"]}))));
    }

    #[tokio::test]
    async fn test_oversized_request_fails_without_waiting() {
        let room = MemoryRoom::new();
        let config = ProtocolConfig { message_limit_bytes: 32, ..Default::default() };
        let client = SyncClient::new(Arc::new(room.clone()), config);

        let outcome = client.request_content(&"p".repeat(64), false).await;

        assert!(matches!(outcome, RequestOutcome::SendFailed(SendError::SizeExceeded { .. })));
        assert_eq!(room.listener_count(CONTENT_RESPONSE_CHANNEL), 0);
    }
}
