//! Cache invalidation events for OIDC clients
//!
//! Client applications cache users and organizations. After a change commits,
//! every client with a webhook URL gets a signed event naming the changed
//! records. Events are handed to an [`InvalidationSink`]; delivery happens
//! elsewhere.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use squarelet_shared::ClientId;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{PgStore, Store};

type HmacSha256 = Hmac<Sha256>;

/// Kind of record an invalidation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationModel {
    User,
    Organization,
}

impl InvalidationModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Organization => "organization",
        }
    }
}

impl std::fmt::Display for InvalidationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hex HMAC-SHA256 over `"{timestamp}{model}{uuids...}"`, uuids joined with no separator
pub fn sign(secret: &str, timestamp: i64, model: &str, uuids: &[String]) -> BillingResult<String> {
    let message = format!("{}{}{}", timestamp, model, uuids.concat());
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Internal("Invalid client secret".to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    #[serde(rename = "type")]
    pub model: String,
    pub uuids: Vec<String>,
    pub timestamp: i64,
    pub signature: String,
}

impl InvalidationEvent {
    pub fn signed(secret: &str, timestamp: i64, model: &str, uuids: Vec<String>) -> BillingResult<Self> {
        let signature = sign(secret, timestamp, model, &uuids)?;
        Ok(Self {
            model: model.to_string(),
            uuids,
            timestamp,
            signature,
        })
    }
}

/// One event addressed to one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDelivery {
    pub client_id: ClientId,
    pub webhook_url: String,
    pub event: InvalidationEvent,
}

#[async_trait]
pub trait InvalidationSink: Send + Sync {
    async fn enqueue(&self, delivery: &PendingDelivery) -> BillingResult<()>;
}

/// Sink that keeps deliveries in memory
#[derive(Default)]
pub struct MemorySink {
    deliveries: Mutex<Vec<PendingDelivery>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliveries(&self) -> Vec<PendingDelivery> {
        self.deliveries.lock().await.clone()
    }
}

#[async_trait]
impl InvalidationSink for MemorySink {
    async fn enqueue(&self, delivery: &PendingDelivery) -> BillingResult<()> {
        self.deliveries.lock().await.push(delivery.clone());
        Ok(())
    }
}

/// Postgres outbox; a delivery process drains `cache_invalidation_outbox`
#[async_trait]
impl InvalidationSink for PgStore {
    async fn enqueue(&self, delivery: &PendingDelivery) -> BillingResult<()> {
        let payload = serde_json::to_value(&delivery.event)
            .map_err(|e| BillingError::Internal(format!("Failed to encode event: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO cache_invalidation_outbox (id, client_id, webhook_url, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(delivery.client_id.0)
        .bind(&delivery.webhook_url)
        .bind(payload)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct InvalidationDispatcher {
    store: Arc<dyn Store>,
    sink: Arc<dyn InvalidationSink>,
}

impl InvalidationDispatcher {
    pub fn new(store: Arc<dyn Store>, sink: Arc<dyn InvalidationSink>) -> Self {
        Self { store, sink }
    }

    /// Queue an event for every client with a webhook.
    ///
    /// Runs after the change has committed, so failures are logged and
    /// swallowed. Returns the number of events queued.
    pub async fn dispatch(&self, model: InvalidationModel, ids: &[Uuid]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let clients = match self.store.list_clients().await {
            Ok(clients) => clients,
            Err(e) => {
                tracing::warn!(error = %e, model = %model, "Failed to load clients for cache invalidation");
                return 0;
            }
        };

        let timestamp = OffsetDateTime::now_utc().unix_timestamp();
        let uuids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut queued = 0;

        for client in clients {
            let Some(webhook_url) = client.webhook_url.clone() else {
                continue;
            };
            let event = match InvalidationEvent::signed(
                &client.secret,
                timestamp,
                model.as_str(),
                uuids.clone(),
            ) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(client_id = %client.id, error = %e, "Failed to sign cache invalidation");
                    continue;
                }
            };
            let delivery = PendingDelivery {
                client_id: client.id,
                webhook_url,
                event,
            };
            match self.sink.enqueue(&delivery).await {
                Ok(()) => queued += 1,
                Err(e) => {
                    tracing::warn!(client_id = %client.id, error = %e, "Failed to queue cache invalidation");
                }
            }
        }

        tracing::debug!(model = %model, count = ids.len(), queued, "Dispatched cache invalidations");
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use squarelet_shared::{Client, OrgId};

    #[test]
    fn test_signature_matches_known_vector() {
        let uuids = vec!["abc".to_string(), "def".to_string()];
        let signature = sign("s", 1000, "Organization", &uuids).unwrap();
        assert_eq!(
            signature,
            "18f8a2b8ed88b67bee395ddd143b1cdfdb273c39ca6d9cc8829d36a56c8e7e11"
        );
    }

    #[test]
    fn test_event_serializes_model_as_type() {
        let event =
            InvalidationEvent::signed("s", 1000, "user", vec!["abc".to_string()]).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["timestamp"], 1000);
        assert!(json.get("model").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_only_to_clients_with_webhooks() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let owner = OrgId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_client(&Client {
            id: ClientId::new(),
            name: "MuckRock".to_string(),
            owner,
            secret: "muckrock-secret".to_string(),
            webhook_url: Some("https://www.muckrock.com/squarelet/webhook/".to_string()),
        })
        .await
        .unwrap();
        tx.insert_client(&Client {
            id: ClientId::new(),
            name: "Silent".to_string(),
            owner,
            secret: "silent-secret".to_string(),
            webhook_url: None,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let dispatcher = InvalidationDispatcher::new(store, sink.clone());
        let id = Uuid::new_v4();
        let queued = dispatcher
            .dispatch(InvalidationModel::Organization, &[id])
            .await;
        assert_eq!(queued, 1);

        let deliveries = sink.deliveries().await;
        let event = &deliveries[0].event;
        assert_eq!(event.model, "organization");
        assert_eq!(event.uuids, vec![id.to_string()]);
        assert_eq!(
            event.signature,
            sign("muckrock-secret", event.timestamp, "organization", &event.uuids).unwrap()
        );
    }
}
