use super::{ChangeEvent, ChangeStream, Ledger, Topic};
use crate::model::{Asset, DeviceModel, DeviceUpdateRequest, MetricReadingsRecord, Requirements};
use anyhow::{bail, Context, Result};
use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

/// Which ledger adapter the agent talks to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    #[default]
    Nats,
    /// In-process ledger, for debug environments
    Memory,
}

/// Ledger connection configuration
#[derive(Clone, Debug, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub mode: LedgerMode,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_readings_stream")]
    pub readings_stream: String,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
}

fn default_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn default_subject_prefix() -> String {
    "ledger".to_string()
}

fn default_readings_stream() -> String {
    "LEDGER_READINGS".to_string()
}

fn default_max_age_days() -> i64 {
    7
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mode: LedgerMode::default(),
            url: default_url(),
            subject_prefix: default_subject_prefix(),
            readings_stream: default_readings_stream(),
            max_age_days: default_max_age_days(),
        }
    }
}

/// Reply to a ledger mutation request
#[derive(Deserialize)]
struct MutationReply {
    #[serde(default)]
    error: Option<String>,
}

/// Ledger adapter over NATS.
///
/// - change notifications: `{prefix}.{topic}.changes`
/// - queries: request/reply on `{prefix}.{topic}.query`
/// - device updates: request/reply on `{prefix}.devices.update`
/// - readings: JetStream publish on `{prefix}.readings.{asset_id}`
pub struct NatsLedger {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: LedgerConfig,
}

impl NatsLedger {
    /// Connect to NATS and make sure the readings stream exists
    pub async fn connect(config: LedgerConfig) -> Result<Self> {
        info!("Connecting to ledger at {}", config.url);

        let client = async_nats::connect(&config.url)
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());

        let ledger = Self {
            client,
            jetstream,
            config,
        };

        ledger.ensure_stream().await?;

        Ok(ledger)
    }

    async fn ensure_stream(&self) -> Result<()> {
        let name = &self.config.readings_stream;

        if self.jetstream.get_stream(name).await.is_ok() {
            info!("Stream '{}' already exists", name);
            return Ok(());
        }

        info!("Stream '{}' does not exist, creating...", name);

        let stream_config = stream::Config {
            name: name.clone(),
            subjects: vec![format!("{}.readings.>", self.config.subject_prefix)],
            max_age: std::time::Duration::from_secs((self.config.max_age_days * 86400) as u64),
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        self.jetstream
            .create_stream(stream_config)
            .await
            .context("Failed to create readings stream")?;

        info!("Created JetStream stream '{}'", name);
        Ok(())
    }

    fn subject(&self, topic: &str, leaf: &str) -> String {
        format!("{}.{}.{}", self.config.subject_prefix, topic, leaf)
    }

    async fn request<P, T>(&self, subject: String, payload: &P) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_vec(payload).context("Failed to serialize ledger request")?;

        let reply = self
            .client
            .request(subject.clone(), body.into())
            .await
            .with_context(|| format!("Ledger request to '{}' failed", subject))?;

        serde_json::from_slice(&reply.payload)
            .with_context(|| format!("Failed to decode ledger reply from '{}'", subject))
    }
}

#[async_trait]
impl Ledger for NatsLedger {
    async fn subscribe(&self, topic: Topic) -> Result<ChangeStream> {
        let subject = self.subject(&topic.to_string(), "changes");

        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("Failed to subscribe to '{}'", subject))?;

        info!(subject = %subject, "Subscribed to ledger changes");

        let events = subscriber.filter_map(move |msg| async move {
            match serde_json::from_slice::<ChangeEvent>(&msg.payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Failed to decode change notification, skipping");
                    None
                }
            }
        });

        Ok(events.boxed())
    }

    async fn post_readings(&self, record: &MetricReadingsRecord) -> Result<()> {
        let subject = self.subject("readings", &record.asset_id);
        let payload = serde_json::to_vec(record).context("Failed to serialize readings to JSON")?;

        debug!(
            record_id = %record.record_id,
            asset_id = %record.asset_id,
            subject = %subject,
            "Posting readings to ledger"
        );

        self.jetstream
            .publish(subject.clone(), payload.into())
            .await
            .context(format!("Failed to publish readings to subject '{}'", subject))?
            .await
            .context("Failed to await publish ack")?;

        Ok(())
    }

    async fn update_device(&self, device_id: &str, patch: &DeviceUpdateRequest) -> Result<()> {
        let reply: MutationReply = self
            .request(
                self.subject("devices", "update"),
                &json!({ "id": device_id, "patch": patch }),
            )
            .await?;

        if let Some(error) = reply.error {
            bail!("Ledger rejected device update: {}", error);
        }

        Ok(())
    }

    async fn query_device(&self, device_id: &str) -> Result<Option<DeviceModel>> {
        self.request(self.subject("devices", "query"), &json!({ "id": device_id }))
            .await
    }

    async fn query_assets(&self) -> Result<Vec<Asset>> {
        self.request(self.subject("assets", "query"), &json!({})).await
    }

    async fn query_requirements(&self, asset_ids: &[String]) -> Result<Vec<Requirements>> {
        self.request(
            self.subject("requirements", "query"),
            &json!({ "asset_ids": asset_ids }),
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .context("Failed to flush ledger connection")?;
        info!("Ledger connection released");
        Ok(())
    }
}
