use std::collections::HashMap;

use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ChannelConfig, Config};
use crate::error::{AppError, Result};
use crate::meter::{format_scaled, Reading};
use crate::mqtt;

#[derive(Debug, Clone)]
pub enum PublishCmd {
    /// Reconciled channel reading: delta + running total.
    Reading(Reading),
    /// Serial link availability changed.
    Availability(bool),
    /// Pre-rendered retained message (discovery descriptors, sw-version).
    Retained { topic: String, payload: String },
}

/// Sending half of the publication queue. Never blocks the serial pipeline:
/// when the broker task falls behind, the command is dropped and logged.
/// Totals are already durable at this point, so a dropped publication loses
/// no accounting state.
#[derive(Clone)]
pub struct PublishQueue {
    tx: mpsc::Sender<PublishCmd>,
}

impl PublishQueue {
    pub fn push(&self, cmd: PublishCmd) {
        if self.tx.try_send(cmd).is_err() {
            warn!("publish queue full; dropping message");
        }
    }
}

pub fn queue(depth: usize) -> (PublishQueue, mpsc::Receiver<PublishCmd>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (PublishQueue { tx }, rx)
}

/// Owns the broker-facing topic layout and drains the publication queue on
/// its own task. Reconnect/backoff is the event loop's concern, not ours.
pub struct Publisher {
    client: AsyncClient,
    topic_prefix: String,
    qos: QoS,
    channels: HashMap<String, ChannelConfig>,
}

impl Publisher {
    pub fn new(client: AsyncClient, cfg: &Config) -> Self {
        let channels = cfg
            .channels
            .iter()
            .map(|c| (c.input.clone(), c.clone()))
            .collect();
        Self {
            client,
            topic_prefix: cfg.mqtt.topic_prefix.trim_end_matches('/').to_string(),
            qos: mqtt::qos(cfg.mqtt.qos),
            channels,
        }
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }

    pub async fn run(self, mut rx: mpsc::Receiver<PublishCmd>) {
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = self.dispatch(cmd).await {
                warn!(error = %e, "publish failed");
            }
        }
        debug!("publish queue closed");
    }

    async fn dispatch(&self, cmd: PublishCmd) -> Result<()> {
        match cmd {
            PublishCmd::Reading(r) => {
                // registers without a configured channel are never published
                let Some(ch) = self.channels.get(&r.input) else {
                    return Ok(());
                };
                let base = format!("{}/{}", self.topic_prefix, ch.name);
                self.publish(
                    format!("{base}/delta"),
                    format_scaled(r.delta_pulses, ch.pulses_per_unit),
                    false,
                )
                .await?;
                self.publish(
                    format!("{base}/total"),
                    format_scaled(r.total_pulses, ch.pulses_per_unit),
                    true,
                )
                .await?;
            }
            PublishCmd::Availability(online) => {
                let payload = if online { "online" } else { "offline" };
                self.publish(self.status_topic(), payload.to_string(), true)
                    .await?;
            }
            PublishCmd::Retained { topic, payload } => {
                self.publish(topic, payload, true).await?;
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: String, payload: String, retain: bool) -> Result<()> {
        self.client
            .publish(topic, self.qos, retain, payload.into_bytes())
            .await
            .map_err(|e| AppError::Mqtt(e.to_string()))
    }
}
