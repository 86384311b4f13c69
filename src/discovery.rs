use serde_json::json;

use crate::config::{ChannelConfig, Config};

/// A retained message for the Home Assistant discovery convention.
/// https://www.home-assistant.io/docs/mqtt/discovery/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: String,
}

/// Descriptors for the device and every configured channel. Published at
/// startup and after every broker reconnect so entities survive a broker
/// restart.
pub fn messages(cfg: &Config, version: &str) -> Vec<DiscoveryMessage> {
    let prefix = &cfg.mqtt.topic_prefix;
    let mut out = Vec::with_capacity(cfg.channels.len() + 1);

    out.push(DiscoveryMessage {
        topic: device_topic(cfg),
        payload: json!({
            "name": "s0pcm",
            "unique_id": format!("{prefix}-device"),
            "state_topic": format!("{prefix}/status"),
            "icon": "mdi:home-automation",
            "device": {
                "identifiers": [prefix],
                "name": "s0pcm",
                "model": "S0 Pulse Counter Module",
                "sw_version": version,
            },
        })
        .to_string(),
    });

    for ch in &cfg.channels {
        let unit = ch
            .unit
            .clone()
            .unwrap_or_else(|| ch.kind.default_unit().to_string());
        out.push(DiscoveryMessage {
            topic: channel_topic(cfg, ch),
            payload: json!({
                "name": ch.name,
                "unique_id": format!("{prefix}-{}", ch.name),
                "state_topic": format!("{prefix}/{}/total", ch.name),
                "unit_of_measurement": unit,
                "device_class": ch.kind.device_class(),
                "state_class": "total_increasing",
                "icon": "mdi:counter",
                "device": { "identifiers": [prefix] },
            })
            .to_string(),
        });
    }

    out
}

/// Empty retained payloads deregister the entities on clean shutdown.
pub fn clear_messages(cfg: &Config) -> Vec<DiscoveryMessage> {
    let mut out = vec![DiscoveryMessage {
        topic: device_topic(cfg),
        payload: String::new(),
    }];
    for ch in &cfg.channels {
        out.push(DiscoveryMessage {
            topic: channel_topic(cfg, ch),
            payload: String::new(),
        });
    }
    out
}

fn device_topic(cfg: &Config) -> String {
    format!(
        "{}/sensor/{}/{}/config",
        cfg.homeassistant.discovery_prefix, cfg.mqtt.topic_prefix, cfg.mqtt.topic_prefix
    )
}

fn channel_topic(cfg: &Config, ch: &ChannelConfig) -> String {
    format!(
        "{}/sensor/{}/{}/config",
        cfg.homeassistant.discovery_prefix, cfg.mqtt.topic_prefix, ch.name
    )
}
