use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub serial: SerialConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub homeassistant: HomeAssistantConfig,
    #[serde(default)]
    pub publication: PublicationConfig,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_qos() -> u8 {
    1
}
fn default_topic_prefix() -> String {
    "s0pcm".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// e.g. "/dev/ttyACM0"
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// No valid frame for this long means the link is down.
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_secs: u64,
    /// Replay recorded telegrams from a file instead of opening a device;
    /// a line reading "EOF" (or the end of the file) ends the run cleanly.
    pub replay_file: Option<String>,
}

fn default_baudrate() -> u32 {
    9600
}
fn default_silence_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_measurement_file")]
    pub measurement_file: String,
    /// Persist every Nth reconciled update; 1 = write-through. The
    /// shutdown flush always writes.
    #[serde(default = "default_write_every")]
    pub write_every: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            measurement_file: default_measurement_file(),
            write_every: default_write_every(),
        }
    }
}

fn default_measurement_file() -> String {
    "measurement.yaml".into()
}
fn default_write_every() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    #[serde(default = "default_true")]
    pub discovery: bool,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    /// Publish empty retained config payloads on clean shutdown so the
    /// entities disappear from Home Assistant.
    #[serde(default)]
    pub clear_on_exit: bool,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            discovery: true,
            discovery_prefix: default_discovery_prefix(),
            clear_on_exit: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_discovery_prefix() -> String {
    "homeassistant".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicationConfig {
    /// Suppress readings whose delta is zero.
    #[serde(default)]
    pub dedupe: bool,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            dedupe: false,
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_queue_depth() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Device register this channel maps to ("M1".."M5"). Registers not
    /// listed here are dropped and never published.
    pub input: String,
    /// Friendly name used in topics and entity ids, e.g. "water".
    pub name: String,
    #[serde(default)]
    pub kind: ChannelKind,
    /// Device pulses per physical unit, e.g. 1000 pulses/kWh.
    #[serde(default = "default_pulses_per_unit")]
    pub pulses_per_unit: u64,
    /// Unit label for discovery; defaults per kind.
    pub unit: Option<String>,
}

fn default_pulses_per_unit() -> u64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Electricity,
    Water,
    Gas,
}

impl ChannelKind {
    pub fn device_class(&self) -> &'static str {
        match self {
            ChannelKind::Electricity => "energy",
            ChannelKind::Water => "water",
            ChannelKind::Gas => "gas",
        }
    }

    pub fn default_unit(&self) -> &'static str {
        match self {
            ChannelKind::Electricity => "Wh",
            ChannelKind::Water => "L",
            ChannelKind::Gas => "m³",
        }
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then
    /// parse and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = fs::read_to_string(path)?;
        let expanded = expand_env_placeholders(&raw)?;
        let cfg: Self = serde_yaml::from_str(&expanded)?;

        anyhow::ensure!(
            !cfg.channels.is_empty(),
            "config must include at least one channel"
        );
        anyhow::ensure!(
            cfg.serial.silence_timeout_secs >= 1,
            "serial.silence_timeout_secs must be at least 1"
        );
        for ch in &cfg.channels {
            anyhow::ensure!(
                ch.pulses_per_unit >= 1,
                "channel {} must have pulses_per_unit >= 1",
                ch.name
            );
            anyhow::ensure!(
                !ch.name.is_empty() && !ch.name.contains('/'),
                "channel name {:?} must be non-empty and slash-free",
                ch.name
            );
        }
        let mut inputs: Vec<&str> = cfg.channels.iter().map(|c| c.input.as_str()).collect();
        inputs.sort_unstable();
        inputs.dedup();
        anyhow::ensure!(
            inputs.len() == cfg.channels.len(),
            "channel inputs must be unique"
        );

        Ok(cfg)
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$" (escape); a lone "$" passes through.
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
            }
            Some(open @ ('(' | '{')) => {
                it.next();
                let close = if open == '(' { ')' } else { '}' };
                let var = read_until(&mut it, close)
                    .with_context(|| format!("unterminated env placeholder: missing '{close}'"))?;
                let val = std::env::var(&var)
                    .with_context(|| format!("missing environment variable: {var}"))?;
                out.push_str(&val);
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

/// Read characters until `end`, consuming the closing delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_both_placeholder_styles() {
        std::env::set_var("S0PCM_TEST_HOST", "broker.local");
        let out = expand_env_placeholders("host: $(S0PCM_TEST_HOST):${S0PCM_TEST_HOST}").unwrap();
        assert_eq!(out, "host: broker.local:broker.local");
        std::env::remove_var("S0PCM_TEST_HOST");
    }

    #[test]
    fn dollar_escape_and_passthrough() {
        assert_eq!(expand_env_placeholders("a$$b").unwrap(), "a$b");
        assert_eq!(expand_env_placeholders("cost $5").unwrap(), "cost $5");
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        assert!(expand_env_placeholders("x: $(OOPS").is_err());
    }

    #[test]
    fn missing_variable_is_an_error() {
        assert!(expand_env_placeholders("x: $(S0PCM_TEST_DOES_NOT_EXIST)").is_err());
    }

    #[test]
    fn kind_maps_to_discovery_attributes() {
        assert_eq!(ChannelKind::Electricity.device_class(), "energy");
        assert_eq!(ChannelKind::Water.default_unit(), "L");
        assert_eq!(ChannelKind::Gas.device_class(), "gas");
    }
}
