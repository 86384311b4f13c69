use pretty_assertions::assert_eq;
use serial_test::serial;

use s0pcm_mqtt::config::{ChannelKind, Config};

fn write_temp(tag: &str, content: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("s0pcm-config-{tag}-{}.yaml", std::process::id()));
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn loads_full_config_with_defaults() {
    let path = write_temp(
        "full",
        r#"
mqtt:
  host: "broker.local"
  port: 1883
  username: "user"
  password: "secret"

serial:
  port: "/dev/ttyACM0"

channels:
  - input: "M1"
    name: "jacuzzi"
    kind: electricity
    pulses_per_unit: 1000
    unit: "kWh"
  - input: "M3"
    name: "water"
    kind: water
"#,
    );

    let cfg = Config::load(&path).unwrap();

    assert_eq!(cfg.mqtt.host, "broker.local");
    assert_eq!(cfg.mqtt.qos, 1);
    assert_eq!(cfg.mqtt.topic_prefix, "s0pcm");
    assert_eq!(cfg.serial.baudrate, 9600);
    assert_eq!(cfg.serial.silence_timeout_secs, 30);
    assert_eq!(cfg.storage.measurement_file, "measurement.yaml");
    assert_eq!(cfg.storage.write_every, 1);
    assert!(cfg.homeassistant.discovery);
    assert!(!cfg.publication.dedupe);

    assert_eq!(cfg.channels.len(), 2);
    assert_eq!(cfg.channels[0].pulses_per_unit, 1000);
    assert_eq!(cfg.channels[1].kind, ChannelKind::Water);
    // scale factor defaults to 1 pulse per unit
    assert_eq!(cfg.channels[1].pulses_per_unit, 1);

    std::fs::remove_file(&path).ok();
}

#[test]
#[serial]
fn expands_env_placeholders_in_credentials() {
    std::env::set_var("S0PCM_TEST_PASSWORD", "hunter2");
    let path = write_temp(
        "env",
        r#"
mqtt:
  host: "broker.local"
  port: 1883
  password: "${S0PCM_TEST_PASSWORD}"

serial:
  port: "/dev/ttyACM0"

channels:
  - input: "M1"
    name: "power"
"#,
    );

    let cfg = Config::load(&path).unwrap();
    assert_eq!(cfg.mqtt.password.as_deref(), Some("hunter2"));

    std::env::remove_var("S0PCM_TEST_PASSWORD");
    std::fs::remove_file(&path).ok();
}

#[test]
#[serial]
fn missing_env_placeholder_fails_load() {
    let path = write_temp(
        "env-missing",
        r#"
mqtt:
  host: "broker.local"
  port: 1883
  password: "${S0PCM_TEST_NOT_SET}"

serial:
  port: "/dev/ttyACM0"

channels:
  - input: "M1"
    name: "power"
"#,
    );

    assert!(Config::load(&path).is_err());
    std::fs::remove_file(&path).ok();
}

#[test]
fn rejects_empty_channel_list() {
    let path = write_temp(
        "no-channels",
        r#"
mqtt:
  host: "broker.local"
  port: 1883

serial:
  port: "/dev/ttyACM0"

channels: []
"#,
    );

    assert!(Config::load(&path).is_err());
    std::fs::remove_file(&path).ok();
}

#[test]
fn rejects_duplicate_inputs() {
    let path = write_temp(
        "dup-inputs",
        r#"
mqtt:
  host: "broker.local"
  port: 1883

serial:
  port: "/dev/ttyACM0"

channels:
  - input: "M1"
    name: "a"
  - input: "M1"
    name: "b"
"#,
    );

    assert!(Config::load(&path).is_err());
    std::fs::remove_file(&path).ok();
}

#[test]
fn rejects_zero_scale_factor() {
    let path = write_temp(
        "zero-scale",
        r#"
mqtt:
  host: "broker.local"
  port: 1883

serial:
  port: "/dev/ttyACM0"

channels:
  - input: "M1"
    name: "power"
    pulses_per_unit: 0
"#,
    );

    assert!(Config::load(&path).is_err());
    std::fs::remove_file(&path).ok();
}

#[test]
fn rejects_slash_in_channel_name() {
    let path = write_temp(
        "slash-name",
        r#"
mqtt:
  host: "broker.local"
  port: 1883

serial:
  port: "/dev/ttyACM0"

channels:
  - input: "M1"
    name: "a/b"
"#,
    );

    assert!(Config::load(&path).is_err());
    std::fs::remove_file(&path).ok();
}
