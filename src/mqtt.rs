use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, Transport};
use uuid::Uuid;

use crate::config::MqttConfig;

pub fn build_options(cfg: &MqttConfig, status_topic: &str) -> MqttOptions {
    let client_id = format!("s0pcm-mqtt-{}", Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_session(true);
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    // the broker marks us "interrupted" if the session dies without the
    // clean offline publish
    opts.set_last_will(LastWill::new(
        status_topic.to_string(),
        "interrupted",
        qos(cfg.qos),
        true,
    ));
    opts
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    AsyncClient::new(options, 50)
}

pub fn qos(v: u8) -> QoS {
    match v {
        2 => QoS::ExactlyOnce,
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_mapping() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
        assert_eq!(qos(7), QoS::AtLeastOnce);
    }
}
